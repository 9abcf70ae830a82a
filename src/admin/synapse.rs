//! Synapse admin API client, with an optional external registration API.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use sha1::Sha1;

use crate::admin::{AccountInfo, AdminApi, DeviceInfo};
use crate::error::AdminError;
use crate::matrix::UserId;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Deserialize)]
struct AvailabilityResponse {
    #[serde(default)]
    available: bool,
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    name: String,
    #[serde(default)]
    creation_ts: i64,
    #[serde(default)]
    deactivated: bool,
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<RawDevice>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    device_id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    last_seen_ts: Option<i64>,
    #[serde(default)]
    last_seen_ip: Option<String>,
}

impl From<RawDevice> for DeviceInfo {
    fn from(raw: RawDevice) -> Self {
        Self {
            device_id: raw.device_id,
            display_name: raw.display_name,
            last_seen: raw
                .last_seen_ts
                .filter(|ts| *ts > 0)
                .and_then(|ts| Utc.timestamp_millis_opt(ts).single()),
            last_seen_ip: raw.last_seen_ip.filter(|ip| !ip.is_empty()),
        }
    }
}

/// Talks to `/_synapse/admin` with the service account's token.
pub struct SynapseAdminClient {
    http: Client,
    base_url: String,
    access_token: SecretString,
    register_secret: Option<SecretString>,
    registration_api_url: Option<String>,
}

impl std::fmt::Debug for SynapseAdminClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynapseAdminClient")
            .field("base_url", &self.base_url)
            .field("access_token", &"[REDACTED]")
            .field(
                "register_secret",
                &self.register_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("registration_api_url", &self.registration_api_url)
            .finish()
    }
}

impl SynapseAdminClient {
    pub fn new(http: Client, base_url: &str, access_token: SecretString) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            register_secret: None,
            registration_api_url: None,
        }
    }

    pub fn with_register_secret(mut self, secret: Option<SecretString>) -> Self {
        self.register_secret = secret;
        self
    }

    pub fn with_registration_api(mut self, url: Option<String>) -> Self {
        self.registration_api_url = url.map(|u| u.trim_end_matches('/').to_string());
        self
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<(StatusCode, String), AdminError> {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, endpoint))
            .bearer_auth(self.access_token.expose_secret());
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| AdminError::RequestFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }

    async fn admin_json<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<T, AdminError> {
        let (status, text) = self.send(method, endpoint, query, body).await?;
        if !status.is_success() {
            return Err(AdminError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| AdminError::RequestFailed {
            endpoint: endpoint.to_string(),
            reason: format!("invalid response body: {}", e),
        })
    }

    async fn register_shared_secret(
        &self,
        secret: &SecretString,
        localpart: &str,
        password: &SecretString,
    ) -> Result<(), AdminError> {
        let endpoint = "/_synapse/admin/v1/register";
        let nonce: NonceResponse = self.admin_json(Method::GET, endpoint, &[], None).await?;
        let mac = registration_mac(secret, &nonce.nonce, localpart, password)?;
        let _: Value = self
            .admin_json(
                Method::POST,
                endpoint,
                &[],
                Some(json!({
                    "nonce": nonce.nonce,
                    "username": localpart,
                    "password": password.expose_secret(),
                    "user_type": "bot",
                    "inhibit_login": true,
                    "admin": false,
                    "mac": mac,
                })),
            )
            .await?;
        Ok(())
    }

    async fn register_external(
        &self,
        api_url: &str,
        localpart: &str,
        password: &SecretString,
    ) -> Result<(), AdminError> {
        let endpoint = format!("/admin/bot/{}", urlencoding::encode(localpart));
        let response = self
            .http
            .post(format!("{}{}", api_url, endpoint))
            .json(&json!({
                "username": localpart,
                "password": password.expose_secret(),
            }))
            .send()
            .await
            .map_err(|e| AdminError::RequestFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(());
        }
        Err(AdminError::Status {
            endpoint,
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

fn user_path(version: &str, user_id: &UserId, rest: &str) -> String {
    format!(
        "/_synapse/admin/{}/users/{}{}",
        version,
        urlencoding::encode(user_id.as_str()),
        rest
    )
}

/// Shared-secret registration MAC: hex HMAC-SHA1 over the NUL-joined fields.
fn registration_mac(
    secret: &SecretString,
    nonce: &str,
    localpart: &str,
    password: &SecretString,
) -> Result<String, AdminError> {
    let mut mac = HmacSha1::new_from_slice(secret.expose_secret().as_bytes()).map_err(|e| {
        AdminError::RequestFailed {
            endpoint: "/_synapse/admin/v1/register".to_string(),
            reason: format!("invalid registration secret: {}", e),
        }
    })?;
    let fields: [&[u8]; 5] = [
        nonce.as_bytes(),
        localpart.as_bytes(),
        password.expose_secret().as_bytes(),
        b"notadmin",
        b"bot",
    ];
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            mac.update(&[0]);
        }
        mac.update(field);
    }
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl AdminApi for SynapseAdminClient {
    async fn is_username_available(&self, localpart: &str) -> Result<bool, AdminError> {
        if let Some(api_url) = &self.registration_api_url {
            let endpoint = format!("/check-username/{}", urlencoding::encode(localpart));
            let response = self
                .http
                .get(format!("{}{}", api_url, endpoint))
                .send()
                .await
                .map_err(|e| AdminError::RequestFailed {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })?;
            let parsed: AvailabilityResponse =
                response.json().await.map_err(|e| AdminError::RequestFailed {
                    endpoint,
                    reason: format!("invalid response body: {}", e),
                })?;
            return Ok(parsed.available);
        }

        let endpoint = "/_synapse/admin/v1/username_available";
        let (status, text) = self
            .send(Method::GET, endpoint, &[("username", localpart)], None)
            .await?;
        if status.is_success() {
            let parsed: AvailabilityResponse =
                serde_json::from_str(&text).map_err(|e| AdminError::RequestFailed {
                    endpoint: endpoint.to_string(),
                    reason: format!("invalid response body: {}", e),
                })?;
            return Ok(parsed.available);
        }
        if text.contains("M_USER_IN_USE") {
            return Ok(false);
        }
        Err(AdminError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: text,
        })
    }

    async fn register_user(
        &self,
        localpart: &str,
        password: &SecretString,
    ) -> Result<(), AdminError> {
        if let Some(api_url) = &self.registration_api_url {
            self.register_external(api_url, localpart, password).await
        } else if let Some(secret) = &self.register_secret {
            self.register_shared_secret(secret, localpart, password)
                .await
        } else {
            Err(AdminError::RegistrationUnavailable)
        }
    }

    async fn reset_password(
        &self,
        user_id: &UserId,
        password: &SecretString,
    ) -> Result<(), AdminError> {
        let endpoint = format!(
            "/_synapse/admin/v1/reset_password/{}",
            urlencoding::encode(user_id.as_str())
        );
        let _: Value = self
            .admin_json(
                Method::POST,
                &endpoint,
                &[],
                Some(json!({
                    "new_password": password.expose_secret(),
                    "logout_devices": true,
                })),
            )
            .await?;
        Ok(())
    }

    async fn account_info(&self, user_id: &UserId) -> Result<AccountInfo, AdminError> {
        let endpoint = user_path("v2", user_id, "");
        let user: UserResponse = self.admin_json(Method::GET, &endpoint, &[], None).await?;
        let parsed_id = UserId::parse(user.name).map_err(|e| AdminError::RequestFailed {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        Ok(AccountInfo {
            user_id: parsed_id,
            created_at: Utc
                .timestamp_opt(user.creation_ts, 0)
                .single()
                .unwrap_or_default(),
            deactivated: user.deactivated,
        })
    }

    async fn list_devices(&self, user_id: &UserId) -> Result<Vec<DeviceInfo>, AdminError> {
        let endpoint = user_path("v2", user_id, "/devices");
        let response: DevicesResponse = self.admin_json(Method::GET, &endpoint, &[], None).await?;
        Ok(response.devices.into_iter().map(DeviceInfo::from).collect())
    }

    async fn deactivate_user(&self, user_id: &UserId) -> Result<(), AdminError> {
        let endpoint = format!(
            "/_synapse/admin/v1/deactivate/{}",
            urlencoding::encode(user_id.as_str())
        );
        let _: Value = self
            .admin_json(Method::POST, &endpoint, &[], Some(json!({ "erase": false })))
            .await?;
        Ok(())
    }
}
