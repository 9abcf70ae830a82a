//! Matrix client-server API adapter over reqwest.
//!
//! Covers the unencrypted half of the messaging collaborator: sending,
//! redacting, membership and login. End-to-end encryption is provided by an
//! external client implementing [`MessagingClient`]; this adapter refuses to
//! send a notice that asks for encryption.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::matrix::client::{MessagingClient, Notice, SessionCredentials};
use crate::matrix::events::Membership;
use crate::matrix::ids::{EventId, RoomId, UserId};

const DEVICE_DISPLAY_NAME: &str = "botkeeper";

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: String,
    access_token: String,
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinedMembersResponse {
    joined: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

/// Client for a single logged-in account on the homeserver.
pub struct HomeserverClient {
    http: Client,
    base_url: String,
    user_id: UserId,
    device_id: String,
    access_token: SecretString,
    members: Mutex<HashMap<RoomId, HashMap<UserId, Membership>>>,
}

impl std::fmt::Debug for HomeserverClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomeserverClient")
            .field("base_url", &self.base_url)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Build the HTTP client shared by the homeserver and admin adapters.
pub fn build_http_client(timeout: Duration) -> Result<Client, ChannelError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ))
        .build()
        .map_err(ChannelError::Http)
}

impl HomeserverClient {
    /// Log in with a password and return a client bound to that session.
    ///
    /// With `device_id` the homeserver resumes that device instead of
    /// creating a new one.
    pub async fn login(
        http: Client,
        base_url: &str,
        username: &str,
        password: &SecretString,
        device_id: Option<&str>,
    ) -> Result<Self, ChannelError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let session = password_login(&http, &base_url, username, password, device_id).await?;
        tracing::info!(
            user_id = %session.user_id,
            device_id = %session.device_id,
            "Logged in to homeserver"
        );
        Ok(Self {
            http,
            base_url,
            user_id: session.user_id,
            device_id: session.device_id,
            access_token: session.access_token,
            members: Mutex::new(HashMap::new()),
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    /// Record a membership change seen in sync.
    pub fn record_membership(&self, room_id: &RoomId, user_id: &UserId, membership: Membership) {
        let Ok(mut members) = self.members.lock() else {
            return;
        };
        let room = members.entry(room_id.clone()).or_default();
        match membership {
            Membership::Join | Membership::Invite => {
                room.insert(user_id.clone(), membership);
            }
            _ => {
                room.remove(user_id);
            }
        }
    }

    /// Drop cached state for a room the agent left.
    pub fn forget_room(&self, room_id: &RoomId) {
        if let Ok(mut members) = self.members.lock() {
            members.remove(room_id);
        }
    }

    pub(crate) async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<T, ChannelError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .http
            .request(method, &url)
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
            .map_err(|e| ChannelError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })?;
        decode_response(path, response).await
    }
}

fn room_path(room_id: &RoomId, rest: &str) -> String {
    format!(
        "/_matrix/client/v3/rooms/{}/{}",
        urlencoding::encode(room_id.as_str()),
        rest
    )
}

async fn decode_response<T: DeserializeOwned>(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<T, ChannelError> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if !status.is_success() {
        let parsed: MatrixErrorBody =
            serde_json::from_slice(&bytes).unwrap_or_else(|_| MatrixErrorBody {
                errcode: "M_UNKNOWN".to_string(),
                error: String::from_utf8_lossy(&bytes).into_owned(),
            });
        return Err(ChannelError::Matrix {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            errcode: parsed.errcode,
            message: parsed.error,
        });
    }
    serde_json::from_slice(&bytes).map_err(|e| ChannelError::InvalidResponse {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}

fn login_body(user: &str, password: &SecretString, device_id: Option<&str>) -> Value {
    let mut body = json!({
        "type": "m.login.password",
        "identifier": { "type": "m.id.user", "user": user },
        "password": password.expose_secret(),
        "initial_device_display_name": DEVICE_DISPLAY_NAME,
    });
    if let Some(device_id) = device_id {
        body["device_id"] = json!(device_id);
    }
    body
}

async fn password_login(
    http: &Client,
    base_url: &str,
    user: &str,
    password: &SecretString,
    device_id: Option<&str>,
) -> Result<SessionCredentials, ChannelError> {
    let endpoint = "/_matrix/client/v3/login";
    let response = http
        .post(format!("{}{}", base_url, endpoint))
        .json(&login_body(user, password, device_id))
        .send()
        .await
        .map_err(|e| ChannelError::LoginFailed {
            user: user.to_string(),
            reason: e.to_string(),
        })?;
    let login: LoginResponse = decode_response(endpoint, response).await?;
    Ok(SessionCredentials {
        user_id: UserId::parse(login.user_id)?,
        device_id: login.device_id,
        access_token: SecretString::from(login.access_token),
    })
}

#[async_trait]
impl MessagingClient for HomeserverClient {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn send_notice(&self, room_id: &RoomId, notice: Notice) -> Result<EventId, ChannelError> {
        if notice.encrypted {
            return Err(ChannelError::EncryptionUnavailable);
        }
        let mut content = json!({
            "msgtype": "m.notice",
            "body": notice.body,
        });
        if let Some(reply_to) = &notice.reply_to {
            content["m.relates_to"] = json!({
                "m.in_reply_to": { "event_id": reply_to.as_str() }
            });
        }
        let path = room_path(
            room_id,
            &format!("send/m.room.message/{}", Uuid::new_v4().simple()),
        );
        let response: EventIdResponse = self.request(Method::PUT, &path, &[], Some(content)).await?;
        EventId::parse(response.event_id)
    }

    async fn redact(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        reason: Option<&str>,
    ) -> Result<(), ChannelError> {
        let path = room_path(
            room_id,
            &format!(
                "redact/{}/{}",
                urlencoding::encode(event_id.as_str()),
                Uuid::new_v4().simple()
            ),
        );
        let body = match reason {
            Some(reason) => json!({ "reason": reason }),
            None => json!({}),
        };
        let _: Value = self.request(Method::PUT, &path, &[], Some(body)).await?;
        Ok(())
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<(), ChannelError> {
        let path = room_path(room_id, "join");
        let _: Value = self
            .request(Method::POST, &path, &[], Some(json!({})))
            .await?;
        self.record_membership(room_id, &self.user_id, Membership::Join);
        Ok(())
    }

    async fn leave_room(&self, room_id: &RoomId, reason: &str) -> Result<(), ChannelError> {
        let path = room_path(room_id, "leave");
        let _: Value = self
            .request(Method::POST, &path, &[], Some(json!({ "reason": reason })))
            .await?;
        self.forget_room(room_id);
        Ok(())
    }

    async fn joined_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, ChannelError> {
        let path = room_path(room_id, "joined_members");
        let response: JoinedMembersResponse = self.request(Method::GET, &path, &[], None).await?;
        let mut members = Vec::with_capacity(response.joined.len());
        for user in response.joined.into_keys() {
            let user = UserId::parse(user)?;
            self.record_membership(room_id, &user, Membership::Join);
            members.push(user);
        }
        Ok(members)
    }

    async fn cached_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, ChannelError> {
        let members = self
            .members
            .lock()
            .map_err(|_| ChannelError::InvalidResponse {
                endpoint: "member cache".to_string(),
                reason: "member cache lock poisoned".to_string(),
            })?;
        Ok(members
            .get(room_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_read(&self, room_id: &RoomId, event_id: &EventId) -> Result<(), ChannelError> {
        let path = room_path(
            room_id,
            &format!("receipt/m.read/{}", urlencoding::encode(event_id.as_str())),
        );
        let _: Value = self
            .request(Method::POST, &path, &[], Some(json!({})))
            .await?;
        Ok(())
    }

    async fn login(
        &self,
        user_id: &UserId,
        password: &SecretString,
    ) -> Result<SessionCredentials, ChannelError> {
        password_login(&self.http, &self.base_url, user_id.as_str(), password, None)
            .await
            .map_err(|e| match e {
                ChannelError::LoginFailed { .. } => e,
                other => ChannelError::LoginFailed {
                    user: user_id.to_string(),
                    reason: other.to_string(),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_path_escapes_room_id() {
        let room = RoomId::parse("!abc:example.com").unwrap();
        assert_eq!(
            room_path(&room, "join"),
            "/_matrix/client/v3/rooms/%21abc%3Aexample.com/join"
        );
    }

    #[test]
    fn login_body_resumes_known_device() {
        let password = SecretString::from("hunter2");
        let fresh = login_body("botbot", &password, None);
        assert!(fresh.get("device_id").is_none());
        assert_eq!(fresh["identifier"]["user"], "botbot");

        let resumed = login_body("botbot", &password, Some("AGENTDEV"));
        assert_eq!(resumed["device_id"], "AGENTDEV");
        assert_eq!(resumed["initial_device_display_name"], DEVICE_DISPLAY_NAME);
    }

    #[test]
    fn plaintext_notice_has_no_relation() {
        let notice = Notice::plaintext("hi");
        assert!(!notice.encrypted);
        assert!(notice.reply_to.is_none());
        let event = EventId::parse("$evt").unwrap();
        assert_eq!(notice.in_reply_to(event.clone()).reply_to, Some(event));
    }
}
