use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_env};
use crate::error::ConfigError;

/// Administrative API access.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Shared secret for Synapse's admin registration endpoint.
    pub register_secret: Option<SecretString>,
    /// External registration API. Takes precedence over the shared secret.
    pub registration_api_url: Option<String>,
    pub timeout: Duration,
}

impl AdminConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let register_secret = optional_env("REGISTER_SECRET")?.map(SecretString::from);
        let registration_api_url = optional_env("REGISTRATION_API_URL")?
            .map(|url| url.trim_end_matches('/').to_string());
        let timeout_secs: u64 = parse_env("ADMIN_TIMEOUT_SECS", 30, "a positive integer")?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ADMIN_TIMEOUT_SECS".to_string(),
                message: "must be > 0".to_string(),
            });
        }
        if register_secret.is_none() && registration_api_url.is_none() {
            tracing::warn!(
                "Neither REGISTER_SECRET nor REGISTRATION_API_URL is set; `create` will fail"
            );
        }
        Ok(Self {
            register_secret,
            registration_api_url,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}
