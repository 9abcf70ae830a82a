use std::time::Duration;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_env, required_env};
use crate::error::ConfigError;

/// Connection to the homeserver and the agent's own account.
#[derive(Debug, Clone)]
pub struct HomeserverConfig {
    pub url: String,
    pub username: String,
    pub password: SecretString,
    /// Servers besides the agent's own whose users may open conversations.
    pub allowed_servers: Vec<String>,
    pub sync_timeout: Duration,
}

impl HomeserverConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let url = required_env("HOMESERVER_URL", "Set it to the homeserver base URL")?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                key: "HOMESERVER_URL".to_string(),
                message: format!("must be an http(s) URL, got '{url}'"),
            });
        }

        let username = required_env("BOT_USERNAME", "Set it to the agent's account localpart")?;
        let password = SecretString::from(required_env(
            "BOT_PASSWORD",
            "Set it to the agent's account password",
        )?);

        let allowed_servers = optional_env("ALLOWED_SERVERS")?
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let sync_timeout_ms: u64 = parse_env("SYNC_TIMEOUT_MS", 30_000, "a non-negative integer")?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            username,
            password,
            allowed_servers,
            sync_timeout: Duration::from_millis(sync_timeout_ms),
        })
    }
}
