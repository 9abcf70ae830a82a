//! Configuration for botkeeper.
//!
//! Everything comes from env vars, with `./.env` and `~/.botkeeper/.env`
//! loaded first via dotenvy. Explicit env vars always win.

mod admin;
mod database;
pub(crate) mod helpers;
mod homeserver;
mod provisioning;

use crate::error::ConfigError;

pub use self::admin::AdminConfig;
pub use self::database::{DatabaseConfig, default_libsql_path};
pub use self::homeserver::HomeserverConfig;
pub use self::provisioning::ProvisioningConfig;

/// Main configuration for the agent.
#[derive(Debug, Clone)]
pub struct Config {
    pub homeserver: HomeserverConfig,
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    pub provisioning: ProvisioningConfig,
}

impl Config {
    /// Load `.env` files, then resolve every section from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        crate::bootstrap::load_env_files();
        Self::resolve()
    }

    /// Resolve from the current environment without touching `.env` files.
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            homeserver: HomeserverConfig::resolve()?,
            database: DatabaseConfig::resolve()?,
            admin: AdminConfig::resolve()?,
            provisioning: ProvisioningConfig::resolve()?,
        })
    }
}
