//! Administrative collaborator: account lifecycle on the homeserver.

pub mod synapse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::AdminError;
use crate::matrix::UserId;

pub use synapse::SynapseAdminClient;

/// Account metadata returned by the admin API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub deactivated: bool,
}

/// A device (session) belonging to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub display_name: Option<String>,
    /// `None` when the device has never been seen.
    pub last_seen: Option<DateTime<Utc>>,
    pub last_seen_ip: Option<String>,
}

/// Operations the provisioning workflow needs from the admin service.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn is_username_available(&self, localpart: &str) -> Result<bool, AdminError>;

    /// Register a bot account with the given password.
    async fn register_user(&self, localpart: &str, password: &SecretString)
    -> Result<(), AdminError>;

    /// Set a new password and log out every existing device.
    async fn reset_password(
        &self,
        user_id: &UserId,
        password: &SecretString,
    ) -> Result<(), AdminError>;

    async fn account_info(&self, user_id: &UserId) -> Result<AccountInfo, AdminError>;

    async fn list_devices(&self, user_id: &UserId) -> Result<Vec<DeviceInfo>, AdminError>;

    async fn deactivate_user(&self, user_id: &UserId) -> Result<(), AdminError>;
}
