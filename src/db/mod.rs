//! Persistence contract and backends.
//!
//! The agent keeps bot ownership records, pending self-destruct redactions,
//! the provisioning journal used to reconcile upstream accounts that never
//! made it into the bot table, and the service account's sync position.

#[cfg(feature = "libsql")]
pub mod libsql;
#[cfg(feature = "libsql")]
pub(crate) mod libsql_migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::DatabaseConfig;
use crate::error::DatabaseError;
use crate::matrix::{EventId, RoomId, UserId};

/// A provisioned bot and its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotRecord {
    pub mxid: UserId,
    pub owner: UserId,
    /// Access token, only kept when credential storage is enabled.
    pub credential: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BotRecord {
    pub fn new(mxid: UserId, owner: UserId) -> Self {
        Self {
            mxid,
            owner,
            credential: None,
            created_at: Utc::now(),
        }
    }
}

/// A message waiting to be redacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfDestructRecord {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub delete_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    /// Registration is about to be requested upstream.
    Pending,
    /// Registered upstream, bot record not yet stored.
    Registered,
    /// Upstream account and bot record disagree and compensation failed.
    Orphaned,
}

impl JournalState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Registered => "registered",
            Self::Orphaned => "orphaned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "registered" => Some(Self::Registered),
            "orphaned" => Some(Self::Orphaned),
            _ => None,
        }
    }
}

impl std::fmt::Display for JournalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unfinished provisioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub mxid: UserId,
    pub owner: UserId,
    pub state: JournalState,
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(mxid: UserId, owner: UserId, state: JournalState) -> Self {
        Self {
            mxid,
            owner,
            state,
            detail: None,
            updated_at: Utc::now(),
        }
    }

    /// An account that upstream and the bot table disagree on.
    pub fn orphaned(mxid: UserId, owner: UserId, detail: impl Into<String>) -> Self {
        Self::new(mxid, owner, JournalState::Orphaned).with_detail(detail)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Where the service account left off: its device and `/sync` token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub device_id: Option<String>,
    pub next_batch: Option<String>,
}

#[async_trait]
pub trait BotStore: Send + Sync {
    async fn get_bot(&self, mxid: &UserId) -> Result<Option<BotRecord>, DatabaseError>;

    async fn list_bots_by_owner(&self, owner: &UserId) -> Result<Vec<BotRecord>, DatabaseError>;

    async fn count_bots_by_owner(&self, owner: &UserId) -> Result<usize, DatabaseError>;

    /// Insert a new record. Fails with `Constraint` if the bot already exists.
    async fn insert_bot(&self, record: &BotRecord) -> Result<(), DatabaseError>;

    async fn set_bot_credential(
        &self,
        mxid: &UserId,
        credential: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Idempotent.
    async fn delete_bot(&self, mxid: &UserId) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait SelfDestructStore: Send + Sync {
    async fn insert_self_destruct(&self, record: &SelfDestructRecord) -> Result<(), DatabaseError>;

    /// Idempotent.
    async fn delete_self_destruct(&self, event_id: &EventId) -> Result<(), DatabaseError>;

    async fn list_self_destructs(&self) -> Result<Vec<SelfDestructRecord>, DatabaseError>;
}

#[async_trait]
pub trait ProvisioningJournal: Send + Sync {
    /// Insert or replace the entry for `entry.mxid`.
    async fn record_journal(&self, entry: &JournalEntry) -> Result<(), DatabaseError>;

    /// Idempotent.
    async fn clear_journal(&self, mxid: &UserId) -> Result<(), DatabaseError>;

    async fn list_journal(&self) -> Result<Vec<JournalEntry>, DatabaseError>;
}

/// Sync position of each service account, keyed by the configured username.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Empty state for an account never seen before.
    async fn get_sync_state(&self, account: &str) -> Result<SyncState, DatabaseError>;

    /// Remember the logged-in device. A different device drops the stored
    /// sync token, since it belongs to the old device's stream.
    async fn save_device_id(&self, account: &str, device_id: &str) -> Result<(), DatabaseError>;

    async fn save_next_batch(&self, account: &str, next_batch: &str) -> Result<(), DatabaseError>;
}

/// Everything the agent persists.
#[async_trait]
pub trait Database: BotStore + SelfDestructStore + ProvisioningJournal + SyncStateStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

/// Open the configured backend and run migrations.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    #[cfg(feature = "libsql")]
    {
        let backend = libsql::LibSqlBackend::new_local(&config.libsql_path).await?;
        backend.run_migrations().await?;
        tracing::debug!("Opened libSQL database at {}", config.libsql_path.display());
        Ok(Arc::new(backend))
    }

    #[cfg(not(feature = "libsql"))]
    {
        let _ = config;
        Err(DatabaseError::Unavailable(
            "botkeeper was built without a database backend (enable the `libsql` feature)"
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_state_labels() {
        assert_eq!(JournalState::parse("orphaned"), Some(JournalState::Orphaned));
        assert_eq!(JournalState::Registered.as_str(), "registered");
        assert_eq!(JournalState::parse("done"), None);
    }
}
