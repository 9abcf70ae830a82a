//! Operator-facing provisioning workflows.
//!
//! Every flow only touches bot records owned by the calling operator, and
//! ownership is re-read from the database on every step that acts on a bot.
//! Handlers return an [`Outcome`] and leave replying, confirmation state and
//! self-destruction to the dispatcher.

mod create;
mod delete;
mod list;
pub mod reconcile;
mod reset;
mod show;

use std::sync::{Arc, LazyLock};

use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};

use crate::admin::AdminApi;
use crate::agent::session::Pending;
use crate::config::ProvisioningConfig;
use crate::db::{BotRecord, Database};
use crate::error::WorkflowError;
use crate::matrix::{MessagingClient, SessionCredentials, UserId};

pub use self::reconcile::{ReconcileReport, reconcile};
pub use self::show::{format_duration, format_last_seen};

static BOT_USERNAME_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{1,28}bot$").ok());

const PASSWORD_LENGTH: usize = 72;

/// Scratch key holding the target bot of a confirmation flow.
pub(crate) const PENDING_BOT_KEY: &str = "bot_mxid";

/// Whether `localpart` is an acceptable bot username.
pub fn is_valid_bot_username(localpart: &str) -> bool {
    BOT_USERNAME_REGEX
        .as_ref()
        .is_some_and(|re| re.is_match(localpart))
}

/// 72 random alphanumeric characters.
pub fn generate_password() -> SecretString {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect();
    SecretString::from(password)
}

/// What a workflow step wants sent back to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(String),
    /// Contains credentials; redacted after the self-destruct delay.
    SelfDestructing(String),
    /// Ask for confirmation and hand the next message to `pending`.
    Confirm { prompt: String, pending: Pending },
}

pub struct Provisioner {
    admin: Arc<dyn AdminApi>,
    db: Arc<dyn Database>,
    messenger: Arc<dyn MessagingClient>,
    config: ProvisioningConfig,
}

impl Provisioner {
    pub fn new(
        admin: Arc<dyn AdminApi>,
        db: Arc<dyn Database>,
        messenger: Arc<dyn MessagingClient>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            admin,
            db,
            messenger,
            config,
        }
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Bots live on the agent's own server.
    fn bot_user_id(&self, localpart: &str) -> UserId {
        UserId::new(localpart, self.messenger.user_id().server_name())
    }

    /// Look up a bot by username and make sure `operator` owns it.
    pub(crate) async fn resolve_owned_bot(
        &self,
        operator: &UserId,
        username: &str,
    ) -> Result<BotRecord, WorkflowError> {
        let mxid = self.bot_user_id(&username.to_lowercase());
        let record = self
            .db
            .get_bot(&mxid)
            .await
            .map_err(|e| WorkflowError::persistence("get bot info", e))?
            .ok_or_else(|| WorkflowError::NotFound(mxid.clone()))?;
        if record.owner != *operator {
            return Err(WorkflowError::NotOwned(mxid));
        }
        Ok(record)
    }

    /// Remember a fresh access token when credential storage is enabled.
    async fn store_credential(&self, session: &SessionCredentials) {
        if !self.config.store_credentials {
            return;
        }
        if let Err(e) = self
            .db
            .set_bot_credential(
                &session.user_id,
                Some(session.access_token.expose_secret()),
            )
            .await
        {
            tracing::warn!(bot = %session.user_id, "Failed to store bot credential: {}", e);
        }
    }

    /// Credential block appended to create and reset replies.
    fn bot_details(&self, session: &SessionCredentials) -> String {
        format!(
            "\n\n* User ID: `{}`\n* Device ID: `{}`\n* Access token: `{}`\n\n\
             This message will self-destruct in {}.",
            session.user_id,
            session.device_id,
            session.access_token.expose_secret(),
            format_duration(self.config.self_destruct_delay),
        )
    }
}

/// Target bot stored in a confirmation's scratch data.
pub(crate) fn pending_bot(pending: &Pending) -> Option<UserId> {
    pending
        .data
        .get(PENDING_BOT_KEY)
        .and_then(|raw| UserId::parse(raw.as_str()).ok())
}

/// Confirmation replies are compared with surrounding whitespace ignored and
/// inner whitespace collapsed.
pub(crate) fn confirmation_matches(words: &[String], phrase: &str) -> bool {
    words.join(" ") == phrase
}

#[cfg(all(test, feature = "libsql"))]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::*;
    use crate::db::libsql::LibSqlBackend;
    use crate::testing::{FakeAdmin, RecordingMessenger};

    pub(crate) struct Harness {
        pub _dir: tempfile::TempDir,
        pub db: Arc<LibSqlBackend>,
        pub admin: Arc<FakeAdmin>,
        pub messenger: Arc<RecordingMessenger>,
        pub provisioner: Provisioner,
    }

    pub(crate) fn alice() -> UserId {
        UserId::new("alice", "example.com")
    }

    pub(crate) fn bob() -> UserId {
        UserId::new("bob", "example.com")
    }

    pub(crate) fn words(text: &str) -> Vec<String> {
        text.split_whitespace().map(str::to_string).collect()
    }

    pub(crate) async fn harness_with(config: ProvisioningConfig) -> Harness {
        let (dir, backend) = crate::db::libsql::tests::temp_backend().await;
        let db = Arc::new(backend);
        let admin = Arc::new(FakeAdmin::new());
        let messenger = Arc::new(RecordingMessenger::new("@botbot:example.com"));
        let provisioner =
            Provisioner::new(admin.clone(), db.clone(), messenger.clone(), config);
        Harness {
            _dir: dir,
            db,
            admin,
            messenger,
            provisioner,
        }
    }

    pub(crate) async fn harness() -> Harness {
        harness_with(ProvisioningConfig::default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(is_valid_bot_username("my-coolbot"));
        assert!(is_valid_bot_username("a1bot"));
        assert!(!is_valid_bot_username("Bad_Name-bot"));
        assert!(!is_valid_bot_username("-abot"));
        assert!(!is_valid_bot_username("abot"));
        assert!(!is_valid_bot_username("coolbott"));
        assert!(is_valid_bot_username(&format!("{}bot", "a".repeat(29))));
        assert!(!is_valid_bot_username(&format!("{}bot", "a".repeat(30))));
    }

    #[test]
    fn passwords_are_long_and_alphanumeric() {
        let password = generate_password();
        let raw = password.expose_secret();
        assert_eq!(raw.len(), PASSWORD_LENGTH);
        assert!(raw.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(raw, generate_password().expose_secret());
    }

    #[test]
    fn confirmation_ignores_spacing_only() {
        let words = |s: &str| s.split_whitespace().map(str::to_string).collect::<Vec<_>>();
        assert!(confirmation_matches(&words("  really   reset "), "really reset"));
        assert!(!confirmation_matches(&words("Really reset"), "really reset"));
        assert!(!confirmation_matches(&words("really reset now"), "really reset"));
    }
}
