//! Routes admitted messages to command handlers or pending continuations.
//!
//! Messages from one operator are handled strictly one at a time; different
//! operators never wait on each other.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;

use crate::agent::commands::{Command, ParsedMessage, Request, help_text, unknown_command_message};
use crate::agent::session::{Continuation, ConversationState, Pending, SessionStore};
use crate::error::{Severity, WorkflowError};
use crate::matrix::{EventId, MessageEvent, MessagingClient, Notice, RoomId, UserId};
use crate::provisioning::{Outcome, Provisioner};
use crate::selfdestruct::SelfDestructScheduler;
use crate::tasks::BackgroundTasks;

pub const INTERNAL_ERROR_MESSAGE: &str =
    "Something went wrong while handling that command. Please try again.";

/// What to run for one message.
enum Step {
    Continue(Pending, Vec<String>),
    Run(Command, Vec<String>),
    Unknown(String),
}

/// Reply channel for one handled message.
pub struct CommandContext<'a> {
    messenger: &'a dyn MessagingClient,
    scheduler: &'a SelfDestructScheduler,
    room_id: &'a RoomId,
    event_id: &'a EventId,
}

impl CommandContext<'_> {
    /// Send an encrypted notice. Send failures are logged, not propagated.
    pub async fn reply(&self, body: impl Into<String>) -> Option<EventId> {
        match self
            .messenger
            .send_notice(self.room_id, Notice::encrypted(body))
            .await
        {
            Ok(event_id) => {
                tracing::debug!(reply_event_id = %event_id, "Sent reply");
                Some(event_id)
            }
            Err(e) => {
                tracing::error!(in_reply_to = %self.event_id, "Failed to send reply: {}", e);
                None
            }
        }
    }

    /// Send a reply and schedule it for redaction.
    pub async fn reply_self_destructing(
        &self,
        body: impl Into<String>,
        delay: std::time::Duration,
    ) {
        if let Some(event_id) = self.reply(body).await {
            self.scheduler
                .schedule(self.room_id.clone(), event_id, delay)
                .await;
        }
    }
}

pub struct Dispatcher {
    messenger: Arc<dyn MessagingClient>,
    provisioner: Provisioner,
    sessions: Arc<dyn SessionStore>,
    scheduler: Arc<SelfDestructScheduler>,
    tasks: BackgroundTasks,
    operator_locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        messenger: Arc<dyn MessagingClient>,
        provisioner: Provisioner,
        sessions: Arc<dyn SessionStore>,
        scheduler: Arc<SelfDestructScheduler>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            messenger,
            provisioner,
            sessions,
            scheduler,
            tasks,
            operator_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a message that passed the guard.
    pub async fn dispatch(&self, event: &MessageEvent) {
        self.mark_read_in_background(event);

        let Some(parsed) = ParsedMessage::parse(&event.body) else {
            tracing::debug!("Ignoring blank message");
            return;
        };

        let operator_lock = self.operator_lock(&event.sender);
        {
            let _held = operator_lock.lock().await;
            let ctx = CommandContext {
                messenger: self.messenger.as_ref(),
                scheduler: self.scheduler.as_ref(),
                room_id: &event.room_id,
                event_id: &event.event_id,
            };
            self.dispatch_locked(&ctx, &event.sender, parsed).await;
        }
        self.release_operator_lock(&event.sender, operator_lock);
    }

    async fn dispatch_locked(
        &self,
        ctx: &CommandContext<'_>,
        operator: &UserId,
        parsed: ParsedMessage,
    ) {
        let state = self.sessions.get(operator).await;
        let command = match parsed.request() {
            Request::Cancel => {
                self.sessions.clear(operator).await;
                let reply = match state.pending {
                    Some(pending) => format!("Cancelled {}", pending.description),
                    None => "Nothing to cancel".to_string(),
                };
                ctx.reply(reply).await;
                return;
            }
            Request::Run(command) => Some(command),
            Request::Unknown => None,
        };

        // A pending continuation is consumed or superseded by this message.
        if !state.is_idle() {
            self.sessions.clear(operator).await;
        }
        let step = match (state.pending, command) {
            (Some(pending), _) => Step::Continue(pending, parsed.all_words()),
            (None, Some(command)) => Step::Run(command, parsed.args),
            (None, None) => Step::Unknown(parsed.word),
        };

        let result = AssertUnwindSafe(self.execute(operator, step))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(outcome)) => self.deliver(ctx, operator, outcome).await,
            Ok(Err(e)) => {
                log_workflow_error(&e);
                ctx.reply(e.operator_message()).await;
            }
            Err(panic) => {
                let backtrace = crate::bootstrap::take_panic_backtrace()
                    .unwrap_or_else(Backtrace::force_capture);
                tracing::error!(
                    panic = %panic_message(panic.as_ref()),
                    backtrace = %backtrace,
                    "Command handler panicked"
                );
                self.sessions.clear(operator).await;
                ctx.reply(INTERNAL_ERROR_MESSAGE).await;
            }
        }
    }

    async fn execute(&self, operator: &UserId, step: Step) -> Result<Outcome, WorkflowError> {
        let provisioner = &self.provisioner;
        match step {
            Step::Continue(pending, words) => match pending.continuation {
                Continuation::ConfirmReset => {
                    provisioner.confirm_reset(operator, &pending, &words).await
                }
                Continuation::ConfirmDelete => {
                    provisioner.confirm_delete(operator, &pending, &words).await
                }
            },
            Step::Run(command, args) => match command {
                Command::Ping => Ok(Outcome::Reply("Pong!".to_string())),
                Command::Help => Ok(Outcome::Reply(help_text())),
                Command::List => provisioner.list(operator).await,
                Command::Show => provisioner.show(operator, &args).await,
                Command::Create => provisioner.create(operator, &args).await,
                Command::Reset => provisioner.reset(operator, &args).await,
                Command::Delete => provisioner.delete(operator, &args).await,
            },
            Step::Unknown(word) => Ok(Outcome::Reply(unknown_command_message(&word))),
        }
    }

    async fn deliver(&self, ctx: &CommandContext<'_>, operator: &UserId, outcome: Outcome) {
        match outcome {
            Outcome::Reply(body) => {
                ctx.reply(body).await;
            }
            Outcome::SelfDestructing(body) => {
                let delay = self.provisioner.config().self_destruct_delay;
                ctx.reply_self_destructing(body, delay).await;
            }
            Outcome::Confirm { prompt, pending } => {
                self.sessions
                    .set(
                        operator,
                        ConversationState {
                            pending: Some(pending),
                        },
                    )
                    .await;
                ctx.reply(prompt).await;
            }
        }
    }

    fn mark_read_in_background(&self, event: &MessageEvent) {
        let messenger = Arc::clone(&self.messenger);
        let room_id = event.room_id.clone();
        let event_id = event.event_id.clone();
        self.tasks.spawn("read-receipt", async move {
            if let Err(e) = messenger.mark_read(&room_id, &event_id).await {
                tracing::warn!(event_id = %event_id, "Failed to mark message as read: {}", e);
            }
        });
    }

    fn operator_lock(&self, operator: &UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .operator_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(operator.clone()).or_default())
    }

    /// Drop the operator's lock entry once nobody else holds a handle to it.
    fn release_operator_lock(&self, operator: &UserId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .operator_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(operator);
        }
    }
}

fn log_workflow_error(error: &WorkflowError) {
    match error.severity() {
        Severity::Validation => tracing::debug!(reason = %error, "Command rejected"),
        Severity::Authorization => tracing::debug!(reason = %error, "Command not permitted"),
        Severity::Collaborator => tracing::error!(error = %error, "Command failed"),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(all(test, feature = "libsql"))]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;

    use super::*;
    use crate::admin::{AccountInfo, AdminApi, DeviceInfo};
    use crate::agent::session::InMemorySessionStore;
    use crate::config::ProvisioningConfig;
    use crate::db::libsql::tests::temp_backend;
    use crate::db::{BotRecord, BotStore, Database};
    use crate::error::AdminError;
    use crate::testing::{FakeAdmin, RecordingMessenger};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<dyn Database>,
        messenger: Arc<RecordingMessenger>,
        sessions: Arc<InMemorySessionStore>,
        dispatcher: Dispatcher,
    }

    fn alice() -> UserId {
        UserId::new("alice", "example.com")
    }

    fn room() -> RoomId {
        RoomId::parse("!dm:example.com").unwrap()
    }

    fn message(body: &str) -> MessageEvent {
        MessageEvent {
            event_id: EventId::parse(format!("$in-{}", body.len())).unwrap(),
            room_id: room(),
            sender: alice(),
            timestamp: Utc::now(),
            body: body.to_string(),
            encryption: None,
        }
    }

    async fn fixture_with_admin(admin: Arc<dyn AdminApi>) -> Fixture {
        let (dir, backend) = temp_backend().await;
        let db: Arc<dyn Database> = Arc::new(backend);
        let messenger = Arc::new(RecordingMessenger::new("@botbot:example.com"));
        let tasks = BackgroundTasks::new();
        let scheduler = Arc::new(SelfDestructScheduler::new(
            messenger.clone(),
            db.clone(),
            tasks.clone(),
        ));
        let sessions = Arc::new(InMemorySessionStore::new());
        let provisioner = Provisioner::new(
            admin,
            db.clone(),
            messenger.clone(),
            ProvisioningConfig::default(),
        );
        let dispatcher = Dispatcher::new(
            messenger.clone(),
            provisioner,
            sessions.clone(),
            scheduler,
            tasks,
        );
        Fixture {
            _dir: dir,
            db,
            messenger,
            sessions,
            dispatcher,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_admin(Arc::new(FakeAdmin::new())).await
    }

    async fn seed_bot(f: &Fixture, localpart: &str) {
        f.db.insert_bot(&BotRecord::new(UserId::new(localpart, "example.com"), alice()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ping_replies_encrypted_and_marks_read() {
        let f = fixture().await;
        f.dispatcher.dispatch(&message("!PING")).await;
        assert_eq!(f.messenger.bodies(), vec!["Pong!".to_string()]);
        assert!(f.messenger.notices()[0].1.encrypted);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.messenger.read_receipts().len(), 1);
    }

    #[tokio::test]
    async fn unknown_command_is_answered() {
        let f = fixture().await;
        f.dispatcher.dispatch(&message("lst")).await;
        assert_eq!(
            f.messenger.last_body().unwrap(),
            "Unknown command. Did you mean `list`? Use `help` for help."
        );
    }

    #[tokio::test]
    async fn pending_confirmation_captures_next_message() {
        let f = fixture().await;
        seed_bot(&f, "coolbot").await;

        f.dispatcher.dispatch(&message("reset coolbot")).await;
        assert!(f.messenger.last_body().unwrap().contains("really reset"));
        assert!(!f.sessions.get(&alice()).await.is_idle());

        f.dispatcher.dispatch(&message("list")).await;
        assert_eq!(
            f.messenger.last_body().unwrap(),
            "Cancelled resetting `@coolbot:example.com`"
        );
        assert!(f.sessions.get(&alice()).await.is_idle());

        f.dispatcher.dispatch(&message("list")).await;
        assert!(f.messenger.last_body().unwrap().starts_with("Your bots:"));
    }

    #[tokio::test]
    async fn cancel_clears_pending_confirmation() {
        let f = fixture().await;
        seed_bot(&f, "coolbot").await;

        f.dispatcher.dispatch(&message("cancel")).await;
        assert_eq!(f.messenger.last_body().unwrap(), "Nothing to cancel");

        f.dispatcher.dispatch(&message("remove coolbot")).await;
        f.dispatcher.dispatch(&message("!cancel")).await;
        assert_eq!(
            f.messenger.last_body().unwrap(),
            "Cancelled deleting `@coolbot:example.com`"
        );
        assert!(f.sessions.get(&alice()).await.is_idle());
    }

    #[tokio::test]
    async fn confirmed_reset_self_destructs() {
        let f = fixture().await;
        seed_bot(&f, "coolbot").await;

        f.dispatcher.dispatch(&message("reset coolbot")).await;
        f.dispatcher.dispatch(&message("really reset")).await;
        assert!(f.messenger.last_body().unwrap().starts_with("Bot reset successfully."));
        assert_eq!(f.db.list_self_destructs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn workflow_errors_use_operator_messages() {
        let f = fixture().await;
        f.dispatcher.dispatch(&message("show ghostbot")).await;
        assert_eq!(f.messenger.last_body().unwrap(), "That bot doesn't exist");
        f.dispatcher.dispatch(&message("create")).await;
        assert_eq!(
            f.messenger.last_body().unwrap(),
            "**Usage:** `create <username>`"
        );
    }

    struct PanickingAdmin;

    #[async_trait]
    impl AdminApi for PanickingAdmin {
        async fn is_username_available(&self, _localpart: &str) -> Result<bool, AdminError> {
            Ok(true)
        }

        async fn register_user(
            &self,
            _localpart: &str,
            _password: &SecretString,
        ) -> Result<(), AdminError> {
            Ok(())
        }

        async fn reset_password(
            &self,
            _user_id: &UserId,
            _password: &SecretString,
        ) -> Result<(), AdminError> {
            Ok(())
        }

        async fn account_info(&self, _user_id: &UserId) -> Result<AccountInfo, AdminError> {
            panic!("account lookup exploded");
        }

        async fn list_devices(&self, _user_id: &UserId) -> Result<Vec<DeviceInfo>, AdminError> {
            Ok(Vec::new())
        }

        async fn deactivate_user(&self, _user_id: &UserId) -> Result<(), AdminError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        crate::bootstrap::install_panic_hook();
        let f = fixture_with_admin(Arc::new(PanickingAdmin)).await;
        seed_bot(&f, "coolbot").await;

        f.dispatcher.dispatch(&message("show coolbot")).await;
        assert_eq!(f.messenger.last_body().unwrap(), INTERNAL_ERROR_MESSAGE);
        // The dispatcher consumed the backtrace captured at the panic site.
        assert!(crate::bootstrap::take_panic_backtrace().is_none());

        f.dispatcher.dispatch(&message("ping")).await;
        assert_eq!(f.messenger.last_body().unwrap(), "Pong!");
    }

    #[tokio::test]
    async fn same_operator_messages_are_serialized() {
        let f = Arc::new(fixture().await);
        let first = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.dispatcher.dispatch(&message("ping")).await })
        };
        let second = {
            let f = Arc::clone(&f);
            tokio::spawn(async move { f.dispatcher.dispatch(&message("help")).await })
        };
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(f.messenger.bodies().len(), 2);
        assert!(f.dispatcher.operator_locks.lock().unwrap().is_empty());
    }
}
