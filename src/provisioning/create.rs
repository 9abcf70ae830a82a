//! `create <username>`: register a new bot and hand out its first session.
//!
//! Registration upstream and the local record are two systems with no shared
//! transaction, so the step is journaled: `pending` before registering,
//! `registered` once upstream has the account, cleared once the record is
//! stored. If the record can't be stored the account is deactivated again;
//! if that also fails the entry stays behind as `orphaned` for `reconcile`.

use crate::db::{BotRecord, JournalEntry, JournalState};
use crate::error::WorkflowError;
use crate::matrix::UserId;
use crate::provisioning::{Outcome, Provisioner, generate_password, is_valid_bot_username};

impl Provisioner {
    pub async fn create(
        &self,
        operator: &UserId,
        args: &[String],
    ) -> Result<Outcome, WorkflowError> {
        let Some(username) = args.first() else {
            return Err(WorkflowError::Usage("create <username>"));
        };
        if !is_valid_bot_username(username) {
            return Err(WorkflowError::NameInvalid);
        }
        let mxid = self.bot_user_id(username);

        let existing = self
            .db
            .get_bot(&mxid)
            .await
            .map_err(|e| WorkflowError::persistence("check if bot already exists in database", e))?;
        if let Some(existing) = existing {
            return Err(if existing.owner == *operator {
                WorkflowError::AlreadyOwned(mxid)
            } else {
                WorkflowError::NameTaken(mxid)
            });
        }

        if let Some(limit) = self.config.max_bots_per_operator {
            let count = self
                .db
                .count_bots_by_owner(operator)
                .await
                .map_err(|e| WorkflowError::persistence("get bot list", e))?;
            if count >= limit {
                return Err(WorkflowError::TooManyBots { count, limit });
            }
        }

        let available = self
            .admin
            .is_username_available(username)
            .await
            .map_err(|e| WorkflowError::admin("check username availability", e))?;
        if !available {
            return Err(WorkflowError::NameUnavailable(mxid));
        }

        self.db
            .record_journal(&JournalEntry::new(
                mxid.clone(),
                operator.clone(),
                JournalState::Pending,
            ))
            .await
            .map_err(|e| WorkflowError::persistence("record provisioning journal", e))?;

        let password = generate_password();
        if let Err(e) = self.admin.register_user(username, &password).await {
            self.forget_journal(&mxid).await;
            return Err(WorkflowError::admin("register bot", e));
        }
        tracing::info!(bot = %mxid, owner = %operator, "Registered bot account");

        if let Err(e) = self
            .db
            .record_journal(&JournalEntry::new(
                mxid.clone(),
                operator.clone(),
                JournalState::Registered,
            ))
            .await
        {
            tracing::warn!(bot = %mxid, "Failed to advance provisioning journal: {}", e);
        }

        if let Err(e) = self
            .db
            .insert_bot(&BotRecord::new(mxid.clone(), operator.clone()))
            .await
        {
            self.compensate_registration(&mxid, operator, &e.to_string())
                .await;
            return Err(WorkflowError::persistence("store registered bot in database", e));
        }
        self.forget_journal(&mxid).await;

        let session = self
            .messenger
            .login(&mxid, &password)
            .await
            .map_err(|source| WorkflowError::LoginFailed {
                bot: mxid.clone(),
                source,
            })?;
        self.store_credential(&session).await;

        Ok(Outcome::SelfDestructing(format!(
            "Bot created successfully 🎉{}",
            self.bot_details(&session)
        )))
    }

    /// Undo an upstream registration whose record could not be stored.
    async fn compensate_registration(&self, mxid: &UserId, operator: &UserId, cause: &str) {
        match self.admin.deactivate_user(mxid).await {
            Ok(()) => {
                tracing::warn!(bot = %mxid, "Deactivated bot after failing to store its record");
                self.forget_journal(mxid).await;
            }
            Err(e) => {
                tracing::error!(
                    bot = %mxid,
                    "Bot account is orphaned upstream, run `botkeeper reconcile`: {}",
                    e
                );
                let detail = format!("record not stored: {}; deactivation failed: {}", cause, e);
                let entry = JournalEntry::orphaned(mxid.clone(), operator.clone(), detail);
                if let Err(e) = self.db.record_journal(&entry).await {
                    tracing::error!(bot = %mxid, "Failed to journal orphaned bot: {}", e);
                }
            }
        }
    }

    async fn forget_journal(&self, mxid: &UserId) {
        if let Err(e) = self.db.clear_journal(mxid).await {
            tracing::warn!(bot = %mxid, "Failed to clear provisioning journal entry: {}", e);
        }
    }
}
