//! `delete <username>` (aliases `remove`, `unregister`): deactivate a bot
//! upstream and forget it.

use crate::agent::session::{Continuation, Pending};
use crate::db::JournalEntry;
use crate::error::WorkflowError;
use crate::matrix::UserId;
use crate::provisioning::{
    Outcome, PENDING_BOT_KEY, Provisioner, confirmation_matches, pending_bot,
};

pub const DELETE_CONFIRMATION: &str = "really delete";

impl Provisioner {
    pub async fn delete(
        &self,
        operator: &UserId,
        args: &[String],
    ) -> Result<Outcome, WorkflowError> {
        let Some(username) = args.first() else {
            return Err(WorkflowError::Usage("delete <username>"));
        };
        let bot = self.resolve_owned_bot(operator, username).await?;

        let prompt = format!(
            "Are you sure you want to delete `{}`?\n\n\
             This will deactivate the account on the server. \
             The username can't be registered again.\n\n\
             Type `{}` to confirm.",
            bot.mxid, DELETE_CONFIRMATION
        );
        let pending = Pending::new(
            Continuation::ConfirmDelete,
            format!("deleting `{}`", bot.mxid),
        )
        .with_data(PENDING_BOT_KEY, bot.mxid.as_str());
        Ok(Outcome::Confirm { prompt, pending })
    }

    /// Deactivates upstream first; the record is kept if that fails.
    pub async fn confirm_delete(
        &self,
        operator: &UserId,
        pending: &Pending,
        words: &[String],
    ) -> Result<Outcome, WorkflowError> {
        let Some(mxid) = pending_bot(pending) else {
            return Err(WorkflowError::Usage("delete <username>"));
        };
        if !confirmation_matches(words, DELETE_CONFIRMATION) {
            return Ok(Outcome::Reply(format!("Cancelled deleting `{}`", mxid)));
        }

        let bot = self.resolve_owned_bot(operator, mxid.localpart()).await?;
        self.admin
            .deactivate_user(&bot.mxid)
            .await
            .map_err(|e| WorkflowError::admin("deactivate bot", e))?;
        tracing::info!(bot = %bot.mxid, "Deactivated bot account");

        if let Err(e) = self.db.delete_bot(&bot.mxid).await {
            let detail = format!("deactivated upstream; record not removed: {}", e);
            let entry = JournalEntry::orphaned(bot.mxid.clone(), operator.clone(), detail);
            if let Err(journal_err) = self.db.record_journal(&entry).await {
                tracing::error!(
                    bot = %bot.mxid,
                    "Failed to journal orphaned bot: {}",
                    journal_err
                );
            }
            return Err(WorkflowError::persistence("remove bot from database", e));
        }

        Ok(Outcome::Reply(format!("Bot `{}` deleted.", bot.mxid)))
    }
}

#[cfg(all(test, feature = "libsql"))]
mod tests {
    use pretty_assertions::assert_eq;

    use super::DELETE_CONFIRMATION;
    use crate::agent::session::Continuation;
    use crate::db::{BotStore, JournalState, ProvisioningJournal};
    use crate::provisioning::Outcome;
    use crate::provisioning::test_support::{alice, harness, words};
    use crate::testing::AdminStep;

    #[tokio::test]
    async fn confirmed_delete_deactivates_then_forgets() {
        let h = harness().await;
        h.provisioner
            .create(&alice(), &words("coolbot"))
            .await
            .unwrap();

        let Outcome::Confirm { pending, .. } =
            h.provisioner.delete(&alice(), &words("coolbot")).await.unwrap()
        else {
            panic!("expected confirmation");
        };
        assert_eq!(pending.continuation, Continuation::ConfirmDelete);

        let outcome = h
            .provisioner
            .confirm_delete(&alice(), &pending, &words(DELETE_CONFIRMATION))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Reply("Bot `@coolbot:example.com` deleted.".to_string())
        );
        assert_eq!(h.admin.deactivated(), vec!["coolbot".to_string()]);
        assert!(h.db.list_bots_by_owner(&alice()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_deactivation_keeps_record() {
        let h = harness().await;
        h.provisioner
            .create(&alice(), &words("coolbot"))
            .await
            .unwrap();
        let Outcome::Confirm { pending, .. } =
            h.provisioner.delete(&alice(), &words("coolbot")).await.unwrap()
        else {
            panic!("expected confirmation");
        };
        h.admin.fail(AdminStep::Deactivate);

        let err = h
            .provisioner
            .confirm_delete(&alice(), &pending, &words(DELETE_CONFIRMATION))
            .await
            .unwrap_err();
        assert_eq!(err.operator_message(), "Failed to deactivate bot");
        assert_eq!(h.db.count_bots_by_owner(&alice()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mismatch_cancels() {
        let h = harness().await;
        h.provisioner
            .create(&alice(), &words("coolbot"))
            .await
            .unwrap();
        let Outcome::Confirm { pending, .. } =
            h.provisioner.delete(&alice(), &words("coolbot")).await.unwrap()
        else {
            panic!("expected confirmation");
        };
        assert_eq!(
            h.provisioner
                .confirm_delete(&alice(), &pending, &words("yes"))
                .await
                .unwrap(),
            Outcome::Reply("Cancelled deleting `@coolbot:example.com`".to_string())
        );
        assert!(h.admin.deactivated().is_empty());
    }

    #[tokio::test]
    async fn unremovable_record_is_journaled_as_orphaned() {
        let h = harness().await;
        h.provisioner
            .create(&alice(), &words("coolbot"))
            .await
            .unwrap();
        let Outcome::Confirm { pending, .. } =
            h.provisioner.delete(&alice(), &words("coolbot")).await.unwrap()
        else {
            panic!("expected confirmation");
        };
        let conn = h.db.connect().await.unwrap();
        conn.execute(
            "CREATE TRIGGER fail_bot_delete BEFORE DELETE ON bots \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
            (),
        )
        .await
        .unwrap();

        let err = h
            .provisioner
            .confirm_delete(&alice(), &pending, &words(DELETE_CONFIRMATION))
            .await
            .unwrap_err();
        assert_eq!(err.operator_message(), "Failed to remove bot from database");
        assert_eq!(h.admin.deactivated(), vec!["coolbot".to_string()]);
        assert_eq!(h.db.count_bots_by_owner(&alice()).await.unwrap(), 1);

        let journal = h.db.list_journal().await.unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].state, JournalState::Orphaned);
        assert_eq!(journal[0].owner, alice());
        assert!(journal[0].detail.as_deref().unwrap().contains("disk full"));
    }
}
