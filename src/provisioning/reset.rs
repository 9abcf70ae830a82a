//! `reset <username>`: replace a bot's password and issue a fresh session.

use crate::agent::session::{Continuation, Pending};
use crate::error::WorkflowError;
use crate::matrix::UserId;
use crate::provisioning::{
    Outcome, PENDING_BOT_KEY, Provisioner, confirmation_matches, generate_password, pending_bot,
};

pub const RESET_CONFIRMATION: &str = "really reset";

impl Provisioner {
    /// First step: check ownership and ask for confirmation.
    pub async fn reset(
        &self,
        operator: &UserId,
        args: &[String],
    ) -> Result<Outcome, WorkflowError> {
        let Some(username) = args.first() else {
            return Err(WorkflowError::Usage("reset <username>"));
        };
        let bot = self.resolve_owned_bot(operator, username).await?;

        let prompt = format!(
            "Are you sure you want to reset the access token of `{}`?\n\n\
             This will invalidate the existing token and e2ee device keys.\n\
             To keep encryption working on the bot, make sure to clear the bot database too.\n\n\
             Type `{}` to confirm.",
            bot.mxid, RESET_CONFIRMATION
        );
        let pending = Pending::new(
            Continuation::ConfirmReset,
            format!("resetting `{}`", bot.mxid),
        )
        .with_data(PENDING_BOT_KEY, bot.mxid.as_str());
        Ok(Outcome::Confirm { prompt, pending })
    }

    /// Second step: `words` is the operator's whole reply.
    pub async fn confirm_reset(
        &self,
        operator: &UserId,
        pending: &Pending,
        words: &[String],
    ) -> Result<Outcome, WorkflowError> {
        let Some(mxid) = pending_bot(pending) else {
            return Err(WorkflowError::Usage("reset <username>"));
        };
        if !confirmation_matches(words, RESET_CONFIRMATION) {
            return Ok(Outcome::Reply(format!("Cancelled resetting `{}`", mxid)));
        }

        let bot = self.resolve_owned_bot(operator, mxid.localpart()).await?;
        let password = generate_password();
        self.admin
            .reset_password(&bot.mxid, &password)
            .await
            .map_err(|e| WorkflowError::admin("reset bot", e))?;
        tracing::info!(bot = %bot.mxid, "Reset bot password");

        let session = self
            .messenger
            .login(&bot.mxid, &password)
            .await
            .map_err(|source| WorkflowError::LoginFailed {
                bot: bot.mxid.clone(),
                source,
            })?;
        self.store_credential(&session).await;

        Ok(Outcome::SelfDestructing(format!(
            "Bot reset successfully.{}",
            self.bot_details(&session)
        )))
    }
}
