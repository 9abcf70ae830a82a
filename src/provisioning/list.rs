//! `list`: the operator's bots, ordered by user ID.

use crate::error::WorkflowError;
use crate::matrix::UserId;
use crate::provisioning::{Outcome, Provisioner};

const NO_BOTS_MESSAGE: &str = "You don't have any bots 😿";

impl Provisioner {
    pub async fn list(&self, operator: &UserId) -> Result<Outcome, WorkflowError> {
        let bots = self
            .db
            .list_bots_by_owner(operator)
            .await
            .map_err(|e| WorkflowError::persistence("get bot list", e))?;
        if bots.is_empty() {
            return Ok(Outcome::Reply(NO_BOTS_MESSAGE.to_string()));
        }
        let lines: Vec<String> = bots
            .iter()
            .map(|bot| format!("* [{}]({})", bot.mxid, bot.mxid.matrix_to_url()))
            .collect();
        Ok(Outcome::Reply(format!("Your bots:\n\n{}", lines.join("\n"))))
    }
}
