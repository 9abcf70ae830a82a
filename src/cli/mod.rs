//! Command-line surface of the `botkeeper` binary.

pub mod doctor;
mod reconcile;
mod run;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::admin::SynapseAdminClient;
use crate::config::Config;
use crate::db::Database;
use crate::matrix::{HomeserverClient, build_http_client};

pub use self::doctor::run_doctor_command;
pub use self::reconcile::run_reconcile_command;
pub use self::run::{RunOutcome, run_agent};

/// Extra headroom over the long-poll timeout before a sync request is
/// considered hung.
const SYNC_REQUEST_SLACK: Duration = Duration::from_secs(30);

/// Provision and administer Matrix bot accounts over encrypted direct chats.
#[derive(Parser, Debug)]
#[command(name = "botkeeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the agent (default)
    Run,

    /// List unfinished provisioning journal entries
    Reconcile {
        /// Deactivate orphaned accounts upstream and clear their entries
        #[arg(long)]
        deactivate: bool,
    },

    /// Check configuration, database and homeserver access
    Doctor {
        /// Exit with an error if any check fails
        #[arg(long)]
        strict: bool,
    },
}

/// Log in as the service account configured in `config`, resuming the
/// device remembered in `db` and remembering the one the homeserver hands out.
pub(crate) async fn login_service_account(
    config: &Config,
    db: &dyn Database,
) -> anyhow::Result<Arc<HomeserverClient>> {
    let account = &config.homeserver.username;
    let stored = match db.get_sync_state(account).await {
        Ok(state) => state.device_id,
        Err(e) => {
            tracing::warn!("Failed to read stored device, logging in as a new one: {}", e);
            None
        }
    };

    let http = build_http_client(config.homeserver.sync_timeout + SYNC_REQUEST_SLACK)?;
    let client = HomeserverClient::login(
        http,
        &config.homeserver.url,
        account,
        &config.homeserver.password,
        stored.as_deref(),
    )
    .await
    .with_context(|| format!("failed to log in to {}", config.homeserver.url))?;

    if stored.as_deref() != Some(client.device_id())
        && let Err(e) = db.save_device_id(account, client.device_id()).await
    {
        tracing::warn!(
            device_id = client.device_id(),
            "Failed to remember device: {}",
            e
        );
    }
    Ok(Arc::new(client))
}

/// Admin API client acting with the service account's session.
pub(crate) fn admin_client(
    config: &Config,
    session: &HomeserverClient,
) -> anyhow::Result<SynapseAdminClient> {
    let http = build_http_client(config.admin.timeout)?;
    Ok(
        SynapseAdminClient::new(http, &config.homeserver.url, session.access_token().clone())
            .with_register_secret(config.admin.register_secret.clone())
            .with_registration_api(config.admin.registration_api_url.clone()),
    )
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["botkeeper"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn reconcile_flag_parses() {
        let cli = Cli::try_parse_from(["botkeeper", "reconcile", "--deactivate"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Reconcile { deactivate: true })
        ));

        let cli = Cli::try_parse_from(["botkeeper", "reconcile"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Reconcile { deactivate: false })
        ));
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["botkeeper", "serve"]).is_err());
    }
}
