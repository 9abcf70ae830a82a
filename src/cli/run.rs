//! `botkeeper run`: wire the collaborators together and serve until stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admin::AdminApi;
use crate::agent::{AgentRuntime, Dispatcher, InMemorySessionStore, SessionStore};
use crate::config::Config;
use crate::db;
use crate::error::Error;
use crate::guard::Guard;
use crate::matrix::{MessagingClient, SyncPoller};
use crate::provisioning::Provisioner;
use crate::selfdestruct::SelfDestructScheduler;
use crate::tasks::BackgroundTasks;

const INBOUND_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How the agent stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// SIGINT/SIGTERM.
    Stopped,
    /// The sync stream went away on its own.
    StreamEnded,
}

impl RunOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Stopped => 0,
            RunOutcome::StreamEnded => 2,
        }
    }
}

pub async fn run_agent() -> anyhow::Result<RunOutcome> {
    let config = Config::from_env()?;
    tracing::info!(
        homeserver = %config.homeserver.url,
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let db = db::connect_from_config(&config.database).await?;
    let unfinished = db.list_journal().await?;
    if !unfinished.is_empty() {
        tracing::warn!(
            "{} unfinished provisioning journal entr(y/ies), run `botkeeper reconcile`",
            unfinished.len()
        );
    }

    let client = super::login_service_account(&config, db.as_ref()).await?;
    let messenger: Arc<dyn MessagingClient> = client.clone();
    let admin: Arc<dyn AdminApi> = Arc::new(super::admin_client(&config, &client)?);
    tracing::warn!(
        "No end-to-end encryption backend attached; encrypted replies will fail to send"
    );

    let tasks = BackgroundTasks::new();
    let scheduler = Arc::new(SelfDestructScheduler::new(
        messenger.clone(),
        db.clone(),
        tasks.clone(),
    ));
    if let Err(e) = scheduler.restore().await {
        tracing::error!("Failed to restore self-destructing messages: {}", e);
    }

    let guard = Guard::new(
        messenger.clone(),
        &config.homeserver.allowed_servers,
        config.provisioning.min_trust_level,
    );
    let provisioner = Provisioner::new(
        admin,
        db.clone(),
        messenger.clone(),
        config.provisioning.clone(),
    );
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let dispatcher = Dispatcher::new(
        messenger.clone(),
        provisioner,
        sessions,
        scheduler,
        tasks.clone(),
    );
    let runtime = AgentRuntime::new(messenger, guard, dispatcher);

    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let poller = SyncPoller::new(client, config.homeserver.sync_timeout)
        .with_state(db.clone(), config.homeserver.username.clone());
    let poller_task = tokio::spawn(poller.run(tx, shutdown.clone()));
    let signal_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        })
    };

    let result = runtime.run(rx, shutdown.clone()).await;
    shutdown.cancel();
    signal_task.abort();

    match poller_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Sync poller stopped: {}", e),
        Err(e) => tracing::error!("Sync poller task failed: {}", e),
    }
    tasks.shutdown(SHUTDOWN_GRACE).await;

    match result {
        Ok(()) => {
            tracing::info!("Stopped");
            Ok(RunOutcome::Stopped)
        }
        Err(Error::StreamEnded) => {
            tracing::error!("Inbound event stream ended, shutting down");
            Ok(RunOutcome::StreamEnded)
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
}
