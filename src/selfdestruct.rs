//! Durable, timed redaction of messages that carry credentials.
//!
//! A record is written before the waiter starts and removed only after the
//! redaction succeeds, so anything still pending at exit is re-armed by
//! [`SelfDestructScheduler::restore`] on the next start.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::Instrument;

use crate::db::{Database, SelfDestructRecord};
use crate::error::DatabaseError;
use crate::matrix::{EventId, MessagingClient, RoomId};
use crate::tasks::BackgroundTasks;

const REDACTION_REASON: &str = "Self-destructing message";

pub struct SelfDestructScheduler {
    messenger: Arc<dyn MessagingClient>,
    db: Arc<dyn Database>,
    tasks: BackgroundTasks,
    armed: Arc<Mutex<HashSet<EventId>>>,
}

impl SelfDestructScheduler {
    pub fn new(
        messenger: Arc<dyn MessagingClient>,
        db: Arc<dyn Database>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            messenger,
            db,
            tasks,
            armed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Persist a redaction deadline of now + `delay` and arm its waiter.
    ///
    /// The waiter is armed even if the record could not be stored; it just
    /// won't survive a restart.
    pub async fn schedule(&self, room_id: RoomId, event_id: EventId, delay: Duration) {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let record = SelfDestructRecord {
            event_id,
            room_id,
            delete_at: Utc::now()
                .checked_add_signed(delay)
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
        };
        if let Err(e) = self.db.insert_self_destruct(&record).await {
            tracing::error!(
                target_event_id = %record.event_id,
                "Failed to save self-destruct record, redaction will not survive a restart: {}",
                e
            );
        }
        self.arm(record);
    }

    /// Re-arm every persisted record. Past deadlines fire immediately.
    pub async fn restore(&self) -> Result<usize, DatabaseError> {
        let records = self.db.list_self_destructs().await?;
        let mut armed = 0;
        for record in records {
            if self.arm(record) {
                armed += 1;
            }
        }
        if armed > 0 {
            tracing::info!("Re-armed {} self-destructing message(s)", armed);
        }
        Ok(armed)
    }

    /// Returns false if a waiter for this event already exists.
    fn arm(&self, record: SelfDestructRecord) -> bool {
        {
            let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
            if !armed.insert(record.event_id.clone()) {
                tracing::debug!(
                    target_event_id = %record.event_id,
                    "Self-destruct waiter already armed"
                );
                return false;
            }
        }

        let span = tracing::info_span!("self_destruct", target_event_id = %record.event_id);
        let messenger = Arc::clone(&self.messenger);
        let db = Arc::clone(&self.db);
        let armed = Arc::clone(&self.armed);
        self.tasks.spawn(
            "self-destruct",
            async move {
                let event_id = record.event_id.clone();
                run_waiter(messenger.as_ref(), db.as_ref(), record).await;
                armed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&event_id);
            }
            .instrument(span),
        );
        true
    }
}

async fn run_waiter(
    messenger: &dyn MessagingClient,
    db: &dyn Database,
    record: SelfDestructRecord,
) {
    let wait = (record.delete_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    tracing::debug!("Waiting {:?} before redacting", wait);
    tokio::time::sleep(wait).await;

    match messenger
        .redact(&record.room_id, &record.event_id, Some(REDACTION_REASON))
        .await
    {
        Ok(()) => tracing::debug!("Redacted self-destructing message"),
        Err(e) if e.errcode() == Some("M_NOT_FOUND") => {
            tracing::warn!("Self-destructing message already gone: {}", e);
        }
        Err(e) => {
            tracing::error!("Failed to redact self-destructing message: {}", e);
            return;
        }
    }

    if let Err(e) = db.delete_self_destruct(&record.event_id).await {
        tracing::warn!("Failed to remove self-destruct record after redaction: {}", e);
    }
}
