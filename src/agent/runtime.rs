//! Event loop tying the inbound stream to the guard and the dispatcher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent::dispatcher::Dispatcher;
use crate::error::Error;
use crate::guard::{Guard, MessageVerdict};
use crate::matrix::{EventId, InboundEvent, MessagingClient, Notice, RoomId, UserId};

pub const DECRYPTION_FAILED_NOTICE: &str = "Failed to decrypt message";

pub struct AgentRuntime {
    messenger: Arc<dyn MessagingClient>,
    guard: Guard,
    dispatcher: Dispatcher,
}

impl AgentRuntime {
    pub fn new(messenger: Arc<dyn MessagingClient>, guard: Guard, dispatcher: Dispatcher) -> Self {
        Self {
            messenger,
            guard,
            dispatcher,
        }
    }

    /// Process events in arrival order until shutdown is requested.
    ///
    /// The stream closing on its own is fatal.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<InboundEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        tracing::info!(user_id = %self.messenger.user_id(), "Agent is handling events");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Event loop stopping");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => return Err(Error::StreamEnded),
                },
            }
        }
    }

    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Membership(event) => {
                let span = tracing::info_span!(
                    "event",
                    action = "membership event",
                    event_id = event.event_id.as_ref().map(EventId::as_str),
                    room_id = %event.room_id,
                    sender = %event.sender,
                );
                async {
                    self.guard.handle_membership(&event).await;
                }
                .instrument(span)
                .await;
            }
            InboundEvent::Message(event) => {
                let span = tracing::info_span!(
                    "event",
                    action = "incoming message",
                    event_id = %event.event_id,
                    room_id = %event.room_id,
                    sender = %event.sender,
                );
                async {
                    if self.guard.admit_message(&event).await == MessageVerdict::Admit {
                        self.dispatcher.dispatch(&event).await;
                    }
                }
                .instrument(span)
                .await;
            }
            InboundEvent::DecryptionFailed {
                room_id,
                event_id,
                sender,
                timestamp,
                reason,
            } => {
                let span = tracing::info_span!(
                    "event",
                    action = "decryption error",
                    event_id = %event_id,
                    room_id = %room_id,
                    sender = %sender,
                );
                self.report_decryption_failure(&room_id, &event_id, &sender, timestamp, &reason)
                    .instrument(span)
                    .await;
            }
        }
    }

    async fn report_decryption_failure(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        sender: &UserId,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) {
        tracing::error!(reason = %reason, "Failed to decrypt message");
        let verdict = self
            .guard
            .admit_decryption_failure(room_id, sender, timestamp)
            .await;
        if verdict != MessageVerdict::Admit {
            tracing::debug!(?verdict, "Not answering undecryptable event");
            return;
        }
        let notice = Notice::plaintext(DECRYPTION_FAILED_NOTICE).in_reply_to(event_id.clone());
        if let Err(e) = self.messenger.send_notice(room_id, notice).await {
            tracing::error!("Failed to send decryption error notice: {}", e);
        }
    }
}
