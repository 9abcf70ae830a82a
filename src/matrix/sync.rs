//! Long-polling `/sync` loop that feeds the inbound event stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::ChannelError;
use crate::matrix::client::MessagingClient;
use crate::matrix::events::{
    EncryptionInfo, EventSource, InboundEvent, Membership, MembershipEvent, MessageEvent,
    StrippedState,
};
use crate::matrix::http::HomeserverClient;
use crate::matrix::ids::{EventId, RoomId, UserId};

const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Plaintext recovered from an `m.room.encrypted` event.
#[derive(Debug, Clone)]
pub struct DecryptedMessage {
    pub body: String,
    pub encryption: EncryptionInfo,
}

/// Pluggable end-to-end decryption.
#[async_trait]
pub trait Decryptor: Send + Sync {
    /// Decrypt the full event JSON of an `m.room.encrypted` event.
    async fn decrypt(&self, room_id: &RoomId, event: &Value) -> Result<DecryptedMessage, String>;
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, InvitedRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    state: EventList,
    #[serde(default)]
    timeline: EventList,
}

#[derive(Debug, Default, Deserialize)]
struct InvitedRoom {
    #[serde(default)]
    invite_state: EventList,
}

#[derive(Debug, Default, Deserialize)]
struct EventList {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    event_id: Option<String>,
    sender: String,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    origin_server_ts: i64,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    unsigned: Value,
}

impl RawEvent {
    fn from_value(value: &Value) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::debug!("Skipping malformed sync event: {}", e);
                None
            }
        }
    }

    fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }

    fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.origin_server_ts)
            .single()
            .unwrap_or_default()
    }
}

/// The `since` token `/sync` resumes from, optionally kept in the database.
#[derive(Default)]
struct SyncCursor {
    since: Option<String>,
    store: Option<(Arc<dyn Database>, String)>,
}

impl SyncCursor {
    fn stored(db: Arc<dyn Database>, account: String) -> Self {
        Self {
            since: None,
            store: Some((db, account)),
        }
    }

    async fn load(&mut self) {
        let Some((db, account)) = &self.store else {
            return;
        };
        match db.get_sync_state(account).await {
            Ok(state) => {
                if state.next_batch.is_some() {
                    tracing::info!("Resuming sync from stored token");
                }
                self.since = state.next_batch;
            }
            Err(e) => tracing::warn!("Failed to load sync token, starting fresh: {}", e),
        }
    }

    /// Move past a fully delivered response.
    async fn advance(&mut self, next_batch: String) {
        if let Some((db, account)) = &self.store
            && let Err(e) = db.save_next_batch(account, &next_batch).await
        {
            tracing::warn!("Failed to save sync token: {}", e);
        }
        self.since = Some(next_batch);
    }
}

/// Drives `/sync` and converts responses into [`InboundEvent`]s.
pub struct SyncPoller {
    client: Arc<HomeserverClient>,
    decryptor: Option<Arc<dyn Decryptor>>,
    timeout: Duration,
    cursor: SyncCursor,
}

impl SyncPoller {
    pub fn new(client: Arc<HomeserverClient>, timeout: Duration) -> Self {
        Self {
            client,
            decryptor: None,
            timeout,
            cursor: SyncCursor::default(),
        }
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Resume from and keep saving the sync token stored for `account`.
    pub fn with_state(mut self, db: Arc<dyn Database>, account: impl Into<String>) -> Self {
        self.cursor = SyncCursor::stored(db, account.into());
        self
    }

    /// Poll until cancelled or the receiver goes away.
    ///
    /// Returns an error after repeated consecutive sync failures.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<InboundEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError> {
        self.cursor.load().await;
        let mut failures = 0u32;
        loop {
            let response = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                response = self.sync_once() => response,
            };
            let response = match response {
                Ok(response) => {
                    failures = 0;
                    response
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        tracing::error!("Sync failed {} times in a row: {}", failures, e);
                        return Err(e);
                    }
                    let backoff = Duration::from_secs(1 << failures).min(MAX_BACKOFF);
                    tracing::warn!("Sync failed, retrying in {:?}: {}", backoff, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            let next_batch = response.next_batch.clone();
            for event in self.convert(response).await {
                if tx.send(event).await.is_err() {
                    tracing::debug!("Inbound receiver dropped, stopping sync");
                    return Ok(());
                }
            }
            self.cursor.advance(next_batch).await;
        }
    }

    async fn sync_once(&self) -> Result<SyncResponse, ChannelError> {
        let mut query = vec![("timeout", self.timeout.as_millis().to_string())];
        if let Some(since) = &self.cursor.since {
            query.push(("since", since.clone()));
        }
        self.client
            .request(Method::GET, "/_matrix/client/v3/sync", &query, None)
            .await
    }

    async fn convert(&self, response: SyncResponse) -> Vec<InboundEvent> {
        let own_user = self.client.user_id();
        let mut out = Vec::new();

        for (room_id, room) in response.rooms.invite {
            let Ok(room_id) = RoomId::parse(room_id) else {
                continue;
            };
            if let Some(invite) = invite_event(&room_id, &room.invite_state.events, own_user) {
                self.client
                    .record_membership(&room_id, &invite.state_key, Membership::Invite);
                out.push(InboundEvent::Membership(invite));
            }
        }

        for (room_id, room) in response.rooms.join {
            let Ok(room_id) = RoomId::parse(room_id) else {
                continue;
            };
            let events = room.state.events.iter().chain(room.timeline.events.iter());
            for value in events {
                let Some(raw) = RawEvent::from_value(value) else {
                    continue;
                };
                match raw.event_type.as_str() {
                    "m.room.member" => {
                        if let Some(member) = member_event(&room_id, &raw, EventSource::Joined) {
                            self.client.record_membership(
                                &room_id,
                                &member.state_key,
                                member.membership,
                            );
                            out.push(InboundEvent::Membership(member));
                        }
                    }
                    "m.room.message" => {
                        if let Some(message) = plaintext_message(&room_id, &raw) {
                            out.push(InboundEvent::Message(message));
                        }
                    }
                    "m.room.encrypted" => {
                        if let Some(event) = self.decrypt(&room_id, &raw, value).await {
                            out.push(event);
                        }
                    }
                    _ => {}
                }
            }
        }
        out
    }

    async fn decrypt(
        &self,
        room_id: &RoomId,
        raw: &RawEvent,
        value: &Value,
    ) -> Option<InboundEvent> {
        let event_id = EventId::parse(raw.event_id.clone()?).ok()?;
        let sender = UserId::parse(raw.sender.clone()).ok()?;
        let result = match &self.decryptor {
            Some(decryptor) => decryptor.decrypt(room_id, value).await,
            None => Err("no decryptor configured".to_string()),
        };
        Some(match result {
            Ok(decrypted) => InboundEvent::Message(MessageEvent {
                event_id,
                room_id: room_id.clone(),
                sender,
                timestamp: raw.timestamp(),
                body: decrypted.body,
                encryption: Some(decrypted.encryption),
            }),
            Err(reason) => InboundEvent::DecryptionFailed {
                room_id: room_id.clone(),
                event_id,
                sender,
                timestamp: raw.timestamp(),
                reason,
            },
        })
    }
}

fn member_event(room_id: &RoomId, raw: &RawEvent, source: EventSource) -> Option<MembershipEvent> {
    let membership = Membership::parse(raw.content_str("membership")?)?;
    let prev_membership = raw
        .unsigned
        .get("prev_content")
        .and_then(|prev| prev.get("membership"))
        .and_then(Value::as_str)
        .and_then(Membership::parse);
    Some(MembershipEvent {
        event_id: raw.event_id.clone().and_then(|id| EventId::parse(id).ok()),
        room_id: room_id.clone(),
        sender: UserId::parse(raw.sender.clone()).ok()?,
        state_key: UserId::parse(raw.state_key.clone()?).ok()?,
        membership,
        prev_membership,
        is_direct: raw
            .content
            .get("is_direct")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        invite_state: Vec::new(),
        source,
    })
}

fn stripped_state(raw: &RawEvent) -> Option<StrippedState> {
    Some(match raw.event_type.as_str() {
        "m.room.join_rules" => StrippedState::JoinRules {
            join_rule: raw.content_str("join_rule").unwrap_or_default().to_string(),
        },
        "m.room.create" => StrippedState::Create {
            sender: UserId::parse(raw.sender.clone()).ok()?,
        },
        "m.room.name" => StrippedState::Name,
        "m.room.avatar" => StrippedState::Avatar,
        "m.room.topic" => StrippedState::Topic,
        "m.room.canonical_alias" => StrippedState::CanonicalAlias,
        "m.room.encryption" => StrippedState::Encryption {
            algorithm: raw.content_str("algorithm").unwrap_or_default().to_string(),
        },
        other => StrippedState::Other {
            event_type: other.to_string(),
        },
    })
}

/// Build the invite event for `own_user`, carrying the rest of the stripped state.
fn invite_event(room_id: &RoomId, events: &[Value], own_user: &UserId) -> Option<MembershipEvent> {
    let mut invite = None;
    let mut state = Vec::new();
    for raw in events.iter().filter_map(RawEvent::from_value) {
        let is_own_invite = raw.event_type == "m.room.member"
            && raw.state_key.as_deref() == Some(own_user.as_str())
            && raw.content_str("membership") == Some("invite");
        if is_own_invite {
            invite = member_event(room_id, &raw, EventSource::Invite);
        } else if raw.event_type != "m.room.member" {
            state.extend(stripped_state(&raw));
        }
    }
    let mut invite = invite?;
    invite.invite_state = state;
    Some(invite)
}

fn plaintext_message(room_id: &RoomId, raw: &RawEvent) -> Option<MessageEvent> {
    Some(MessageEvent {
        event_id: EventId::parse(raw.event_id.clone()?).ok()?,
        room_id: room_id.clone(),
        sender: UserId::parse(raw.sender.clone()).ok()?,
        timestamp: raw.timestamp(),
        body: raw.content_str("body")?.to_string(),
        encryption: None,
    })
}
