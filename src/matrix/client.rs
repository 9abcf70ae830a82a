//! Messaging collaborator interface.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::ChannelError;
use crate::matrix::ids::{EventId, RoomId, UserId};

/// An `m.notice` to send into a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Markdown body.
    pub body: String,
    /// Send through the encrypted channel. Guard rejections go out in plaintext.
    pub encrypted: bool,
    pub reply_to: Option<EventId>,
}

impl Notice {
    pub fn encrypted(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            encrypted: true,
            reply_to: None,
        }
    }

    pub fn plaintext(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            encrypted: false,
            reply_to: None,
        }
    }

    pub fn in_reply_to(mut self, event_id: EventId) -> Self {
        self.reply_to = Some(event_id);
        self
    }
}

/// A freshly established session for a provisioned identity.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub user_id: UserId,
    pub device_id: String,
    pub access_token: SecretString,
}

/// Operations the agent needs from the messaging network.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// The agent's own identity.
    fn user_id(&self) -> &UserId;

    async fn send_notice(&self, room_id: &RoomId, notice: Notice) -> Result<EventId, ChannelError>;

    async fn redact(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        reason: Option<&str>,
    ) -> Result<(), ChannelError>;

    async fn join_room(&self, room_id: &RoomId) -> Result<(), ChannelError>;

    async fn leave_room(&self, room_id: &RoomId, reason: &str) -> Result<(), ChannelError>;

    /// Authoritative joined members, fetched from the server.
    async fn joined_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, ChannelError>;

    /// Joined or invited members from the local state cache. May be empty.
    async fn cached_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, ChannelError>;

    async fn mark_read(&self, room_id: &RoomId, event_id: &EventId) -> Result<(), ChannelError>;

    /// Log in as `user_id` with a password, creating a new device.
    async fn login(
        &self,
        user_id: &UserId,
        password: &SecretString,
    ) -> Result<SessionCredentials, ChannelError>;
}
