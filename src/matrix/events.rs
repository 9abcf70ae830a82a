//! Inbound events as seen by the agent, after transport and decryption.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::matrix::ids::{EventId, RoomId, UserId};

/// Megolm, the only room encryption algorithm the agent accepts.
pub const SUPPORTED_ENCRYPTION_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Event delivered by the inbound stream.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Membership(MembershipEvent),
    Message(MessageEvent),
    /// An encrypted event that could not be decrypted.
    DecryptionFailed {
        room_id: RoomId,
        event_id: EventId,
        sender: UserId,
        timestamp: DateTime<Utc>,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invite" => Some(Self::Invite),
            "join" => Some(Self::Join),
            "leave" => Some(Self::Leave),
            "ban" => Some(Self::Ban),
            "knock" => Some(Self::Knock),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Ban => "ban",
            Self::Knock => "knock",
        }
    }
}

/// Which part of the sync response an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Stripped state of a room the agent is invited to.
    Invite,
    /// State or timeline of a room the agent has joined.
    Joined,
}

/// Room state shared alongside an invite.
#[derive(Debug, Clone, PartialEq)]
pub enum StrippedState {
    JoinRules { join_rule: String },
    Create { sender: UserId },
    Name,
    Avatar,
    Topic,
    CanonicalAlias,
    Encryption { algorithm: String },
    Other { event_type: String },
}

#[derive(Debug, Clone)]
pub struct MembershipEvent {
    /// Absent for the stripped invite event.
    pub event_id: Option<EventId>,
    pub room_id: RoomId,
    pub sender: UserId,
    /// The user whose membership changed.
    pub state_key: UserId,
    pub membership: Membership,
    pub prev_membership: Option<Membership>,
    pub is_direct: bool,
    pub invite_state: Vec<StrippedState>,
    pub source: EventSource,
}

/// Verification level of the device that sent a message.
///
/// Variants are ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    Blacklisted,
    Unset,
    UnknownDevice,
    ForwardedKeys,
    CrossSignedUntrusted,
    CrossSignedTofu,
    CrossSignedVerified,
    Verified,
}

impl TrustState {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "blacklisted" => Some(Self::Blacklisted),
            "unset" | "unverified" => Some(Self::Unset),
            "unknown_device" => Some(Self::UnknownDevice),
            "forwarded_keys" | "forwarded" => Some(Self::ForwardedKeys),
            "cross_signed_untrusted" => Some(Self::CrossSignedUntrusted),
            "cross_signed_tofu" | "tofu" => Some(Self::CrossSignedTofu),
            "cross_signed_verified" => Some(Self::CrossSignedVerified),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blacklisted => "blacklisted",
            Self::Unset => "unverified",
            Self::UnknownDevice => "unknown_device",
            Self::ForwardedKeys => "forwarded_keys",
            Self::CrossSignedUntrusted => "cross_signed_untrusted",
            Self::CrossSignedTofu => "cross_signed_tofu",
            Self::CrossSignedVerified => "cross_signed_verified",
            Self::Verified => "verified",
        }
    }
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Present when the message arrived over the encrypted channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionInfo {
    pub trust: TrustState,
    pub forwarded_keys: bool,
}

#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub sender: UserId,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub encryption: Option<EncryptionInfo>,
}

impl MessageEvent {
    pub fn was_encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_states_are_ordered() {
        assert!(TrustState::Blacklisted < TrustState::Unset);
        assert!(TrustState::ForwardedKeys < TrustState::CrossSignedUntrusted);
        assert!(TrustState::CrossSignedUntrusted < TrustState::CrossSignedTofu);
        assert!(TrustState::CrossSignedTofu < TrustState::Verified);
    }

    #[test]
    fn trust_state_parse_accepts_labels() {
        assert_eq!(
            TrustState::parse("cross-signed-tofu"),
            Some(TrustState::CrossSignedTofu)
        );
        assert_eq!(TrustState::parse("Verified"), Some(TrustState::Verified));
        assert_eq!(TrustState::parse("unverified"), Some(TrustState::Unset));
        assert_eq!(TrustState::parse("sure"), None);
    }
}
