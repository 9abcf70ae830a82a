//! Typed Matrix identifiers.
//!
//! Only the parts of the identifier grammar the agent relies on are checked:
//! sigil, a non-empty localpart, and a non-empty server name.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// A Matrix user ID (`@localpart:server`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Parse a full user ID.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ChannelError> {
        let raw = raw.into();
        let Some(rest) = raw.strip_prefix('@') else {
            return Err(ChannelError::InvalidIdentifier(raw));
        };
        match rest.split_once(':') {
            Some((local, server)) if !local.is_empty() && !server.is_empty() => Ok(Self(raw)),
            _ => Err(ChannelError::InvalidIdentifier(raw)),
        }
    }

    /// Build a user ID from its parts.
    pub fn new(localpart: &str, server_name: &str) -> Self {
        Self(format!("@{}:{}", localpart, server_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn localpart(&self) -> &str {
        self.0[1..].split_once(':').map(|(l, _)| l).unwrap_or_default()
    }

    pub fn server_name(&self) -> &str {
        self.0[1..].split_once(':').map(|(_, s)| s).unwrap_or_default()
    }

    /// `https://matrix.to` permalink for this user.
    pub fn matrix_to_url(&self) -> String {
        format!("https://matrix.to/#/{}", urlencoding::encode(&self.0))
    }
}

impl TryFrom<String> for UserId {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $sigil:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: impl Into<String>) -> Result<Self, ChannelError> {
                let raw = raw.into();
                if raw.len() > 1 && raw.starts_with($sigil) {
                    Ok(Self(raw))
                } else {
                    Err(ChannelError::InvalidIdentifier(raw))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ChannelError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// A Matrix room ID (`!opaque:server`).
    RoomId,
    '!'
);

opaque_id!(
    /// A Matrix event ID (`$opaque`).
    EventId,
    '$'
);
