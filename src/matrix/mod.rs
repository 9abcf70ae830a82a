//! Messaging network plumbing: identifiers, inbound events, and the
//! homeserver adapters.

pub mod client;
pub mod events;
pub mod http;
pub mod ids;
pub mod sync;

pub use client::{MessagingClient, Notice, SessionCredentials};
pub use events::{
    EncryptionInfo, EventSource, InboundEvent, Membership, MembershipEvent, MessageEvent,
    StrippedState, TrustState,
};
pub use http::{HomeserverClient, build_http_client};
pub use ids::{EventId, RoomId, UserId};
pub use sync::{DecryptedMessage, Decryptor, SyncPoller};
