//! Admission guard for inbound membership and message events.
//!
//! The agent only takes part in one-to-one encrypted rooms with a user from
//! an authorized server, and only acts on fresh messages from that user's
//! verified devices.

pub mod invite;
pub mod members;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::GuardError;
use crate::matrix::{
    EventSource, Membership, MembershipEvent, MessageEvent, MessagingClient, Notice, RoomId,
    TrustState, UserId,
};

pub use self::invite::{InviteRejection, inspect_invite};
pub use self::members::MemberResolver;

/// Messages older than this are never processed.
pub const STALENESS_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

pub const UNENCRYPTED_NOTICE: &str = "This bot only responds to encrypted messages";

const LEAVE_NOT_DIRECT: &str = "This bot only accepts direct chat invites";
const LEAVE_MEMBER_CHECK_FAILED: &str = "Failed to check members in room";
const LEAVE_THIRD_MEMBER: &str = "Another user joined the room";

/// What the guard did with a membership event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipOutcome {
    Ignored,
    Joined,
    Left { reason: String },
    /// A collaborator call failed; nothing else was done.
    Failed,
}

/// Why a message was dropped without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OwnMessage,
    RoomCheckFailed,
    UnexpectedSender,
    Stale,
}

/// Why a message was refused with a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Unencrypted,
    InsufficientTrust(TrustState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageVerdict {
    Admit,
    Ignore(IgnoreReason),
    Reject(RejectReason),
}

pub struct Guard {
    messenger: Arc<dyn MessagingClient>,
    members: MemberResolver,
    authorized_servers: BTreeSet<String>,
    min_trust: TrustState,
}

impl Guard {
    /// The agent's own server is always authorized.
    pub fn new(
        messenger: Arc<dyn MessagingClient>,
        allowed_servers: &[String],
        min_trust: TrustState,
    ) -> Self {
        let mut authorized_servers: BTreeSet<String> = allowed_servers
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        authorized_servers.insert(messenger.user_id().server_name().to_ascii_lowercase());
        Self {
            members: MemberResolver::new(Arc::clone(&messenger)),
            messenger,
            authorized_servers,
            min_trust,
        }
    }

    pub fn members(&self) -> &MemberResolver {
        &self.members
    }

    /// Whether an event that failed to decrypt should be answered. It has to
    /// pass the same sender, room and freshness gates as a message.
    pub async fn admit_decryption_failure(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        timestamp: DateTime<Utc>,
    ) -> MessageVerdict {
        match self.screen_origin(room_id, sender, timestamp).await {
            Some(reason) => MessageVerdict::Ignore(reason),
            None => MessageVerdict::Admit,
        }
    }

    async fn screen_origin(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        timestamp: DateTime<Utc>,
    ) -> Option<IgnoreReason> {
        if sender == self.messenger.user_id() {
            return Some(IgnoreReason::OwnMessage);
        }

        match self.members.other_member(room_id, true, true).await {
            Err(e) => {
                tracing::warn!("Ignoring event: failed to check expected user in room: {}", e);
                return Some(IgnoreReason::RoomCheckFailed);
            }
            Ok(expected) if expected != *sender => {
                tracing::debug!(expected_sender = %expected, "Ignoring event from unexpected user");
                return Some(IgnoreReason::UnexpectedSender);
            }
            Ok(_) => {}
        }

        if Utc::now() - timestamp > STALENESS_WINDOW {
            tracing::debug!("Ignoring event older than 5 minutes");
            return Some(IgnoreReason::Stale);
        }
        None
    }

    pub async fn handle_membership(&self, event: &MembershipEvent) -> MembershipOutcome {
        tracing::debug!(
            state_key = %event.state_key,
            membership = event.membership.as_str(),
            prev_membership = event.prev_membership.map(Membership::as_str),
            source = ?event.source,
            "Received member event"
        );

        if event.state_key == *self.messenger.user_id() {
            if event.membership != Membership::Invite || event.source != EventSource::Invite {
                tracing::debug!("Ignoring non-invite member event for self");
                return MembershipOutcome::Ignored;
            }
            return match inspect_invite(event, &self.authorized_servers) {
                Err(rejection) => {
                    tracing::debug!(problem = %rejection.problem(), "Rejecting invite");
                    self.leave(&event.room_id, rejection.leave_reason(&self.authorized_servers))
                        .await
                }
                Ok(()) => self.accept_invite(&event.room_id).await,
            };
        }

        if event.source != EventSource::Joined {
            tracing::debug!("Ignoring state event in invite stream");
            return MembershipOutcome::Ignored;
        }

        match self.members.other_member(&event.room_id, false, true).await {
            Ok(_) => MembershipOutcome::Ignored,
            Err(GuardError::WrongMemberCount { count }) => {
                tracing::debug!("Room has {} members now, leaving", count);
                self.leave(&event.room_id, LEAVE_THIRD_MEMBER.to_string())
                    .await
            }
            Err(e) => {
                tracing::error!(
                    "Failed to get members after member event from someone else: {}",
                    e
                );
                MembershipOutcome::Failed
            }
        }
    }

    async fn accept_invite(&self, room_id: &RoomId) -> MembershipOutcome {
        if let Err(e) = self.messenger.join_room(room_id).await {
            tracing::error!("Failed to accept invite: {}", e);
            return MembershipOutcome::Failed;
        }
        match self.members.other_member(room_id, false, false).await {
            Ok(other) => {
                tracing::debug!(other = %other, "Room only has 2 members, staying in room");
                MembershipOutcome::Joined
            }
            Err(GuardError::WrongMemberCount { count }) => {
                tracing::debug!("Room has {} members after accepting invite, leaving", count);
                self.leave(room_id, LEAVE_NOT_DIRECT.to_string()).await
            }
            Err(e) => {
                tracing::error!("Failed to check members after accepting invite: {}", e);
                self.leave(room_id, LEAVE_MEMBER_CHECK_FAILED.to_string())
                    .await
            }
        }
    }

    async fn leave(&self, room_id: &RoomId, reason: String) -> MembershipOutcome {
        if let Err(e) = self.messenger.leave_room(room_id, &reason).await {
            tracing::error!(reason = %reason, "Failed to leave room: {}", e);
        }
        self.members.forget(room_id).await;
        MembershipOutcome::Left { reason }
    }

    /// Run the message gates in order, replying when a gate calls for it.
    pub async fn admit_message(&self, event: &MessageEvent) -> MessageVerdict {
        tracing::debug!(message_ts = %event.timestamp, "Received message event");
        if let Some(reason) = self
            .screen_origin(&event.room_id, &event.sender, event.timestamp)
            .await
        {
            return MessageVerdict::Ignore(reason);
        }

        let Some(encryption) = event.encryption else {
            tracing::debug!("Dropping unencrypted message");
            self.notify(event, UNENCRYPTED_NOTICE.to_string()).await;
            return MessageVerdict::Reject(RejectReason::Unencrypted);
        };

        let forwarded_too_weak =
            encryption.forwarded_keys && self.min_trust > TrustState::ForwardedKeys;
        if encryption.trust < self.min_trust || forwarded_too_weak {
            tracing::debug!(
                trust_state = %encryption.trust,
                forwarded_keys = encryption.forwarded_keys,
                "Dropping message with insufficient verification level"
            );
            self.notify(
                event,
                trust_notice(encryption.trust, encryption.forwarded_keys),
            )
            .await;
            return MessageVerdict::Reject(RejectReason::InsufficientTrust(encryption.trust));
        }

        MessageVerdict::Admit
    }

    async fn notify(&self, event: &MessageEvent, body: String) {
        let notice = Notice::plaintext(body).in_reply_to(event.event_id.clone());
        if let Err(e) = self.messenger.send_notice(&event.room_id, notice).await {
            tracing::error!("Failed to send guard notice: {}", e);
        }
    }
}

/// Notice explaining why a message's device trust was not enough.
pub fn trust_notice(trust: TrustState, forwarded_keys: bool) -> String {
    let explanation = if forwarded_keys || trust == TrustState::ForwardedKeys {
        "Your message was decrypted with forwarded keys, so its sender can't be verified."
    } else {
        match trust {
            TrustState::UnknownDevice => {
                "Your message was sent from a device this bot doesn't know about."
            }
            TrustState::CrossSignedUntrusted => {
                "Your cross-signing keys changed since this bot first saw them. \
                 Please verify your new identity with the bot."
            }
            TrustState::Blacklisted | TrustState::Unset => {
                "Your device is not verified. Please verify it with cross-signing."
            }
            _ => "Your device is not verified well enough for this bot.",
        }
    };
    format!(
        "{}\n\nInsufficient verification level {} (forwarded keys: {})",
        explanation, trust, forwarded_keys
    )
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::matrix::{EncryptionInfo, EventId, StrippedState, UserId};
    use crate::testing::RecordingMessenger;

    fn bot() -> UserId {
        UserId::new("botbot", "example.com")
    }

    fn alice() -> UserId {
        UserId::new("alice", "example.com")
    }

    fn room() -> RoomId {
        RoomId::parse("!dm:example.com").unwrap()
    }

    fn setup() -> (Arc<RecordingMessenger>, Guard) {
        let messenger = Arc::new(RecordingMessenger::new("@botbot:example.com"));
        let guard = Guard::new(messenger.clone(), &[], TrustState::CrossSignedTofu);
        (messenger, guard)
    }

    fn invite() -> MembershipEvent {
        MembershipEvent {
            event_id: None,
            room_id: room(),
            sender: alice(),
            state_key: bot(),
            membership: Membership::Invite,
            prev_membership: None,
            is_direct: true,
            invite_state: vec![
                StrippedState::Create { sender: alice() },
                StrippedState::JoinRules {
                    join_rule: "invite".to_string(),
                },
                StrippedState::Encryption {
                    algorithm: "m.megolm.v1.aes-sha2".to_string(),
                },
            ],
            source: EventSource::Invite,
        }
    }

    fn message(trust: TrustState) -> MessageEvent {
        MessageEvent {
            event_id: EventId::parse("$msg").unwrap(),
            room_id: room(),
            sender: alice(),
            timestamp: Utc::now(),
            body: "ping".to_string(),
            encryption: Some(EncryptionInfo {
                trust,
                forwarded_keys: false,
            }),
        }
    }

    #[tokio::test]
    async fn private_invite_is_joined() {
        let (messenger, guard) = setup();
        messenger.set_members(&room(), vec![bot(), alice()]);
        assert_eq!(guard.handle_membership(&invite()).await, MembershipOutcome::Joined);
        assert_eq!(messenger.joined_rooms(), vec![room()]);
        assert!(messenger.left_rooms().is_empty());
    }

    #[tokio::test]
    async fn group_invite_is_left_after_join() {
        let (messenger, guard) = setup();
        messenger.set_members(
            &room(),
            vec![bot(), alice(), UserId::new("carol", "example.com")],
        );
        assert_eq!(
            guard.handle_membership(&invite()).await,
            MembershipOutcome::Left {
                reason: LEAVE_NOT_DIRECT.to_string()
            }
        );
    }

    #[tokio::test]
    async fn failed_member_check_after_join_leaves() {
        let (messenger, guard) = setup();
        messenger.fail_member_lookups(true);
        assert_eq!(
            guard.handle_membership(&invite()).await,
            MembershipOutcome::Left {
                reason: LEAVE_MEMBER_CHECK_FAILED.to_string()
            }
        );
    }

    #[tokio::test]
    async fn foreign_and_non_direct_invites_are_refused() {
        let (messenger, guard) = setup();
        let mut foreign = invite();
        foreign.sender = UserId::new("eve", "evil.org");
        guard.handle_membership(&foreign).await;

        let mut group = invite();
        group.is_direct = false;
        guard.handle_membership(&group).await;

        let reasons: Vec<String> = messenger.left_rooms().into_iter().map(|(_, r)| r).collect();
        assert_eq!(
            reasons,
            vec![
                "This bot only serves users on example.com".to_string(),
                "This bot only accepts invites to encrypted direct chats".to_string(),
            ]
        );
        assert!(messenger.joined_rooms().is_empty());
    }

    #[tokio::test]
    async fn allowed_servers_extend_authorization() {
        let messenger = Arc::new(RecordingMessenger::new("@botbot:example.com"));
        let guard = Guard::new(
            messenger.clone(),
            &["Partner.org".to_string()],
            TrustState::CrossSignedTofu,
        );
        let mut partner = invite();
        partner.sender = UserId::new("pat", "partner.org");
        partner.invite_state[0] = StrippedState::Create {
            sender: partner.sender.clone(),
        };
        messenger.set_members(&room(), vec![bot(), partner.sender.clone()]);
        assert_eq!(guard.handle_membership(&partner).await, MembershipOutcome::Joined);
    }

    #[tokio::test]
    async fn third_member_joining_makes_agent_leave() {
        let (messenger, guard) = setup();
        let carol = UserId::new("carol", "example.com");
        messenger.set_cached_members(&room(), vec![bot(), alice(), carol.clone()]);
        let join = MembershipEvent {
            event_id: Some(EventId::parse("$join").unwrap()),
            sender: carol.clone(),
            state_key: carol,
            membership: Membership::Join,
            prev_membership: Some(Membership::Invite),
            is_direct: false,
            invite_state: Vec::new(),
            source: EventSource::Joined,
            room_id: room(),
        };
        assert_eq!(
            guard.handle_membership(&join).await,
            MembershipOutcome::Left {
                reason: LEAVE_THIRD_MEMBER.to_string()
            }
        );
    }

    #[tokio::test]
    async fn verified_fresh_message_is_admitted() {
        let (messenger, guard) = setup();
        messenger.set_members(&room(), vec![bot(), alice()]);
        assert_eq!(
            guard.admit_message(&message(TrustState::CrossSignedTofu)).await,
            MessageVerdict::Admit
        );
        assert!(messenger.notices().is_empty());
    }

    #[tokio::test]
    async fn silent_drops() {
        let (messenger, guard) = setup();
        messenger.set_members(&room(), vec![bot(), alice()]);

        let mut own = message(TrustState::Verified);
        own.sender = bot();
        assert_eq!(
            guard.admit_message(&own).await,
            MessageVerdict::Ignore(IgnoreReason::OwnMessage)
        );

        let mut stranger = message(TrustState::Verified);
        stranger.sender = UserId::new("mallory", "example.com");
        assert_eq!(
            guard.admit_message(&stranger).await,
            MessageVerdict::Ignore(IgnoreReason::UnexpectedSender)
        );

        let mut old = message(TrustState::Verified);
        old.timestamp = Utc::now() - Duration::minutes(6);
        assert_eq!(
            guard.admit_message(&old).await,
            MessageVerdict::Ignore(IgnoreReason::Stale)
        );
        assert!(messenger.notices().is_empty());
    }

    #[tokio::test]
    async fn plaintext_and_untrusted_messages_get_plaintext_notices() {
        let (messenger, guard) = setup();
        messenger.set_members(&room(), vec![bot(), alice()]);

        let mut plain = message(TrustState::Verified);
        plain.encryption = None;
        assert_eq!(
            guard.admit_message(&plain).await,
            MessageVerdict::Reject(RejectReason::Unencrypted)
        );
        assert_eq!(
            guard.admit_message(&message(TrustState::UnknownDevice)).await,
            MessageVerdict::Reject(RejectReason::InsufficientTrust(TrustState::UnknownDevice))
        );

        let notices = messenger.notices();
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|(_, n)| !n.encrypted));
        assert_eq!(notices[0].1.body, UNENCRYPTED_NOTICE);
        assert!(notices[1].1.body.contains("device this bot doesn't know about"));
    }

    #[tokio::test]
    async fn forwarded_keys_are_rejected_even_at_high_trust() {
        let (messenger, guard) = setup();
        messenger.set_members(&room(), vec![bot(), alice()]);
        let mut forwarded = message(TrustState::Verified);
        forwarded.encryption = Some(EncryptionInfo {
            trust: TrustState::Verified,
            forwarded_keys: true,
        });
        assert!(matches!(
            guard.admit_message(&forwarded).await,
            MessageVerdict::Reject(RejectReason::InsufficientTrust(_))
        ));
        assert!(messenger.last_body().unwrap().contains("forwarded keys"));
    }

    #[test]
    fn trust_notices_differ_by_state() {
        let changed = trust_notice(TrustState::CrossSignedUntrusted, false);
        let unverified = trust_notice(TrustState::Unset, false);
        assert!(changed.contains("cross-signing keys changed"));
        assert!(unverified.contains("not verified"));
        assert!(
            unverified
                .ends_with("Insufficient verification level unverified (forwarded keys: false)")
        );
    }
}
