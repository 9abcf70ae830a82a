//! Resolution of the single other participant of a conversation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::GuardError;
use crate::matrix::{MessagingClient, RoomId, UserId};

/// Caches which rooms passed the two-member check, and with whom.
///
/// `None` entries mark rooms that failed the check.
pub struct MemberResolver {
    messenger: Arc<dyn MessagingClient>,
    validated: Mutex<HashMap<RoomId, Option<UserId>>>,
}

impl MemberResolver {
    pub fn new(messenger: Arc<dyn MessagingClient>) -> Self {
        Self {
            messenger,
            validated: Mutex::new(HashMap::new()),
        }
    }

    /// Find the one member of `room_id` that isn't the agent.
    ///
    /// `allow_validated` consults the validity cache first; `allow_local`
    /// lets the messaging client's member cache stand in for a server fetch.
    /// Whatever is computed is written back to the validity cache.
    pub async fn other_member(
        &self,
        room_id: &RoomId,
        allow_validated: bool,
        allow_local: bool,
    ) -> Result<UserId, GuardError> {
        let mut validated = self.validated.lock().await;
        if allow_validated && let Some(entry) = validated.get(room_id) {
            return entry.clone().ok_or(GuardError::RoomInvalid);
        }

        let mut members = if allow_local {
            self.messenger.cached_members(room_id).await?
        } else {
            Vec::new()
        };
        let from_cache = !members.is_empty();
        if !from_cache {
            members = self.messenger.joined_members(room_id).await?;
        }
        members.sort();
        members.dedup();
        tracing::debug!(
            room_id = %room_id,
            from_cache,
            "Got {} member(s) in room",
            members.len()
        );

        if members.len() != 2 {
            validated.insert(room_id.clone(), None);
            return Err(GuardError::WrongMemberCount {
                count: members.len(),
            });
        }

        let own = self.messenger.user_id();
        let other = if members[0] == *own {
            members[1].clone()
        } else if members[1] == *own {
            members[0].clone()
        } else {
            return Err(GuardError::AgentNotMember {
                own_user: own.clone(),
            });
        };
        validated.insert(room_id.clone(), Some(other.clone()));
        Ok(other)
    }

    /// Drop the cached verdict for a room.
    pub async fn forget(&self, room_id: &RoomId) {
        self.validated.lock().await.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingMessenger;

    fn setup() -> (Arc<RecordingMessenger>, MemberResolver, RoomId) {
        let messenger = Arc::new(RecordingMessenger::new("@botbot:example.com"));
        let resolver = MemberResolver::new(messenger.clone());
        (messenger, resolver, RoomId::parse("!dm:example.com").unwrap())
    }

    fn bot() -> UserId {
        UserId::new("botbot", "example.com")
    }

    fn alice() -> UserId {
        UserId::new("alice", "example.com")
    }

    #[tokio::test]
    async fn two_members_resolve_and_are_cached() {
        let (messenger, resolver, room) = setup();
        messenger.set_members(&room, vec![bot(), alice()]);

        assert_eq!(resolver.other_member(&room, true, true).await.unwrap(), alice());
        assert_eq!(resolver.other_member(&room, true, true).await.unwrap(), alice());
        assert_eq!(messenger.member_lookups(), 1);
    }

    #[tokio::test]
    async fn third_member_marks_room_invalid() {
        let (messenger, resolver, room) = setup();
        messenger.set_members(&room, vec![bot(), alice()]);
        resolver.other_member(&room, true, true).await.unwrap();

        messenger.set_members(
            &room,
            vec![bot(), alice(), UserId::new("carol", "example.com")],
        );
        let err = resolver
            .other_member(&room, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::WrongMemberCount { count: 3 }));

        let err = resolver
            .other_member(&room, true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::RoomInvalid));
    }

    #[tokio::test]
    async fn local_cache_is_used_when_allowed() {
        let (messenger, resolver, room) = setup();
        messenger.set_cached_members(&room, vec![alice(), bot()]);

        assert_eq!(resolver.other_member(&room, false, true).await.unwrap(), alice());
        assert_eq!(messenger.member_lookups(), 0);

        messenger.set_members(&room, vec![bot()]);
        let err = resolver
            .other_member(&room, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::WrongMemberCount { count: 1 }));
        assert_eq!(messenger.member_lookups(), 1);
    }

    #[tokio::test]
    async fn room_without_agent_is_an_error() {
        let (messenger, resolver, room) = setup();
        messenger.set_members(&room, vec![alice(), UserId::new("carol", "example.com")]);
        let err = resolver
            .other_member(&room, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::AgentNotMember { .. }));
    }
}
