//! Per-operator conversation state.
//!
//! Each operator has at most one pending continuation: the step that will
//! receive their next message as part of a confirmation flow. The state is
//! in-memory only; operators restart multi-turn flows after a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::matrix::UserId;

/// Step that consumes the operator's next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    ConfirmReset,
    ConfirmDelete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub continuation: Continuation,
    /// Human-readable action, e.g. "resetting `@coolbot:example.com`".
    pub description: String,
    /// Scratch data passed from the first step to the continuation.
    pub data: BTreeMap<String, String>,
}

impl Pending {
    pub fn new(continuation: Continuation, description: impl Into<String>) -> Self {
        Self {
            continuation,
            description: description.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub pending: Option<Pending>,
}

impl ConversationState {
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }
}

/// Storage for conversation state, keyed by operator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Missing entries read as the idle state.
    async fn get(&self, operator: &UserId) -> ConversationState;

    async fn set(&self, operator: &UserId, state: ConversationState);

    async fn clear(&self, operator: &UserId);
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    states: Mutex<HashMap<UserId, ConversationState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, ConversationState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, operator: &UserId) -> ConversationState {
        self.states().get(operator).cloned().unwrap_or_default()
    }

    async fn set(&self, operator: &UserId, state: ConversationState) {
        if state.is_idle() {
            self.states().remove(operator);
        } else {
            self.states().insert(operator.clone(), state);
        }
    }

    async fn clear(&self, operator: &UserId) {
        self.states().remove(operator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_is_scoped_per_operator() {
        let store = InMemorySessionStore::new();
        let alice = UserId::new("alice", "example.com");
        let bob = UserId::new("bob", "example.com");

        let pending = Pending::new(Continuation::ConfirmReset, "resetting `x`")
            .with_data("bot", "@coolbot:example.com");
        store
            .set(
                &alice,
                ConversationState {
                    pending: Some(pending.clone()),
                },
            )
            .await;

        assert_eq!(store.get(&alice).await.pending, Some(pending));
        assert!(store.get(&bob).await.is_idle());

        store.clear(&alice).await;
        assert!(store.get(&alice).await.is_idle());
    }
}
