//! Conversation handling: admitted messages in, replies out.

pub mod commands;
pub mod dispatcher;
mod runtime;
pub mod session;

pub use self::commands::{Command, ParsedMessage};
pub use self::dispatcher::{CommandContext, Dispatcher};
pub use self::runtime::AgentRuntime;
pub use self::session::{
    Continuation, ConversationState, InMemorySessionStore, Pending, SessionStore,
};
