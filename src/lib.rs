//! botkeeper: a Matrix agent that provisions and administers bot accounts for
//! operators over encrypted direct chats.
//!
//! Inbound events flow from the [`matrix::SyncPoller`] through the
//! [`guard::Guard`] (membership and trust checks) into the
//! [`agent::Dispatcher`], which runs [`provisioning`] workflows against the
//! [`admin::AdminApi`] and [`db::Database`] collaborators. Replies carrying
//! credentials are redacted later by the [`selfdestruct::SelfDestructScheduler`].

pub mod admin;
pub mod agent;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod matrix;
pub mod provisioning;
pub mod selfdestruct;
pub mod tasks;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::Config;
pub use error::{Error, Result};
