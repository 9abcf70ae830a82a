//! Error types for botkeeper.

use crate::matrix::UserId;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Messaging error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Admin API error: {0}")]
    Admin(#[from] AdminError),

    #[error("Membership check failed: {0}")]
    Guard(#[from] GuardError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Inbound event stream ended unexpectedly")]
    StreamEnded,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Database backend unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "libsql")]
    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Errors from the messaging collaborator (homeserver transport).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid Matrix identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Homeserver returned {errcode} for {endpoint}: {message}")]
    Matrix {
        endpoint: String,
        status: u16,
        errcode: String,
        message: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Login failed for {user}: {reason}")]
    LoginFailed { user: String, reason: String },

    #[error("Encrypted sending is not available on this client")]
    EncryptionUnavailable,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ChannelError {
    /// Matrix error code, when the homeserver returned a structured error.
    pub fn errcode(&self) -> Option<&str> {
        match self {
            Self::Matrix { errcode, .. } => Some(errcode),
            _ => None,
        }
    }
}

/// Errors from the administrative collaborator.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Admin request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Admin API returned HTTP {status} for {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("No registration method configured (set REGISTER_SECRET or REGISTRATION_API_URL)")]
    RegistrationUnavailable,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures while resolving the other participant of a conversation.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Room has {count} members instead of 2")]
    WrongMemberCount { count: usize },

    #[error("Room already failed the two-member check")]
    RoomInvalid,

    #[error("Neither member of the room is the agent ({own_user})")]
    AgentNotMember { own_user: UserId },

    #[error("Failed to fetch members: {0}")]
    MemberLookup(#[from] ChannelError),
}

/// How a workflow failure should be reported internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operator input problem; not a failure of the system.
    Validation,
    /// Operator is not allowed to do this; logged at debug.
    Authorization,
    /// A collaborator call failed; logged at error with context.
    Collaborator,
}

/// Provisioning workflow step failures.
///
/// Every variant maps to a distinct operator-visible message. Collaborator
/// variants keep their source for logging but never show it to the operator.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("bot name is invalid")]
    NameInvalid,

    #[error("bot {0} does not exist")]
    NotFound(UserId),

    #[error("bot {0} is owned by someone else")]
    NotOwned(UserId),

    #[error("bot {0} is already owned by the caller")]
    AlreadyOwned(UserId),

    #[error("bot {0} is registered to someone else")]
    NameTaken(UserId),

    #[error("bot name {0} is unavailable upstream")]
    NameUnavailable(UserId),

    #[error("operator already owns {count} bots (limit {limit})")]
    TooManyBots { count: usize, limit: usize },

    #[error("failed to {step}: {source}")]
    Persistence {
        step: &'static str,
        #[source]
        source: DatabaseError,
    },

    #[error("failed to {step}: {source}")]
    Admin {
        step: &'static str,
        #[source]
        source: AdminError,
    },

    #[error("failed to log in as {bot}: {source}")]
    LoginFailed {
        bot: UserId,
        #[source]
        source: ChannelError,
    },
}

impl WorkflowError {
    pub fn persistence(step: &'static str, source: DatabaseError) -> Self {
        Self::Persistence { step, source }
    }

    pub fn admin(step: &'static str, source: AdminError) -> Self {
        Self::Admin { step, source }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Usage(_) | Self::NameInvalid | Self::NameUnavailable(_) => Severity::Validation,
            Self::AlreadyOwned(_) | Self::NameTaken(_) | Self::TooManyBots { .. } => {
                Severity::Validation
            }
            Self::NotFound(_) | Self::NotOwned(_) => Severity::Authorization,
            Self::Persistence { .. } | Self::Admin { .. } | Self::LoginFailed { .. } => {
                Severity::Collaborator
            }
        }
    }

    /// Text sent to the operator. Never contains collaborator error detail.
    pub fn operator_message(&self) -> String {
        match self {
            Self::Usage(usage) => format!("**Usage:** `{}`", usage),
            Self::NameInvalid => USERNAME_INVALID_MESSAGE.to_string(),
            Self::NotFound(_) => "That bot doesn't exist".to_string(),
            Self::NotOwned(_) => "That's not your bot".to_string(),
            Self::AlreadyOwned(_) => "You've already registered that bot. \
                 You can use `reset <username>` to reset the token."
                .to_string(),
            Self::NameTaken(_) | Self::NameUnavailable(_) => {
                "That username is already taken".to_string()
            }
            Self::TooManyBots { limit, .. } => {
                format!("You have too many bots already (limit: {})", limit)
            }
            Self::Persistence { step, .. } | Self::Admin { step, .. } => {
                let mut message = format!("Failed to {}", step);
                if let Some(first) = message.get_mut(..1) {
                    first.make_ascii_uppercase();
                }
                message
            }
            Self::LoginFailed { .. } => "Failed to log in as bot".to_string(),
        }
    }
}

pub(crate) const USERNAME_INVALID_MESSAGE: &str = "That username is not valid. Usernames must:

* Be between 5 and 32 characters long in total (i.e. 2-29 characters + `bot` suffix)
* Only contain lowercase letters (a-z), numbers (0-9) and dashes (-)
* Not start with dash
* End with `bot`";

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
