//! Invite inspection: only private, encrypted, one-to-one rooms are joined.

use std::collections::BTreeSet;

use crate::matrix::events::SUPPORTED_ENCRYPTION_ALGORITHM;
use crate::matrix::{MembershipEvent, StrippedState, UserId};

/// Why an invite was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteRejection {
    ForeignServer { server: String },
    NotDirect,
    JoinRuleNotInvite { join_rule: String },
    CreatedByOther { creator: UserId },
    HasName,
    HasAvatar,
    HasTopic,
    HasCanonicalAlias,
    UnsupportedEncryption { algorithm: String },
    NotEncrypted,
}

impl InviteRejection {
    /// Log-facing description of the problem.
    pub fn problem(&self) -> String {
        match self {
            Self::ForeignServer { server } => format!("inviter is on {}", server),
            Self::NotDirect => "invite isn't flagged as direct".to_string(),
            Self::JoinRuleNotInvite { join_rule } => {
                format!("join rule is {} instead of invite", join_rule)
            }
            Self::CreatedByOther { creator } => {
                format!("room was created by a different user ({})", creator)
            }
            Self::HasName => "room has name".to_string(),
            Self::HasAvatar => "room has avatar".to_string(),
            Self::HasTopic => "room has topic".to_string(),
            Self::HasCanonicalAlias => "room has canonical alias".to_string(),
            Self::UnsupportedEncryption { algorithm } => {
                format!("room has unknown encryption algorithm {}", algorithm)
            }
            Self::NotEncrypted => "room is not encrypted".to_string(),
        }
    }

    /// Reason sent with the leave.
    pub fn leave_reason(&self, authorized_servers: &BTreeSet<String>) -> String {
        match self {
            Self::ForeignServer { .. } => {
                let servers: Vec<&str> = authorized_servers.iter().map(String::as_str).collect();
                format!("This bot only serves users on {}", servers.join(", "))
            }
            _ => "This bot only accepts invites to encrypted direct chats".to_string(),
        }
    }
}

/// Check an invite addressed to the agent.
pub fn inspect_invite(
    event: &MembershipEvent,
    authorized_servers: &BTreeSet<String>,
) -> Result<(), InviteRejection> {
    let inviter_server = event.sender.server_name().to_ascii_lowercase();
    if !authorized_servers.contains(&inviter_server) {
        return Err(InviteRejection::ForeignServer {
            server: inviter_server,
        });
    }
    if !event.is_direct {
        return Err(InviteRejection::NotDirect);
    }

    let mut encrypted = false;
    for state in &event.invite_state {
        match state {
            StrippedState::JoinRules { join_rule } if join_rule != "invite" => {
                return Err(InviteRejection::JoinRuleNotInvite {
                    join_rule: join_rule.clone(),
                });
            }
            StrippedState::Create { sender } if *sender != event.sender => {
                return Err(InviteRejection::CreatedByOther {
                    creator: sender.clone(),
                });
            }
            StrippedState::Name => return Err(InviteRejection::HasName),
            StrippedState::Avatar => return Err(InviteRejection::HasAvatar),
            StrippedState::Topic => return Err(InviteRejection::HasTopic),
            StrippedState::CanonicalAlias => return Err(InviteRejection::HasCanonicalAlias),
            StrippedState::Encryption { algorithm } => {
                if algorithm != SUPPORTED_ENCRYPTION_ALGORITHM {
                    return Err(InviteRejection::UnsupportedEncryption {
                        algorithm: algorithm.clone(),
                    });
                }
                encrypted = true;
            }
            _ => {}
        }
    }
    if !encrypted {
        return Err(InviteRejection::NotEncrypted);
    }
    Ok(())
}
