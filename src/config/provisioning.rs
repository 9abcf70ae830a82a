use std::time::Duration;

use crate::config::helpers::{optional_env, parse_bool_env, parse_env};
use crate::error::ConfigError;
use crate::matrix::TrustState;

/// Limits and policy for the provisioning commands.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// `None` means unlimited.
    pub max_bots_per_operator: Option<usize>,
    pub self_destruct_delay: Duration,
    pub min_trust_level: TrustState,
    pub store_credentials: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_bots_per_operator: None,
            self_destruct_delay: Duration::from_secs(300),
            min_trust_level: TrustState::CrossSignedTofu,
            store_credentials: false,
        }
    }
}

impl ProvisioningConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_bots: usize = parse_env("MAX_BOTS_PER_OPERATOR", 0, "a non-negative integer")?;
        let self_destruct_secs: u64 = parse_env(
            "SELF_DESTRUCT_SECS",
            defaults.self_destruct_delay.as_secs(),
            "a non-negative integer",
        )?;

        let min_trust_level = match optional_env("MIN_TRUST_LEVEL")? {
            Some(raw) => TrustState::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "MIN_TRUST_LEVEL".to_string(),
                message: format!(
                    "expected one of unverified, unknown_device, forwarded_keys, \
                     cross_signed_untrusted, cross_signed_tofu, cross_signed_verified, \
                     verified; got '{raw}'"
                ),
            })?,
            None => defaults.min_trust_level,
        };

        Ok(Self {
            max_bots_per_operator: (max_bots > 0).then_some(max_bots),
            self_destruct_delay: Duration::from_secs(self_destruct_secs),
            min_trust_level,
            store_credentials: parse_bool_env("STORE_BOT_CREDENTIALS", false)?,
        })
    }
}
