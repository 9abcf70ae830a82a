use std::path::PathBuf;

use crate::config::helpers::optional_env;
use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub libsql_path: PathBuf,
}

/// `~/.botkeeper/botkeeper.db`
pub fn default_libsql_path() -> PathBuf {
    crate::bootstrap::botkeeper_dir().join("botkeeper.db")
}

impl DatabaseConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let libsql_path = optional_env("LIBSQL_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(default_libsql_path);
        Ok(Self { libsql_path })
    }
}
