//! Environment-backed configuration for `airlock-inspect`.

use std::{
    env,
    error::Error,
    fmt,
    path::PathBuf,
};

const DEFAULT_STORE_PATH: &str = "./.airlock-store/fetch-tasks.db";

/// Runtime configuration for one inspection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectConfig {
    /// Path of the SQLite task store to open.
    pub store_path: PathBuf,
    /// Server name of the account to inspect.
    pub server_name: String,
    /// User ID of the account to inspect.
    pub user_id: String,
}

impl InspectConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let store_path = optional_trimmed_env("AIRLOCK_STORE_PATH", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));
        let server_name = required_trimmed_env("AIRLOCK_SERVER_NAME", &mut lookup)?;
        let user_id = required_trimmed_env("AIRLOCK_USER_ID", &mut lookup)?;

        Ok(Self {
            store_path,
            server_name,
            user_id,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is missing or empty.
    MissingValue { key: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingValue { key } => write!(f, "missing required {key}"),
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::MissingValue { key })
}
