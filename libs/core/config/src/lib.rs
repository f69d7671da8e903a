//! Environment-driven configuration helpers shared by workers and apps.
//!
//! Worker crates implement [`FromEnv`] for their own config structs and read
//! individual variables through the `env_*` helpers, so a bad value always
//! surfaces as a [`ConfigError`] naming the variable.

pub mod tracing;

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

impl ConfigError {
    /// Parse error for `key`
    pub fn parse(key: &str, details: impl ToString) -> Self {
        ConfigError::ParseError {
            key: key.to_string(),
            details: details.to_string(),
        }
    }
}

/// Application environment, read from `APP_ENV`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development, // Pretty logs, debug filter
    Production,  // JSON logs, quieter filter
}

impl Environment {
    /// Anything other than `production` (any case) is development
    pub fn from_env() -> Self {
        match env::var("APP_ENV") {
            Ok(value) if value.eq_ignore_ascii_case("production") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Read a string variable, falling back to `default` when unset
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a variable that must be set
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Read a variable that may be absent; an empty value counts as unset
pub fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse a variable, falling back to `default` when unset.
///
/// A set but unparsable value is an error, never the default.
pub fn env_parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::parse(key, e)),
        Err(_) => Ok(default),
    }
}

/// Read a duration given in whole milliseconds (`*_MS` variables)
pub fn env_duration_ms(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_parse_or(key, default_ms).map(Duration::from_millis)
}
