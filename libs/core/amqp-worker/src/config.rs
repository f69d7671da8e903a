//! Publisher and subscriber configuration
//!
//! Both configs have builder-style setters and can be loaded from the
//! environment through `core_config::FromEnv`.

use core_config::{env_duration_ms, env_or_default, env_parse_or, ConfigError, FromEnv};
use std::time::Duration;

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(max)
}

/// Configuration for the assured publisher
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Name used in logs and metric labels
    pub name: String,

    /// Maximum publish attempts per message (first publish included).
    /// A message nacked or lost on its last attempt resolves as failed.
    pub max_attempts: u32,

    /// First delay before reopening a channel during replay
    pub base_backoff: Duration,

    /// Upper bound for reopen delays
    pub max_backoff: Duration,
}

impl PublisherConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self {
            name: "publisher".to_string(),
            max_attempts: 10,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }

    /// Set the publisher name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the maximum attempts per message
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the reopen backoff bounds
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max.max(base);
        self
    }

    /// Delay before reopen attempt `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_backoff, self.max_backoff, attempt)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FromEnv for PublisherConfig {
    /// Reads, with defaults:
    /// - PUBLISHER_NAME ("publisher")
    /// - PUBLISHER_MAX_ATTEMPTS (10)
    /// - PUBLISHER_BASE_BACKOFF_MS (50)
    /// - PUBLISHER_MAX_BACKOFF_MS (5000)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new();
        let name = env_or_default("PUBLISHER_NAME", "publisher");
        let max_attempts = env_parse_or("PUBLISHER_MAX_ATTEMPTS", defaults.max_attempts)?;
        let base = env_duration_ms("PUBLISHER_BASE_BACKOFF_MS", defaults.base_backoff)?;
        let max = env_duration_ms("PUBLISHER_MAX_BACKOFF_MS", defaults.max_backoff)?;

        Ok(defaults
            .with_name(name)
            .with_max_attempts(max_attempts)
            .with_backoff(base, max))
    }
}

/// Configuration for the subscriber pool
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Unacknowledged deliveries allowed per consumer loop
    pub prefetch: u16,

    /// Prefix for generated consumer tags
    pub consumer_prefix: String,

    /// First delay before reopening a lost consumer channel
    pub reconnect_base_backoff: Duration,

    /// Upper bound for consumer reopen delays
    pub reconnect_max_backoff: Duration,
}

impl SubscriberConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self {
            prefetch: 1,
            consumer_prefix: "worker".to_string(),
            reconnect_base_backoff: Duration::from_millis(100),
            reconnect_max_backoff: Duration::from_secs(10),
        }
    }

    /// Set the prefetch count
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set the consumer tag prefix
    pub fn with_consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }

    /// Set the reconnect backoff bounds
    pub fn with_reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_backoff = base;
        self.reconnect_max_backoff = max.max(base);
        self
    }

    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn reconnect_backoff_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.reconnect_base_backoff,
            self.reconnect_max_backoff,
            attempt,
        )
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl FromEnv for SubscriberConfig {
    /// Reads, with defaults:
    /// - SUBSCRIBER_PREFETCH (1)
    /// - SUBSCRIBER_CONSUMER_PREFIX ("worker")
    /// - SUBSCRIBER_RECONNECT_BASE_MS (100)
    /// - SUBSCRIBER_RECONNECT_MAX_MS (10000)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new();
        let prefetch = env_parse_or("SUBSCRIBER_PREFETCH", defaults.prefetch)?;
        let prefix = env_or_default("SUBSCRIBER_CONSUMER_PREFIX", &defaults.consumer_prefix);
        let base = env_duration_ms("SUBSCRIBER_RECONNECT_BASE_MS", defaults.reconnect_base_backoff)?;
        let max = env_duration_ms("SUBSCRIBER_RECONNECT_MAX_MS", defaults.reconnect_max_backoff)?;

        Ok(defaults
            .with_prefetch(prefetch)
            .with_consumer_prefix(prefix)
            .with_reconnect_backoff(base, max))
    }
}
