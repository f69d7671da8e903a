//! Configuration for the relay service

use amqp_worker::SubscriberSpec;
use core_config::{env_optional, env_or_default, env_parse_or, ConfigError, FromEnv};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Topic exchange the relay publishes to
    pub exchange: String,

    /// Queue the relay consumes from
    pub queue: String,

    /// Binding and publish routing key
    pub routing_key: String,

    /// Consumer loops for the queue
    pub concurrency: usize,

    /// Messages published per run
    pub messages: usize,

    /// Broker to relay through (`AMQP_URL`); the in-memory broker when unset
    pub amqp_url: Option<String>,
}

impl RelayConfig {
    /// The subscriber spec the relay declares and consumes
    pub fn spec(&self) -> SubscriberSpec {
        SubscriberSpec::new(&self.exchange, &self.queue, &self.routing_key)
            .with_concurrency(self.concurrency)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            exchange: "events".to_string(),
            queue: "relay.messages".to_string(),
            routing_key: "relay.messages".to_string(),
            concurrency: 4,
            messages: 100,
            amqp_url: None,
        }
    }
}

impl FromEnv for RelayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            exchange: env_or_default("RELAY_EXCHANGE", &defaults.exchange),
            queue: env_or_default("RELAY_QUEUE", &defaults.queue),
            routing_key: env_or_default("RELAY_ROUTING_KEY", &defaults.routing_key),
            concurrency: env_parse_or("RELAY_CONCURRENCY", defaults.concurrency)?,
            messages: env_parse_or("RELAY_MESSAGES", defaults.messages)?,
            amqp_url: env_optional("AMQP_URL"),
        };

        if config.concurrency == 0 {
            return Err(ConfigError::parse("RELAY_CONCURRENCY", "must be at least 1"));
        }

        Ok(config)
    }
}
