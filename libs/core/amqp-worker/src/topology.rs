//! Subscriber specs and topology provisioning.
//!
//! A `SubscriberSpec` names one exchange → queue binding. `create_queue`
//! declares it idempotently; `pop` reads a single message straight off the
//! queue, which is handy for smoke tests and one-off tooling.

use crate::channel::{BrokerChannel, ExchangeKind};
use crate::delivery::Delivery;
use crate::error::TopologyError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One consumption topology: exchange, queue, binding and consumer count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberSpec {
    /// Number of consumer loops started for this queue
    pub concurrency: usize,

    /// Declare exchange and queue as durable
    pub durable: bool,

    /// Topic exchange name
    pub exchange: String,

    /// Queue name
    pub queue: String,

    /// Binding and publish routing key
    pub routing_key: String,
}

impl SubscriberSpec {
    /// Create a durable spec with a single consumer
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            concurrency: 1,
            durable: true,
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Set the consumer concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set durability
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Check the spec can describe a real topology
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err(format!("queue '{}' has zero concurrency", self.queue));
        }
        if self.exchange.is_empty() {
            return Err(format!("queue '{}' has no exchange", self.queue));
        }
        if self.queue.is_empty() {
            return Err("queue name is empty".to_string());
        }
        Ok(())
    }
}

/// Declare the exchange, queue and binding described by `spec`.
///
/// Safe to call repeatedly. Errors are returned as-is and never retried here.
pub async fn create_queue<Ch>(channel: &Ch, spec: &SubscriberSpec) -> Result<(), TopologyError>
where
    Ch: BrokerChannel + ?Sized,
{
    spec.validate().map_err(TopologyError::InvalidSpec)?;

    channel
        .declare_exchange(&spec.exchange, ExchangeKind::Topic, spec.durable)
        .await
        .map_err(|source| TopologyError::Declare {
            what: format!("exchange '{}'", spec.exchange),
            source,
        })?;

    channel
        .declare_queue(&spec.queue, spec.durable)
        .await
        .map_err(|source| TopologyError::Declare {
            what: format!("queue '{}'", spec.queue),
            source,
        })?;

    channel
        .bind_queue(&spec.queue, &spec.exchange, &spec.routing_key)
        .await
        .map_err(|source| TopologyError::Declare {
            what: format!(
                "binding '{}' -> '{}' ({})",
                spec.exchange, spec.queue, spec.routing_key
            ),
            source,
        })?;

    info!(
        exchange = %spec.exchange,
        queue = %spec.queue,
        routing_key = %spec.routing_key,
        durable = spec.durable,
        "Declared topology"
    );

    Ok(())
}

/// Read and acknowledge one message from the spec's queue.
///
/// Returns `None` when the queue is empty.
pub async fn pop<Ch>(channel: &Ch, spec: &SubscriberSpec) -> Result<Option<Delivery>, TopologyError>
where
    Ch: BrokerChannel + ?Sized,
{
    let Some(delivery) = channel.get(&spec.queue).await? else {
        debug!(queue = %spec.queue, "Queue empty");
        return Ok(None);
    };

    channel.ack(delivery.delivery_tag).await?;

    debug!(
        queue = %spec.queue,
        delivery_tag = delivery.delivery_tag,
        "Popped message"
    );

    Ok(Some(delivery))
}
