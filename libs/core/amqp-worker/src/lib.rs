//! AMQP Worker Framework
//!
//! Reliable publishing and concurrent consumption over an AMQP-style broker.
//!
//! ## Features
//!
//! - **Assured publisher**: `AssuredPublisher<C>` tracks publisher confirms,
//!   republishes nacked or stranded messages, and reports every outcome once
//! - **Waiting modes**: implicit (publish waits for its ack) or explicit
//!   (`wait_for_all_confirmations` later), both cancellable
//! - **Subscriber pool**: per-spec concurrent consumer loops with
//!   handler-driven ack/nack and panic containment
//! - **In-memory broker**: full channel implementation with fault injection
//! - **AMQP adapter** (`amqp` feature): the same channel contract over `lapin`
//! - **Prometheus metrics**: Built-in observability
//!
//! ## Example
//!
//! ```ignore
//! use amqp_worker::{
//!     create_queue, AcceptAll, AssuredPublisher, InMemoryBroker, PublisherConfig,
//!     SubscriberConfig, SubscriberPool, SubscriberRegistry, SubscriberSpec,
//! };
//!
//! let broker = InMemoryBroker::new();
//! let spec = SubscriberSpec::new("events", "orders.created", "orders.created");
//!
//! let publisher = AssuredPublisher::new(broker.connect(), PublisherConfig::new(), cancel_rx);
//! create_queue(publisher.channel().await?.as_ref(), &spec).await?;
//!
//! let mut registry = SubscriberRegistry::new();
//! registry.register(spec.clone(), AcceptAll);
//! let pool = SubscriberPool::new(broker.connect(), SubscriberConfig::new());
//! pool.start(&registry).await?;
//!
//! assert!(publisher.publish("hello", spec).await);
//! pool.close().await;
//! ```

#[cfg(feature = "amqp")]
mod amqp;
mod channel;
mod config;
mod delivery;
mod error;
mod handler;
pub mod memory;
pub mod metrics;
mod publisher;
mod subscriber;
mod topology;
mod tracker;

// Re-export main types
#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpConnection};
pub use channel::{
    BrokerChannel, BrokerConnection, Confirmation, ConfirmationStream, DeliveryStream,
    ExchangeKind,
};
pub use config::{backoff_delay, PublisherConfig, SubscriberConfig};
pub use delivery::Delivery;
pub use error::{
    BrokerError, ErrorCategory, PublishError, SubscriberError, TopologyError, TrackerError,
};
pub use handler::{handler_fn, AcceptAll, DeliveryHandler, HandlerFn, HandlerOutcome};
pub use memory::{BrokerStats, InMemoryBroker, InMemoryChannel, InMemoryConnection};
pub use metrics::{init_metrics, PublisherMetrics, SubscriberMetrics};
pub use publisher::{AssuredPublisher, ConfirmationHandler, Published};
pub use subscriber::{SubscriberPool, SubscriberRegistry};
pub use topology::{create_queue, pop, SubscriberSpec};
pub use tracker::{
    ConfirmOutcome, ConfirmationReport, ConfirmationTracker, OutboundMessage, PendingConfirmation,
    Untracked,
};
