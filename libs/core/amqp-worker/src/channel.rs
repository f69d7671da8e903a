//! Broker channel contract.
//!
//! The publisher and the subscriber pool only talk to the broker through these
//! traits. A `BrokerConnection` hands out independent `BrokerChannel`s; every
//! channel numbers its publishes from 1 once confirm mode is enabled and
//! numbers its deliveries from 1 as well.
//!
//! ```text
//! ┌────────────────────┐  open_channel()  ┌──────────────────────────────┐
//! │  BrokerConnection  │─────────────────▶│        BrokerChannel         │
//! └────────────────────┘                  │ publish ──▶ sequence         │
//!                                         │ confirm_select ──▶ acks/nacks │
//!                                         │ consume ──▶ deliveries       │
//!                                         │ ack / nack(requeue)          │
//!                                         └──────────────────────────────┘
//! ```

use crate::delivery::Delivery;
use crate::error::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};

/// Stream of publisher confirmations; ends when the channel closes.
pub type ConfirmationStream = BoxStream<'static, Confirmation>;

/// Stream of consumer deliveries; ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// A publisher confirmation emitted by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    /// Publish sequence on the emitting channel.
    pub delivery_tag: u64,
    /// `true` for basic.ack, `false` for basic.nack.
    pub ack: bool,
    /// The confirmation covers every outstanding sequence up to `delivery_tag`.
    pub multiple: bool,
}

impl Confirmation {
    pub fn ack(delivery_tag: u64) -> Self {
        Self {
            delivery_tag,
            ack: true,
            multiple: false,
        }
    }

    pub fn nack(delivery_tag: u64) -> Self {
        Self {
            delivery_tag,
            ack: false,
            multiple: false,
        }
    }

    /// Mark the confirmation as cumulative.
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }
}

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
}

/// A single broker channel.
///
/// Implementations must be safe to share between tasks; the publisher holds
/// channels behind an `Arc` and hands clones to topology collaborators.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Enable publisher confirms and return the confirmation stream.
    ///
    /// Must be called at most once per channel, before the first publish.
    async fn confirm_select(&self) -> Result<ConfirmationStream, BrokerError>;

    /// Publish a message and return its sequence number on this channel.
    ///
    /// `Err` means the broker refused the publish synchronously. An `Ok` only
    /// means the channel accepted it; the outcome arrives as a confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<u64, BrokerError>;

    /// Limit unacknowledged deliveries on this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Acknowledge a delivery received on this channel.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negatively acknowledge a delivery received on this channel.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Fetch a single message without consuming (basic.get).
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Delete a queue, returning the number of messages it held.
    async fn delete_queue(&self, name: &str) -> Result<u32, BrokerError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Close the channel. Unacknowledged deliveries are requeued by the broker.
    async fn close(&self) -> Result<(), BrokerError>;

    /// `false` once the channel was closed by either side.
    fn is_open(&self) -> bool;

    /// Identifier used in logs.
    fn id(&self) -> u64;
}

/// Connection that can open channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel, BrokerError>;
}

#[async_trait]
impl<C: BrokerConnection> BrokerConnection for Arc<C> {
    type Channel = C::Channel;

    async fn open_channel(&self) -> Result<Self::Channel, BrokerError> {
        (**self).open_channel().await
    }
}
