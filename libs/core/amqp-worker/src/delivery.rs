//! Delivery wrapper
//!
//! A message handed to a consumer, together with the broker metadata needed to
//! settle it.

use bytes::Bytes;
use serde::de::DeserializeOwned;

/// A message delivered to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Delivery tag, scoped to the channel the message arrived on
    pub delivery_tag: u64,

    /// Exchange the message was published to
    pub exchange: String,

    /// Routing key used at publish time
    pub routing_key: String,

    /// Message body
    pub payload: Bytes,

    /// The broker delivered this message before without it being acked
    pub redelivered: bool,
}

impl Delivery {
    /// Create a new delivery
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            redelivered: false,
        }
    }

    /// Mark the delivery as a redelivery
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Body as UTF-8, lossy
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
