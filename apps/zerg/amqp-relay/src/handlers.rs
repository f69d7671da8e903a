//! Relay message type and its consumer-side handler

use amqp_worker::{Delivery, DeliveryHandler, HandlerOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Payload published by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: Uuid,
    pub sequence: usize,
    pub sent_at: DateTime<Utc>,
}

impl RelayMessage {
    pub fn new(sequence: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            sent_at: Utc::now(),
        }
    }
}

/// Records every distinct relay message it sees.
///
/// Redeliveries are accepted again but only counted once.
pub struct RelayHandler {
    seen: Mutex<HashSet<Uuid>>,
    received_tx: watch::Sender<usize>,
}

impl RelayHandler {
    pub fn new() -> Self {
        let (received_tx, _) = watch::channel(0);
        Self {
            seen: Mutex::new(HashSet::new()),
            received_tx,
        }
    }

    /// Watch the number of distinct messages received
    pub fn received(&self) -> watch::Receiver<usize> {
        self.received_tx.subscribe()
    }
}

impl Default for RelayHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryHandler for RelayHandler {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        let message = match delivery.json::<RelayMessage>() {
            Ok(message) => message,
            Err(err) => {
                // Requeueing a malformed body would loop forever; drop it
                warn!(delivery_tag = delivery.delivery_tag, error = %err, "Malformed relay message");
                return HandlerOutcome::Accept;
            }
        };

        let distinct = {
            let mut seen = self.seen.lock();
            seen.insert(message.id).then_some(seen.len())
        };

        if let Some(count) = distinct {
            self.received_tx.send_replace(count);
        }

        debug!(
            id = %message.id,
            sequence = message.sequence,
            redelivered = delivery.redelivered,
            "Relayed message"
        );
        HandlerOutcome::Accept
    }

    fn name(&self) -> &'static str {
        "relay_handler"
    }
}
