//! Confirmation tracking for one channel instance.
//!
//! Every message accepted by a channel gets a `PendingConfirmation` keyed by
//! the channel's publish sequence. Broker confirmations remove entries, either
//! one at a time or cumulatively (`multiple`). Sequences restart at 1 on every
//! new channel, so a tracker never outlives the channel it was created for.

use crate::error::TrackerError;
use crate::channel::Confirmation;
use crate::topology::SubscriberSpec;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Final outcome of an assured publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmOutcome {
    /// The broker confirmed the message
    Acked,
    /// The broker nacked it and republishing is disabled
    Nacked,
    /// The channel died before a confirmation arrived and republishing is disabled
    ChannelLost,
    /// The channel was closed explicitly before a confirmation arrived
    Abandoned,
    /// Republishing gave up after the configured number of attempts
    RetriesExhausted,
    /// A republished message was accepted by the channel but could not be tracked
    Untracked,
}

impl ConfirmOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, ConfirmOutcome::Acked)
    }
}

impl fmt::Display for ConfirmOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmOutcome::Acked => write!(f, "acked"),
            ConfirmOutcome::Nacked => write!(f, "nacked"),
            ConfirmOutcome::ChannelLost => write!(f, "channel_lost"),
            ConfirmOutcome::Abandoned => write!(f, "abandoned"),
            ConfirmOutcome::RetriesExhausted => write!(f, "retries_exhausted"),
            ConfirmOutcome::Untracked => write!(f, "untracked"),
        }
    }
}

/// What a confirmation handler receives, once per message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationReport {
    /// Sequence of the message on the channel where it was resolved
    pub delivery_tag: u64,
    pub outcome: ConfirmOutcome,
    pub exchange: String,
    pub routing_key: String,
    /// Publish attempts made, the first publish included
    pub attempts: u32,
}

impl ConfirmationReport {
    pub fn is_ack(&self) -> bool {
        self.outcome.is_ack()
    }
}

/// A message the publisher is responsible for, independent of any channel
#[derive(Debug)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub spec: Arc<SubscriberSpec>,
    /// Publish attempts so far
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Blocked implicit-mode caller, if any
    waiter: Option<oneshot::Sender<ConfirmOutcome>>,
}

impl OutboundMessage {
    /// Create a message that has not been published yet
    pub fn new(payload: Bytes, spec: Arc<SubscriberSpec>) -> Self {
        Self {
            payload,
            spec,
            attempts: 0,
            enqueued_at: Utc::now(),
            waiter: None,
        }
    }

    /// Attach a waiter that receives the final outcome
    pub fn with_waiter(mut self, waiter: oneshot::Sender<ConfirmOutcome>) -> Self {
        self.waiter = Some(waiter);
        self
    }

    /// Age since the first publish attempt
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }

    /// Resolve the message for good: wake the waiter and build the report
    pub fn settle(mut self, delivery_tag: u64, outcome: ConfirmOutcome) -> ConfirmationReport {
        if let Some(waiter) = self.waiter.take() {
            // The caller may have stopped waiting (cancellation), that's fine
            let _ = waiter.send(outcome);
        }

        ConfirmationReport {
            delivery_tag,
            outcome,
            exchange: self.spec.exchange.clone(),
            routing_key: self.spec.routing_key.clone(),
            attempts: self.attempts,
        }
    }
}

/// A message accepted by a channel and waiting for its confirmation
#[derive(Debug)]
pub struct PendingConfirmation {
    pub sequence: u64,
    pub message: OutboundMessage,
}

impl PendingConfirmation {
    /// Resolve with the sequence this entry was confirmed under
    pub fn settle(self, outcome: ConfirmOutcome) -> ConfirmationReport {
        self.message.settle(self.sequence, outcome)
    }
}

/// A message `record` refused, handed back so the caller can settle it
#[derive(Debug)]
pub struct Untracked {
    pub sequence: u64,
    pub error: TrackerError,
    pub message: OutboundMessage,
}

impl Untracked {
    /// Resolve the refused message under the sequence it was published with
    pub fn settle(self, outcome: ConfirmOutcome) -> ConfirmationReport {
        self.message.settle(self.sequence, outcome)
    }
}

/// Pending-confirmation set for one channel instance
#[derive(Debug, Default)]
pub struct ConfirmationTracker {
    pending: BTreeMap<u64, PendingConfirmation>,
    last_sequence: u64,
    abandon_on_close: bool,
}

impl ConfirmationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message accepted by the channel under `sequence`
    ///
    /// On failure the message comes back inside the error.
    pub fn record(&mut self, sequence: u64, message: OutboundMessage) -> Result<(), Untracked> {
        let error = if self.pending.contains_key(&sequence) {
            Some(TrackerError::DuplicateSequence(sequence))
        } else if sequence <= self.last_sequence {
            Some(TrackerError::OutOfOrder {
                sequence,
                last: self.last_sequence,
            })
        } else {
            None
        };

        if let Some(error) = error {
            return Err(Untracked {
                sequence,
                error,
                message,
            });
        }

        self.last_sequence = sequence;
        self.pending
            .insert(sequence, PendingConfirmation { sequence, message });
        Ok(())
    }

    /// Remove the entries covered by a confirmation
    ///
    /// A cumulative confirmation covers every pending sequence up to and
    /// including its tag. Unknown tags resolve nothing.
    pub fn resolve(&mut self, confirmation: &Confirmation) -> Vec<PendingConfirmation> {
        let tag = confirmation.delivery_tag;

        if confirmation.multiple {
            let covered = match tag.checked_add(1) {
                Some(bound) => {
                    let rest = self.pending.split_off(&bound);
                    std::mem::replace(&mut self.pending, rest)
                }
                None => std::mem::take(&mut self.pending),
            };
            return covered.into_values().collect();
        }

        match self.pending.remove(&tag) {
            Some(entry) => vec![entry],
            None => {
                debug!(delivery_tag = tag, "Confirmation for unknown sequence");
                vec![]
            }
        }
    }

    /// Remove every pending entry, in sequence order
    pub fn drain(&mut self) -> Vec<PendingConfirmation> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Leftovers of this channel are abandoned instead of replayed
    pub fn set_abandon_on_close(&mut self) {
        self.abandon_on_close = true;
    }

    pub fn abandons_on_close(&self) -> bool {
        self.abandon_on_close
    }
}
