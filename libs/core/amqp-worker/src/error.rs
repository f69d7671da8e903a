//! Error types and error categorization
//!
//! Broker errors are categorized to decide whether reopening a channel is worthwhile:
//! - **Transient**: channel or connection hiccup, reopen with exponential backoff
//! - **Permanent**: the broker will keep refusing (missing queue, bad arguments)

use crate::tracker::ConfirmOutcome;
use std::fmt;
use thiserror::Error;

/// Category of error for determining reconnect behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - reopen the channel and try again
    Transient,
    /// Unrecoverable error - surface to the caller
    Permanent,
}

impl ErrorCategory {
    /// Check whether an operation failing with this category should be retried
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors raised by a broker channel adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The channel was closed (explicitly or by a channel-level error)
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The underlying connection is gone
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A referenced exchange or queue does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Redeclaration with different arguments
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Unknown delivery tag or similar protocol misuse
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Create a channel closed error
    pub fn channel_closed(reason: impl Into<String>) -> Self {
        BrokerError::ChannelClosed(reason.into())
    }

    /// Create a not found error for an exchange
    pub fn exchange_not_found(name: impl Into<String>) -> Self {
        BrokerError::NotFound {
            kind: "exchange",
            name: name.into(),
        }
    }

    /// Create a not found error for a queue
    pub fn queue_not_found(name: impl Into<String>) -> Self {
        BrokerError::NotFound {
            kind: "queue",
            name: name.into(),
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            BrokerError::ChannelClosed(_) => ErrorCategory::Transient,
            BrokerError::ConnectionClosed(_) => ErrorCategory::Transient,
            BrokerError::NotFound { .. } => ErrorCategory::Permanent,
            BrokerError::PreconditionFailed(_) => ErrorCategory::Permanent,
            BrokerError::Protocol(_) => ErrorCategory::Permanent,
        }
    }

    /// Check if the error means the channel is no longer usable
    pub fn is_channel_closed(&self) -> bool {
        matches!(
            self,
            BrokerError::ChannelClosed(_) | BrokerError::ConnectionClosed(_)
        )
    }
}

/// Exchange, queue or binding declaration failed
#[derive(Error, Debug)]
pub enum TopologyError {
    /// The subscriber spec cannot describe a valid topology
    #[error("Invalid subscriber spec: {0}")]
    InvalidSpec(String),

    /// The broker refused a declaration
    #[error("Failed to declare {what}: {source}")]
    Declare {
        what: String,
        #[source]
        source: BrokerError,
    },

    /// Direct read failed
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Errors returned by `AssuredPublisher::try_publish`
#[derive(Error, Debug)]
pub enum PublishError {
    /// The broker refused the publish synchronously; no confirmation is tracked
    #[error("Publish rejected: {0}")]
    Rejected(#[source] BrokerError),

    /// The message was accepted but never confirmed
    #[error("Publish not confirmed: {0}")]
    NotConfirmed(ConfirmOutcome),

    /// The cancellation signal fired while waiting for the confirmation
    #[error("Cancelled while waiting for confirmation")]
    Cancelled,

    /// The channel handed out a sequence the tracker cannot accept
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),
}

/// Confirmation tracker invariant violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The sequence is already pending on this channel instance
    #[error("Sequence {0} is already pending")]
    DuplicateSequence(u64),

    /// The sequence does not continue the channel's numbering
    #[error("Sequence {sequence} is not above the last recorded sequence {last}")]
    OutOfOrder { sequence: u64, last: u64 },
}

/// Subscriber pool errors
#[derive(Error, Debug)]
pub enum SubscriberError {
    /// `start` was called while loops are running
    #[error("Subscribers are already running")]
    AlreadyRunning,

    /// A registered spec is unusable
    #[error("Invalid subscriber spec: {0}")]
    InvalidSpec(String),

    /// Opening or configuring a consumer channel failed
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}
