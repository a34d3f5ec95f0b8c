//! Error taxonomy of the consumers.
//!
//! | error | handling |
//! |---|---|
//! | `ValidationError` (core) | permanent, dead-lettered |
//! | [`TransientDependencyError`] | redelivered; dead-lettered past the budget if undecided |
//! | `LedgerError::Conflict` (core) | expected, duplicate suppressed |
//! | [`ConsumerError`] | fatal, the consumer halts and the process exits non-zero |

use fulfillment_core::event_bus::{DeliveryPosition, EventBusError};
use fulfillment_core::ledger::LedgerError;
use fulfillment_core::projection::ProjectionError;
use std::time::Duration;
use thiserror::Error;

/// Fatal consumer failure.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// A broker operation kept failing after bounded retries
    #[error("Broker communication failed during {operation}: {source}")]
    Broker {
        /// What was being attempted
        operation: &'static str,
        /// Last broker error
        #[source]
        source: EventBusError,
    },

    /// A poison message could not be delivered to the dead-letter topic
    #[error("Dead-letter delivery failed for {position}: {source}")]
    DeadLetterUnavailable {
        /// Source position of the poison message
        position: DeliveryPosition,
        /// Last broker error
        #[source]
        source: EventBusError,
    },

    /// Storage failed outside of per-message processing
    #[error("Ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    /// Snapshot storage failed
    #[error("Projection failure: {0}")]
    Projection(#[from] ProjectionError),

    /// An outcome event could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Lag did not reach zero in time
    #[error("Consumer group '{group}' still lags by {lag} after {waited:?}")]
    DrainTimeout {
        /// Group being watched
        group: String,
        /// Remaining lag
        lag: u64,
        /// How long we waited
        waited: Duration,
    },

    /// A shard worker ended without reporting a result
    #[error("Shard worker {shard} stopped unexpectedly: {reason}")]
    WorkerStopped {
        /// Shard index
        shard: usize,
        /// Join error description
        reason: String,
    },
}

/// A dependency (ledger, stock store) failed in a way redelivery may fix.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{dependency} unavailable: {detail}")]
pub struct TransientDependencyError {
    /// Which dependency failed
    pub dependency: &'static str,
    /// What went wrong
    pub detail: String,
}

impl TransientDependencyError {
    /// Create an error for `dependency`.
    #[must_use]
    pub fn new(dependency: &'static str, detail: impl Into<String>) -> Self {
        Self {
            dependency,
            detail: detail.into(),
        }
    }

    /// A dependency call that exceeded its time bound.
    #[must_use]
    pub fn timed_out(dependency: &'static str, timeout: Duration) -> Self {
        Self::new(dependency, format!("no response within {timeout:?}"))
    }
}

/// Outcome of a failed processing step.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Leave the message for redelivery
    #[error(transparent)]
    Transient(#[from] TransientDependencyError),

    /// Halt the consumer
    #[error(transparent)]
    Fatal(#[from] ConsumerError),
}
