//! Dead-letter router.
//!
//! Isolates a poison message without blocking the partition behind it:
//!
//! 1. skip if the source position already has a dead-letter marker
//! 2. publish the original bytes, unmodified, to the dead-letter topic
//! 3. record the marker
//! 4. acknowledge the source position
//!
//! Publishing is retried under the broker policy; when it still fails the
//! router returns a fatal error and the consumer halts. Dropping the message
//! silently is never an option. A ledger outage does not block isolation:
//! without a readable marker the router publishes anyway, at the cost of a
//! possible second copy on the dead-letter topic.

use crate::error::ConsumerError;
use crate::metrics::DeadLetterMetrics;
use crate::retry::{RetryPolicy, retry_broker};
use fulfillment_core::dead_letter::{DeadLetterReason, DeadLetterRecord};
use fulfillment_core::environment::Clock;
use fulfillment_core::event_bus::{Acknowledger, Delivery, EventBus};
use fulfillment_core::ledger::IdempotencyLedger;
use std::sync::Arc;
use std::time::Duration;

/// What [`DeadLetterRouter::route`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Routed {
    /// Published to the dead-letter topic
    Published,
    /// A previous delivery of the same position was already isolated
    AlreadyIsolated,
}

/// Routes poison messages to the dead-letter topic.
#[derive(Clone)]
pub struct DeadLetterRouter {
    bus: Arc<dyn EventBus>,
    ledger: Arc<dyn IdempotencyLedger>,
    clock: Arc<dyn Clock>,
    topic: String,
    retry: RetryPolicy,
    dependency_timeout: Duration,
}

impl DeadLetterRouter {
    /// Create a router publishing to `topic`.
    #[must_use]
    pub fn new(
        bus: Arc<dyn EventBus>,
        ledger: Arc<dyn IdempotencyLedger>,
        clock: Arc<dyn Clock>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            ledger,
            clock,
            topic: topic.into(),
            retry: RetryPolicy::default(),
            dependency_timeout: Duration::from_secs(2),
        }
    }

    /// Set the broker retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the bound on ledger calls.
    #[must_use]
    pub const fn with_dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = timeout;
        self
    }

    /// Dead-letter topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Isolate `delivery` and acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::DeadLetterUnavailable`] if the dead-letter
    /// topic stays unreachable after retries, or [`ConsumerError::Broker`] if
    /// the acknowledgement does.
    pub async fn route(
        &self,
        delivery: &Delivery,
        reason: DeadLetterReason,
        detail: &str,
        acker: &dyn Acknowledger,
    ) -> Result<Routed, ConsumerError> {
        let source = delivery.position.clone();

        let already = match tokio::time::timeout(
            self.dependency_timeout,
            self.ledger.is_dead_lettered(source.clone()),
        )
        .await
        {
            Ok(Ok(already)) => already,
            Ok(Err(e)) => {
                tracing::warn!(position = %source, error = %e, "Dead-letter marker lookup failed");
                false
            },
            Err(_) => {
                tracing::warn!(position = %source, "Timed out looking up dead-letter marker");
                false
            },
        };

        let routed = if already {
            tracing::info!(position = %source, "Already dead-lettered, acknowledging");
            Routed::AlreadyIsolated
        } else {
            let record = DeadLetterRecord::for_delivery(delivery, reason, detail, self.clock.now());
            retry_broker(&self.retry, "dead-letter publish", || {
                self.bus.publish(record.to_outbound(&self.topic))
            })
            .await
            .map_err(|e| match e {
                ConsumerError::Broker { source: err, .. } => ConsumerError::DeadLetterUnavailable {
                    position: source.clone(),
                    source: err,
                },
                other => other,
            })?;

            // The message is isolated even if the marker is lost; a redelivery
            // would only add a second copy to the dead-letter topic.
            match tokio::time::timeout(
                self.dependency_timeout,
                self.ledger.record_dead_letter(source.clone(), reason),
            )
            .await
            {
                Ok(Ok(_)) => {},
                Ok(Err(e)) => {
                    tracing::warn!(
                        position = %source,
                        error = %e,
                        "Failed to record dead-letter marker"
                    );
                },
                Err(_) => {
                    tracing::warn!(position = %source, "Timed out recording dead-letter marker");
                },
            }

            tracing::warn!(
                topic = %source.topic,
                partition = source.partition,
                offset = source.offset,
                attempt = delivery.attempt,
                reason = %reason,
                detail,
                dlq = %self.topic,
                "Message dead-lettered"
            );
            DeadLetterMetrics::record(reason.as_str());
            Routed::Published
        };

        retry_broker(&self.retry, "acknowledge", || acker.ack(source.clone())).await?;
        Ok(routed)
    }
}
