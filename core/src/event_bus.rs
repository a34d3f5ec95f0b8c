//! Broker abstraction: publishing, consumer-group subscriptions and offset control.
//!
//! The fulfillment consumers never talk to a broker client directly. They see
//! three seams:
//!
//! - [`EventBus`] publishes records and opens consumer-group [`Subscription`]s
//! - [`Acknowledger`] commits or rewinds a delivery's position
//! - [`OffsetAdmin`] resets a group's offsets and reports its lag
//!
//! # Delivery Semantics
//!
//! ```text
//!   publish ──► topic/partition log ──► poll (group G) ──► ack  ──► committed = offset + 1
//!                                                     └──► nack ──► redelivered, attempt + 1
//! ```
//!
//! - **At-least-once**: a delivery that is never acknowledged comes back
//! - **Ordered within partition**: records keyed by the same `order_id` land on
//!   the same partition and are delivered in publication order
//! - **Independent groups**: each consumer group advances its own offsets
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `fulfillment-testing` for tests
//! - `RedpandaEventBus` in `fulfillment-redpanda` for Kafka-compatible brokers
//!
//! # Dyn Compatibility
//!
//! All traits return `Pin<Box<dyn Future>>` instead of using `async fn` so that
//! consumers can hold `Arc<dyn EventBus>` and move acknowledgers into shard
//! workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a record to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to commit or rewind a position
    #[error("Commit failed at {position}: {reason}")]
    CommitFailed {
        /// Position being committed
        position: DeliveryPosition,
        /// The reason for failure
        reason: String,
    },

    /// Topic not found or invalid
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Offsets cannot be changed while the group has an active member
    #[error("Consumer group '{0}' is active; stop its consumers before resetting offsets")]
    GroupActive(String),

    /// A broker operation did not finish in time
    #[error("Broker operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// What was being attempted
        operation: String,
        /// The bound that was exceeded
        timeout: Duration,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// A record to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Destination topic
    pub topic: String,
    /// Partitioning key; records with the same key keep their relative order
    pub key: Option<String>,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// String headers
    pub headers: BTreeMap<String, String>,
}

impl OutboundRecord {
    /// Create an unkeyed record without headers.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: BTreeMap::new(),
        }
    }

    /// Set the partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Where a published record landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Topic written to
    pub topic: String,
    /// Partition written to
    pub partition: i32,
    /// Offset assigned by the broker
    pub offset: i64,
}

/// Coordinates of a record in the log.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryPosition {
    /// Topic
    pub topic: String,
    /// Partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl DeliveryPosition {
    /// Create a position.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for DeliveryPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// A record handed to a consumer group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Where the record lives
    pub position: DeliveryPosition,
    /// Partitioning key, if any
    pub key: Option<String>,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Headers
    pub headers: BTreeMap<String, String>,
    /// How many times this position has been delivered to the group (1-based)
    pub attempt: u32,
}

/// A live consumer-group membership.
///
/// Dropping the subscription leaves the group and releases its partitions.
/// Uncommitted deliveries are redelivered to the next member.
pub trait Subscription: Send {
    /// Wait up to `timeout` for the next delivery.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if the broker connection fails.
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>, EventBusError>> + Send + '_>>;

    /// Handle for committing or rewinding positions from other tasks.
    fn acknowledger(&self) -> Arc<dyn Acknowledger>;
}

/// Commits and rewinds positions of a subscription.
pub trait Acknowledger: Send + Sync {
    /// Commit `position`: the group's committed offset for that partition
    /// becomes `position.offset + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::CommitFailed`] if the commit is rejected.
    fn ack(
        &self,
        position: DeliveryPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Leave `position` unacknowledged and rewind its partition so the broker
    /// redelivers it.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::CommitFailed`] if the rewind is rejected.
    fn nack(
        &self,
        position: DeliveryPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;
}

/// Trait for broker implementations.
///
/// # Examples
///
/// ```rust,ignore
/// let receipt = bus
///     .publish(OutboundRecord::new("inventory.reserved", bytes).with_key("o1"))
///     .await?;
///
/// let mut subscription = bus
///     .subscribe("inventory-service", &["order.placed".to_string()])
///     .await?;
/// let acker = subscription.acknowledger();
/// while let Some(delivery) = subscription.poll(Duration::from_secs(1)).await? {
///     handle(&delivery).await?;
///     acker.ack(delivery.position).await?;
/// }
/// ```
pub trait EventBus: Send + Sync {
    /// Publish a record.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        record: OutboundRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt, EventBusError>> + Send + '_>>;

    /// Join `group` and subscribe to `topics`.
    ///
    /// Delivery resumes from the group's committed offsets, or from the start
    /// of each partition if the group has never committed.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        group: &str,
        topics: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Subscription>, EventBusError>> + Send + '_>>;
}

/// Where an offset reset moves a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetResetTarget {
    /// Start of each partition; the group reprocesses history
    Earliest,
    /// End of each partition; the group skips the backlog
    Latest,
}

/// Offset-reset control message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetResetRequest {
    /// Group whose offsets move
    pub consumer_group: String,
    /// Topics whose partitions are reset
    pub topics: Vec<String>,
    /// Destination
    pub target: OffsetResetTarget,
}

/// Lag of one group on one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLag {
    /// Consumer group
    pub consumer_group: String,
    /// Topic
    pub topic: String,
    /// Partition
    pub partition: i32,
    /// Committed offset, `None` if the group never committed on this partition
    pub committed: Option<i64>,
    /// Next offset the broker will assign (high watermark)
    pub latest: i64,
    /// Records published but not yet committed by the group
    pub lag: u64,
}

impl PartitionLag {
    /// Compute lag from watermarks. A group that never committed is measured
    /// from the low watermark.
    #[must_use]
    pub fn from_watermarks(
        consumer_group: impl Into<String>,
        topic: impl Into<String>,
        partition: i32,
        committed: Option<i64>,
        earliest: i64,
        latest: i64,
    ) -> Self {
        let from = committed.unwrap_or(earliest).max(earliest);
        let lag = u64::try_from(latest.saturating_sub(from)).unwrap_or(0);
        Self {
            consumer_group: consumer_group.into(),
            topic: topic.into(),
            partition,
            committed,
            latest,
            lag,
        }
    }
}

/// Consumer-group offset administration.
pub trait OffsetAdmin: Send + Sync {
    /// Move the group's committed offsets on every partition of the selected
    /// topics. Refused while the group has an active member.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::GroupActive`] if the group is consuming, or a
    /// transport error.
    fn reset_offsets(
        &self,
        request: OffsetResetRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Per-partition lag of `group` on `topics`. Read-only.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if watermarks or committed offsets cannot be
    /// fetched.
    fn consumer_lag(
        &self,
        group: &str,
        topics: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PartitionLag>, EventBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lag_counts_from_committed_offset() {
        let lag = PartitionLag::from_watermarks("g", "t", 0, Some(7), 0, 10);
        assert_eq!(lag.lag, 3);

        let lag = PartitionLag::from_watermarks("g", "t", 0, None, 2, 10);
        assert_eq!(lag.lag, 8);
    }

    #[test]
    fn lag_never_negative() {
        let lag = PartitionLag::from_watermarks("g", "t", 1, Some(12), 0, 10);
        assert_eq!(lag.lag, 0);
    }

    #[test]
    fn position_display() {
        assert_eq!(
            DeliveryPosition::new("order.placed", 3, 42).to_string(),
            "order.placed/3@42"
        );
    }
}
