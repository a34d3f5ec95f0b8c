//! Redpanda / Kafka binding for order fulfillment.
//!
//! This crate implements the [`EventBus`] and [`OffsetAdmin`] traits from
//! `fulfillment-core` on top of rdkafka, so the consumers run unchanged
//! against Redpanda, Apache Kafka, or any Kafka-compatible broker.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - `enable.auto.commit` is off; a position is committed only when the
//!   consumer acknowledges it
//! - A negative acknowledgement seeks the partition back, so the record and
//!   everything after it are fetched again
//! - Records are keyed by `order_id`, so one order always lands on the same
//!   partition and is processed in log order
//!
//! Delivery attempts are counted per process. A restart starts counting
//! again from one; the ledger still suppresses duplicates.
//!
//! # Example
//!
//! ```no_run
//! use fulfillment_core::event_bus::{EventBus, OutboundRecord};
//! use fulfillment_redpanda::RedpandaEventBus;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::new("localhost:9092")?;
//!
//! bus.publish(OutboundRecord::new("order.placed", b"{}".to_vec()).with_key("o1"))
//!     .await?;
//!
//! let mut subscription = bus
//!     .subscribe("inventory-service", &["order.placed".to_string()])
//!     .await?;
//! let acker = subscription.acknowledger();
//! if let Some(delivery) = subscription.poll(Duration::from_secs(1)).await? {
//!     acker.ack(delivery.position).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod admin;
mod subscription;

pub use subscription::{RedpandaAcknowledger, RedpandaSubscription};

use fulfillment_core::event_bus::{
    EventBus, EventBusError, OffsetAdmin, OutboundRecord, PublishReceipt, Subscription,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Kafka-compatible event bus.
///
/// # Example
///
/// ```no_run
/// use fulfillment_redpanda::RedpandaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(5))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    /// Kafka producer for publishing records
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer and admin call timeout
    timeout: Duration,
    /// Where a group without committed offsets starts
    auto_offset_reset: String,
    /// Consumer session timeout
    session_timeout: Duration,
}

impl RedpandaEventBus {
    /// Create an event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Producer and admin call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false");
        config
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated broker addresses (e.g. `localhost:9092`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send and admin call timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Where a group with no committed offset starts: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so a new group sees the whole backlog.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Consumer session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string());
        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created successfully"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            auto_offset_reset,
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
        })
    }
}

fn owned_headers(record: &OutboundRecord) -> OwnedHeaders {
    record
        .headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(record.headers.len()), |headers, (key, value)| {
            headers.insert(Header {
                key,
                value: Some(value.as_str()),
            })
        })
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        record: OutboundRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let mut kafka_record = FutureRecord::<str, [u8]>::to(&record.topic)
                .payload(record.payload.as_slice())
                .headers(owned_headers(&record));
            if let Some(key) = record.key.as_deref() {
                kafka_record = kafka_record.key(key);
            }

            match self.producer.send(kafka_record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %record.topic,
                        partition,
                        offset,
                        key = record.key.as_deref().unwrap_or(""),
                        "Record published"
                    );
                    Ok(PublishReceipt {
                        topic: record.topic.clone(),
                        partition,
                        offset,
                    })
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %record.topic,
                        error = %kafka_error,
                        "Failed to publish record"
                    );
                    Err(EventBusError::PublishFailed {
                        topic: record.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        group: &str,
        topics: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Subscription>, EventBusError>> + Send + '_>> {
        let group = group.to_string();
        let topics = topics.to_vec();
        Box::pin(async move {
            let consumer: StreamConsumer = self.consumer_config(&group).create().map_err(|e| {
                EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                }
            })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group,
                manual_commit = true,
                "Subscribed to topics"
            );
            Ok(Box::new(RedpandaSubscription::new(Arc::new(consumer), self.timeout))
                as Box<dyn Subscription>)
        })
    }
}
