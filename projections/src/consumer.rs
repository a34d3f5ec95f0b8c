//! Analytics consumer with replay.
//!
//! An independent consumer group over the order and outcome topics. It folds
//! every record into [`AnalyticsAggregates`] and checkpoints through a
//! [`SnapshotStore`]:
//!
//! 1. fold records, advancing the snapshot positions
//! 2. every `flush_every` records, when the stream goes idle, and on
//!    shutdown, save the snapshot
//! 3. only then commit the folded positions to the broker
//!
//! On restart the snapshot is loaded and records it already covers are
//! skipped, so a crash between steps 2 and 3 never double counts.
//!
//! Replay resets the group to the earliest offsets and discards the snapshot;
//! the next run rebuilds identical aggregates from history.

use crate::analytics::AnalyticsAggregates;
use fulfillment_core::environment::{Clock, SystemClock};
use fulfillment_core::event_bus::{
    Acknowledger, Delivery, DeliveryPosition, EventBus, OffsetAdmin, OffsetResetRequest,
    OffsetResetTarget,
};
use fulfillment_core::projection::{ProjectionError, ProjectionSnapshot, SnapshotStore};
use fulfillment_runtime::metrics::AnalyticsMetrics;
use fulfillment_runtime::{ConsumerError, RetryPolicy, retry_broker};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Analytics consumer configuration.
#[derive(Clone, Debug)]
pub struct AnalyticsConfig {
    /// Topics folded into the aggregates
    pub topics: Vec<String>,
    /// Consumer group
    pub consumer_group: String,
    /// Snapshot name
    pub projection: String,
    /// Records folded between snapshots
    pub flush_every: u64,
    /// How long one poll waits for a record
    pub poll_timeout: Duration,
    /// Retry policy for broker calls
    pub broker_retry: RetryPolicy,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            topics: vec![
                "order.placed".to_string(),
                "inventory.reserved".to_string(),
                "inventory.failed".to_string(),
            ],
            consumer_group: "analytics-service".to_string(),
            projection: "analytics".to_string(),
            flush_every: 2000,
            poll_timeout: Duration::from_secs(1),
            broker_retry: RetryPolicy::default(),
        }
    }
}

/// Folds the event stream into analytics aggregates.
pub struct AnalyticsConsumer {
    bus: Arc<dyn EventBus>,
    snapshots: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    config: AnalyticsConfig,
}

impl AnalyticsConsumer {
    /// Create a consumer.
    #[must_use]
    pub fn new(
        bus: Arc<dyn EventBus>,
        snapshots: Arc<dyn SnapshotStore>,
        config: AnalyticsConfig,
    ) -> Self {
        Self {
            bus,
            snapshots,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replace the clock stamped on snapshots.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Latest persisted aggregates, empty if none were saved.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Projection`] if the snapshot cannot be read
    /// or decoded.
    pub async fn aggregates(&self) -> Result<AnalyticsAggregates, ConsumerError> {
        Ok(self.load().await?.1)
    }

    /// Rewind the group to the earliest offsets and discard the snapshot.
    ///
    /// The broker refuses while the group has an active member; the snapshot
    /// is only cleared after the reset succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Broker`] if the reset is refused or fails, or
    /// [`ConsumerError::Projection`] if the snapshot cannot be removed.
    pub async fn reset(&self, admin: &dyn OffsetAdmin) -> Result<(), ConsumerError> {
        let request = OffsetResetRequest {
            consumer_group: self.config.consumer_group.clone(),
            topics: self.config.topics.clone(),
            target: OffsetResetTarget::Earliest,
        };
        admin
            .reset_offsets(request)
            .await
            .map_err(|source| ConsumerError::Broker {
                operation: "offset reset",
                source,
            })?;
        self.snapshots.clear(&self.config.projection).await?;
        tracing::info!(
            consumer_group = %self.config.consumer_group,
            projection = %self.config.projection,
            "Analytics offsets reset to earliest, snapshot discarded"
        );
        Ok(())
    }

    /// Reset, then consume history until shutdown.
    ///
    /// # Errors
    ///
    /// See [`Self::reset`] and [`Self::run`].
    pub async fn replay(
        &self,
        admin: &dyn OffsetAdmin,
        shutdown: watch::Receiver<bool>,
    ) -> Result<AnalyticsAggregates, ConsumerError> {
        self.reset(admin).await?;
        self.run(shutdown).await
    }

    /// Consume until `shutdown` turns true. Returns the final aggregates.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError`] if the broker stays unreachable or a snapshot
    /// cannot be saved.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<AnalyticsAggregates, ConsumerError> {
        let (mut snapshot, mut aggregates) = self.load().await?;
        tracing::info!(
            consumer_group = %self.config.consumer_group,
            topics = ?self.config.topics,
            resumed_events = aggregates.events_folded(),
            "Starting analytics consumer"
        );

        let mut subscription = retry_broker(&self.config.broker_retry, "subscribe", || {
            self.bus.subscribe(&self.config.consumer_group, &self.config.topics)
        })
        .await?;
        let acker = subscription.acknowledger();

        let mut checkpoint = Checkpoint::default();
        let mut poll_failures = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                polled = subscription.poll(self.config.poll_timeout) => match polled {
                    Ok(Some(delivery)) => {
                        poll_failures = 0;
                        self.fold(&delivery, &mut snapshot, &mut aggregates, &mut checkpoint);
                        if checkpoint.folded >= self.config.flush_every.max(1) {
                            self.flush(&mut snapshot, &aggregates, &mut checkpoint, acker.as_ref())
                                .await?;
                        }
                    },
                    Ok(None) => {
                        poll_failures = 0;
                        // Idle: checkpoint now so committed offsets (and lag) catch up.
                        if !checkpoint.is_empty() {
                            self.flush(&mut snapshot, &aggregates, &mut checkpoint, acker.as_ref())
                                .await?;
                        }
                    },
                    Err(e) if poll_failures < self.config.broker_retry.max_retries => {
                        tracing::warn!(error = %e, retry = poll_failures, "Poll failed, retrying");
                        let delay = self.config.broker_retry.delay_for_attempt(poll_failures);
                        poll_failures += 1;
                        tokio::time::sleep(delay).await;
                    },
                    Err(e) => {
                        return Err(ConsumerError::Broker { operation: "poll", source: e });
                    },
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
            }
        }

        if !checkpoint.is_empty() {
            self.flush(&mut snapshot, &aggregates, &mut checkpoint, acker.as_ref()).await?;
        }
        drop(subscription);
        tracing::info!(
            total_orders = aggregates.total_orders,
            total_reserved = aggregates.total_reserved,
            total_failed = aggregates.total_failed,
            invalid_events = aggregates.invalid_events,
            "Analytics consumer stopped, final snapshot written"
        );
        Ok(aggregates)
    }

    async fn load(&self) -> Result<(ProjectionSnapshot, AnalyticsAggregates), ConsumerError> {
        match self.snapshots.load(&self.config.projection).await? {
            Some(snapshot) => {
                let aggregates = serde_json::from_value(snapshot.state.clone())
                    .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
                Ok((snapshot, aggregates))
            },
            None => {
                let aggregates = AnalyticsAggregates::new();
                let snapshot = ProjectionSnapshot::empty(
                    self.config.projection.clone(),
                    serde_json::to_value(&aggregates)?,
                    self.clock.now(),
                );
                Ok((snapshot, aggregates))
            },
        }
    }

    fn fold(
        &self,
        delivery: &Delivery,
        snapshot: &mut ProjectionSnapshot,
        aggregates: &mut AnalyticsAggregates,
        checkpoint: &mut Checkpoint,
    ) {
        if snapshot.covers(&delivery.position) {
            tracing::debug!(position = %delivery.position, "Already folded, skipping");
        } else {
            aggregates.fold_bytes(&delivery.payload);
            snapshot.advance(&delivery.position);
            checkpoint.folded += 1;
        }
        checkpoint.track(&delivery.position);
    }

    async fn flush(
        &self,
        snapshot: &mut ProjectionSnapshot,
        aggregates: &AnalyticsAggregates,
        checkpoint: &mut Checkpoint,
        acker: &dyn Acknowledger,
    ) -> Result<(), ConsumerError> {
        snapshot.state = serde_json::to_value(aggregates)?;
        snapshot.taken_at = self.clock.now();
        self.snapshots.save(snapshot.clone()).await?;
        AnalyticsMetrics::record_snapshot();
        AnalyticsMetrics::record_folded(checkpoint.folded);

        for position in checkpoint.pending.values() {
            retry_broker(&self.config.broker_retry, "acknowledge", || {
                acker.ack(position.clone())
            })
            .await?;
        }
        tracing::debug!(
            folded = checkpoint.folded,
            partitions = checkpoint.pending.len(),
            total_orders = aggregates.total_orders,
            "Analytics snapshot saved"
        );
        checkpoint.clear();
        Ok(())
    }
}

/// Positions folded since the last snapshot, per partition.
#[derive(Debug, Default)]
struct Checkpoint {
    pending: BTreeMap<(String, i32), DeliveryPosition>,
    folded: u64,
}

impl Checkpoint {
    fn track(&mut self, position: &DeliveryPosition) {
        let key = (position.topic.clone(), position.partition);
        let newer = self
            .pending
            .get(&key)
            .is_none_or(|current| current.offset < position.offset);
        if newer {
            self.pending.insert(key, position.clone());
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.folded = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use fulfillment_testing::{InMemoryEventBus, InMemorySnapshotStore, helpers, test_clock};
    use std::time::Instant;

    fn config(flush_every: u64) -> AnalyticsConfig {
        AnalyticsConfig {
            flush_every,
            poll_timeout: Duration::from_millis(10),
            broker_retry: RetryPolicy::builder()
                .max_retries(1)
                .initial_delay(Duration::from_millis(1))
                .jitter(0.0)
                .attempt_timeout(Duration::from_millis(200))
                .build(),
            ..AnalyticsConfig::default()
        }
    }

    fn consumer(
        bus: &InMemoryEventBus,
        store: &InMemorySnapshotStore,
        flush_every: u64,
    ) -> AnalyticsConsumer {
        AnalyticsConsumer::new(Arc::new(bus.clone()), Arc::new(store.clone()), config(flush_every))
            .with_clock(Arc::new(test_clock()))
    }

    /// Run until `done` holds or `limit` passes, then shut down.
    async fn run_until(
        consumer: AnalyticsConsumer,
        limit: Duration,
        done: impl Fn() -> bool,
    ) -> AnalyticsAggregates {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { consumer.run(rx).await });
        let deadline = Instant::now() + limit;
        while !done() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send_replace(true);
        handle.await.unwrap().unwrap()
    }

    /// Long enough for the in-memory broker to deliver a small backlog.
    async fn run_briefly(consumer: AnalyticsConsumer) -> AnalyticsAggregates {
        run_until(consumer, Duration::from_millis(250), || false).await
    }

    #[tokio::test]
    async fn folds_orders_and_snapshots_on_shutdown() {
        let bus = InMemoryEventBus::new();
        let store = InMemorySnapshotStore::new();
        for n in 0..3 {
            helpers::publish_order(&bus, "order.placed", &format!("o{n}"), "burger", 1).await;
        }
        helpers::publish_raw(&bus, "inventory.failed", "x", b"{".to_vec()).await;

        let aggregates = run_briefly(consumer(&bus, &store, 1_000)).await;

        assert_eq!(aggregates.total_orders, 3);
        assert_eq!(aggregates.invalid_events, 1);
        let saved = store.get("analytics").unwrap();
        assert_eq!(saved.state, serde_json::to_value(&aggregates).unwrap());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn commits_only_after_snapshot() {
        let bus = InMemoryEventBus::with_partitions(1);
        let store = InMemorySnapshotStore::new();
        for n in 0..5 {
            helpers::publish_order(&bus, "order.placed", &format!("o{n}"), "burger", 1).await;
        }

        run_until(consumer(&bus, &store, 2), Duration::from_secs(5), || {
            store.save_count() >= 2
        })
        .await;

        let snapshot = store.get("analytics").unwrap();
        let committed = bus.committed("analytics-service", "order.placed", 0).unwrap();
        assert!(committed <= snapshot.positions["order.placed"][&0]);
    }

    #[tokio::test]
    async fn restart_skips_records_the_snapshot_covers() {
        let bus = InMemoryEventBus::with_partitions(1);
        let store = InMemorySnapshotStore::new();
        for n in 0..4 {
            helpers::publish_order(&bus, "order.placed", &format!("o{n}"), "burger", 1).await;
        }

        // A snapshot that covers the first two records whose offsets were
        // never committed: a crash between save and commit.
        let mut aggregates = AnalyticsAggregates::new();
        let mut snapshot =
            ProjectionSnapshot::empty("analytics", serde_json::Value::Null, test_clock().now());
        for record in bus.records("order.placed").iter().take(2) {
            aggregates.fold_bytes(&record.payload);
            snapshot.advance(&record.position);
        }
        snapshot.state = serde_json::to_value(&aggregates).unwrap();
        store.save(snapshot).await.unwrap();

        let aggregates = run_briefly(consumer(&bus, &store, 1_000)).await;

        assert_eq!(aggregates.total_orders, 4);
        assert_eq!(bus.committed("analytics-service", "order.placed", 0), Some(4));
    }

    #[tokio::test]
    async fn replay_rebuilds_identical_aggregates() {
        let bus = InMemoryEventBus::new();
        let store = InMemorySnapshotStore::new();
        for n in 0..6 {
            helpers::publish_order(&bus, "order.placed", &format!("o{n}"), "pizza", 1).await;
        }
        let first = run_briefly(consumer(&bus, &store, 2)).await;

        let analytics = consumer(&bus, &store, 2);
        analytics.reset(&bus).await.unwrap();
        assert!(store.get("analytics").is_none());
        let replayed = run_briefly(analytics).await;

        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&replayed).unwrap()
        );
    }

    #[tokio::test]
    async fn reset_is_refused_while_consuming() {
        let bus = InMemoryEventBus::new();
        let store = InMemorySnapshotStore::new();
        let _member = bus
            .subscribe("analytics-service", &["order.placed".to_string()])
            .await
            .unwrap();
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 1).await;

        let err = consumer(&bus, &store, 10).reset(&bus).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Broker { operation: "offset reset", .. }));
    }
}
