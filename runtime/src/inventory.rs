//! Inventory reservation consumer.
//!
//! Consumes `order.placed` as consumer group `inventory-service` and drives
//! every message through one state machine:
//!
//! ```text
//! received ──► validated ──► deduplicated ─────────────────────────► acknowledged
//!    │             │     └──► reserved / failed ──► published ──────► acknowledged
//!    │             └──► dead-lettered ───────────────────────────────► acknowledged
//!    └──► (transient failure) left unacknowledged, redelivered
//! ```
//!
//! # Guarantees
//!
//! - A message is acknowledged only after its outcome is recorded in the
//!   ledger and published, or after it is dead-lettered.
//! - The ledger insert and the stock decrement commit together, so a
//!   redelivered order never reserves twice.
//! - A duplicate whose outcome event never made it out (crash between commit
//!   and publish) has the stored outcome re-published before it is
//!   acknowledged.
//! - Transient dependency failures are never retried in-process. The message
//!   is rewound and redelivered; past `max_deliveries` it is dead-lettered,
//!   unless the ledger already holds its order. A decided order is always
//!   finished as a duplicate.
//!
//! # Concurrency
//!
//! A dispatcher task polls the subscription and hands each delivery to the
//! shard worker owning its partition. Workers run independently; the ledger
//! is the only state they share.

use crate::dead_letter::{DeadLetterRouter, Routed};
use crate::error::{ConsumerError, ProcessingError, TransientDependencyError};
use crate::fault::FaultSwitch;
use crate::metrics::InventoryMetrics;
use crate::retry::{RetryPolicy, retry_broker};
use crate::shard::{GateVerdict, RewindGate, shard_for};
use fulfillment_core::dead_letter::DeadLetterReason;
use fulfillment_core::envelope::{validate, Envelope, EventType, FailureReason, OrderId};
use fulfillment_core::environment::{Clock, SystemClock};
use fulfillment_core::event_bus::{Acknowledger, Delivery, EventBus, OutboundRecord};
use fulfillment_core::ledger::{
    IdempotencyLedger, IdempotencyRecord, InventoryStore, LedgerEntry, LedgerError,
    ReservationCommit, ReservationRequest,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Inventory consumer configuration.
#[derive(Clone, Debug)]
pub struct InventoryConfig {
    /// Inbound topic
    pub order_topic: String,
    /// Topic for `InventoryReserved`
    pub reserved_topic: String,
    /// Topic for `InventoryFailed`
    pub failed_topic: String,
    /// Dead-letter topic
    pub dlq_topic: String,
    /// Consumer group
    pub consumer_group: String,
    /// Number of shard workers
    pub shards: usize,
    /// Deliveries of one message before it is dead-lettered
    pub max_deliveries: u32,
    /// How long one poll waits for a record
    pub poll_timeout: Duration,
    /// Bound on each ledger / stock store call
    pub dependency_timeout: Duration,
    /// Retry policy for broker calls
    pub broker_retry: RetryPolicy,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            order_topic: "order.placed".to_string(),
            reserved_topic: "inventory.reserved".to_string(),
            failed_topic: "inventory.failed".to_string(),
            dlq_topic: "order.placed.dlq".to_string(),
            consumer_group: "inventory-service".to_string(),
            shards: 4,
            max_deliveries: 5,
            poll_timeout: Duration::from_secs(1),
            dependency_timeout: Duration::from_secs(2),
            broker_retry: RetryPolicy::default(),
        }
    }
}

/// Terminal fate of one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fate {
    /// Stock reserved, `InventoryReserved` published
    Reserved,
    /// Reservation failed, `InventoryFailed` published
    Failed(FailureReason),
    /// Already decided and published; nothing emitted
    Duplicate,
    /// Already decided but unpublished; stored outcome re-published
    Republished,
    /// Isolated on the dead-letter topic
    DeadLettered(DeadLetterReason),
    /// Left unacknowledged for redelivery
    Redelivery,
}

impl Fate {
    /// Metric / log label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Failed(_) => "failed",
            Self::Duplicate => "duplicate",
            Self::Republished => "republished",
            Self::DeadLettered(_) => "dead_lettered",
            Self::Redelivery => "redelivery",
        }
    }
}

/// Counts of message fates over a consumer run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InventoryStats {
    /// Orders reserved
    pub reserved: u64,
    /// Orders failed
    pub failed: u64,
    /// Duplicates suppressed
    pub duplicates: u64,
    /// Duplicates whose stored outcome was re-published
    pub republished: u64,
    /// Messages dead-lettered
    pub dead_lettered: u64,
    /// Messages left for redelivery
    pub redelivered: u64,
}

impl InventoryStats {
    fn record(&mut self, fate: Fate) {
        match fate {
            Fate::Reserved => self.reserved += 1,
            Fate::Failed(_) => self.failed += 1,
            Fate::Duplicate => self.duplicates += 1,
            Fate::Republished => self.republished += 1,
            Fate::DeadLettered(_) => self.dead_lettered += 1,
            Fate::Redelivery => self.redelivered += 1,
        }
    }

    fn merge(&mut self, other: Self) {
        self.reserved += other.reserved;
        self.failed += other.failed;
        self.duplicates += other.duplicates;
        self.republished += other.republished;
        self.dead_lettered += other.dead_lettered;
        self.redelivered += other.redelivered;
    }

    /// Messages that reached a terminal, acknowledged fate.
    #[must_use]
    pub const fn acknowledged(&self) -> u64 {
        self.reserved + self.failed + self.duplicates + self.republished + self.dead_lettered
    }
}

/// The inventory reservation consumer.
///
/// # Example
///
/// ```ignore
/// let consumer = InventoryConsumer::new(bus, store, InventoryConfig::default())
///     .with_faults(FaultSwitch::new(FaultInjection::new(0, false)));
///
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let stats = consumer.run(shutdown_rx).await?;
/// ```
pub struct InventoryConsumer {
    bus: Arc<dyn EventBus>,
    store: Arc<dyn InventoryStore>,
    ledger: Arc<dyn IdempotencyLedger>,
    clock: Arc<dyn Clock>,
    faults: FaultSwitch,
    config: InventoryConfig,
}

impl InventoryConsumer {
    /// Create a consumer over `bus` and `store`.
    #[must_use]
    pub fn new<S>(bus: Arc<dyn EventBus>, store: Arc<S>, config: InventoryConfig) -> Self
    where
        S: InventoryStore + 'static,
    {
        Self {
            bus,
            ledger: Arc::clone(&store) as Arc<dyn IdempotencyLedger>,
            store,
            clock: Arc::new(SystemClock),
            faults: FaultSwitch::default(),
            config,
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use shared fault-injection settings.
    #[must_use]
    pub fn with_faults(mut self, faults: FaultSwitch) -> Self {
        self.faults = faults;
        self
    }

    /// Consume until `shutdown` turns true or a fatal error occurs.
    ///
    /// On shutdown each worker finishes the message it is processing; queued
    /// messages stay unacknowledged and are redelivered to the next member.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError`] if subscribing fails, the broker stays
    /// unreachable, or a poison message cannot be dead-lettered.
    #[allow(clippy::cognitive_complexity)]
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<InventoryStats, ConsumerError> {
        let config = self.config.clone();
        let shards = config.shards.max(1);
        tracing::info!(
            topic = %config.order_topic,
            consumer_group = %config.consumer_group,
            shards,
            max_deliveries = config.max_deliveries,
            "Starting inventory consumer"
        );

        let topics = vec![config.order_topic.clone()];
        let mut subscription = retry_broker(&config.broker_retry, "subscribe", || {
            self.bus.subscribe(&config.consumer_group, &topics)
        })
        .await?;
        let acker = subscription.acknowledger();

        let processor = Arc::new(MessageProcessor {
            router: DeadLetterRouter::new(
                Arc::clone(&self.bus),
                self.ledger,
                Arc::clone(&self.clock),
                config.dlq_topic.clone(),
            )
            .with_retry(config.broker_retry.clone())
            .with_dependency_timeout(config.dependency_timeout),
            bus: self.bus,
            store: self.store,
            clock: self.clock,
            faults: self.faults,
            config: config.clone(),
        });

        let (halt_tx, mut halt_rx) = watch::channel(false);
        let mut senders = Vec::with_capacity(shards);
        let mut workers: Vec<JoinHandle<Result<InventoryStats, ConsumerError>>> =
            Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, rx) = mpsc::channel(64);
            senders.push(tx);
            let worker = ShardWorker {
                shard,
                processor: Arc::clone(&processor),
                acker: Arc::clone(&acker),
                inbox: rx,
                gate: RewindGate::new(),
                shutdown: shutdown.clone(),
                halt: halt_tx.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        let mut poll_failures = 0;
        let mut dispatch_error = None;
        while !*shutdown.borrow() && !*halt_rx.borrow() {
            tokio::select! {
                polled = subscription.poll(config.poll_timeout) => match polled {
                    Ok(Some(delivery)) => {
                        poll_failures = 0;
                        let shard = shard_for(delivery.position.partition, shards);
                        tracing::debug!(
                            position = %delivery.position,
                            attempt = delivery.attempt,
                            shard,
                            "Dispatching delivery"
                        );
                        if senders[shard].send(delivery).await.is_err() {
                            break;
                        }
                    },
                    Ok(None) => poll_failures = 0,
                    Err(e) if poll_failures < config.broker_retry.max_retries => {
                        let delay = config.broker_retry.delay_for_attempt(poll_failures);
                        tracing::warn!(error = %e, retry = poll_failures, "Poll failed, retrying");
                        poll_failures += 1;
                        tokio::time::sleep(delay).await;
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "Poll failed after max retries");
                        dispatch_error = Some(ConsumerError::Broker {
                            operation: "poll",
                            source: e,
                        });
                        break;
                    },
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                },
                _ = halt_rx.changed() => {},
            }
        }

        // Closing the inboxes lets idle workers exit.
        drop(senders);
        let mut stats = InventoryStats::default();
        let mut first_error = dispatch_error;
        for (shard, result) in futures::future::join_all(workers).await.into_iter().enumerate() {
            match result {
                Ok(Ok(shard_stats)) => stats.merge(shard_stats),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                },
                Err(join) => {
                    first_error.get_or_insert(ConsumerError::WorkerStopped {
                        shard,
                        reason: join.to_string(),
                    });
                },
            }
        }
        // Leave the group only after in-flight work is finished.
        drop(subscription);

        match first_error {
            Some(e) => {
                tracing::error!(error = %e, "Inventory consumer halted");
                Err(e)
            },
            None => {
                tracing::info!(
                    reserved = stats.reserved,
                    failed = stats.failed,
                    duplicates = stats.duplicates,
                    dead_lettered = stats.dead_lettered,
                    redelivered = stats.redelivered,
                    "Inventory consumer stopped"
                );
                Ok(stats)
            },
        }
    }
}

struct ShardWorker {
    shard: usize,
    processor: Arc<MessageProcessor>,
    acker: Arc<dyn Acknowledger>,
    inbox: mpsc::Receiver<Delivery>,
    gate: RewindGate,
    shutdown: watch::Receiver<bool>,
    halt: watch::Sender<bool>,
}

impl ShardWorker {
    async fn run(mut self) -> Result<InventoryStats, ConsumerError> {
        let mut stats = InventoryStats::default();
        while !*self.shutdown.borrow() {
            let Some(delivery) = self.inbox.recv().await else {
                break;
            };
            if *self.shutdown.borrow() {
                break;
            }
            if self.gate.admit(&delivery.position) == GateVerdict::Stale {
                tracing::debug!(
                    shard = self.shard,
                    position = %delivery.position,
                    "Dropping stale delivery"
                );
                continue;
            }

            let started = Instant::now();
            match self.processor.handle(&delivery, self.acker.as_ref()).await {
                Ok(fate) => {
                    if fate == Fate::Redelivery {
                        self.gate.rewind(&delivery.position);
                    }
                    stats.record(fate);
                    InventoryMetrics::record_fate(fate.label(), started.elapsed());
                },
                Err(e) => {
                    tracing::error!(
                        shard = self.shard,
                        position = %delivery.position,
                        error = %e,
                        "Fatal error, halting consumer"
                    );
                    self.halt.send_replace(true);
                    return Err(e);
                },
            }
        }
        tracing::debug!(shard = self.shard, "Shard worker stopped");
        Ok(stats)
    }
}

struct MessageProcessor {
    bus: Arc<dyn EventBus>,
    store: Arc<dyn InventoryStore>,
    clock: Arc<dyn Clock>,
    faults: FaultSwitch,
    router: DeadLetterRouter,
    config: InventoryConfig,
}

impl MessageProcessor {
    /// Drive one delivery to its fate. Acknowledges or rewinds it.
    async fn handle(
        &self,
        delivery: &Delivery,
        acker: &dyn Acknowledger,
    ) -> Result<Fate, ConsumerError> {
        match self.process(delivery, acker).await {
            Ok(fate) => Ok(fate),
            Err(ProcessingError::Fatal(e)) => Err(e),
            Err(ProcessingError::Transient(e))
                if delivery.attempt >= self.config.max_deliveries =>
            {
                // An order the ledger already holds is never dead-lettered.
                if let Some(entry) = self.decided(delivery).await {
                    return self.finish_duplicate(entry, delivery, acker).await;
                }
                let detail = format!(
                    "unprocessable after {} delivery attempts: {e}",
                    delivery.attempt
                );
                self.dead_letter(delivery, DeadLetterReason::Unparseable, &detail, acker)
                    .await
            },
            Err(ProcessingError::Transient(e)) => self.redeliver(delivery, &e, acker).await,
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: DeadLetterReason,
        detail: &str,
        acker: &dyn Acknowledger,
    ) -> Result<Fate, ConsumerError> {
        let routed = self.router.route(delivery, reason, detail, acker).await?;
        if routed == Routed::AlreadyIsolated {
            tracing::debug!(position = %delivery.position, "Dead-letter copy already present");
        }
        Ok(Fate::DeadLettered(reason))
    }

    async fn redeliver(
        &self,
        delivery: &Delivery,
        cause: &TransientDependencyError,
        acker: &dyn Acknowledger,
    ) -> Result<Fate, ConsumerError> {
        tracing::warn!(
            position = %delivery.position,
            attempt = delivery.attempt,
            max_deliveries = self.config.max_deliveries,
            error = %cause,
            "Transient failure, leaving message for redelivery"
        );
        retry_broker(&self.config.broker_retry, "rewind", || {
            acker.nack(delivery.position.clone())
        })
        .await?;
        InventoryMetrics::record_redelivery();
        Ok(Fate::Redelivery)
    }

    async fn process(
        &self,
        delivery: &Delivery,
        acker: &dyn Acknowledger,
    ) -> Result<Fate, ProcessingError> {
        // received -> validated
        let envelope = match validate(&delivery.payload) {
            Ok(envelope) if envelope.event_type == EventType::OrderPlaced => envelope,
            Ok(envelope) => {
                let detail = format!(
                    "{} is not accepted on {}",
                    envelope.event_type, delivery.position.topic
                );
                return Ok(self
                    .dead_letter(delivery, DeadLetterReason::SchemaViolation, &detail, acker)
                    .await?);
            },
            Err(err) => {
                return Ok(self
                    .dead_letter(delivery, err.dead_letter_reason(), &err.to_string(), acker)
                    .await?);
            },
        };

        let order_id = envelope.order_id.clone();
        tracing::debug!(
            order_id = %order_id,
            item = %envelope.payload.item,
            qty = envelope.payload.quantity,
            position = %delivery.position,
            attempt = delivery.attempt,
            "Processing order"
        );

        // validated -> deduplicated
        if let Some(entry) = self.bounded("ledger", self.store.find(order_id.clone())).await? {
            return Ok(self.finish_duplicate(entry, delivery, acker).await?);
        }

        // Undecided and redelivered past the budget without a nack, e.g. by
        // members that crashed mid-message.
        if delivery.attempt > self.config.max_deliveries {
            let detail = format!("unprocessable after {} delivery attempts", delivery.attempt - 1);
            return Ok(self
                .dead_letter(delivery, DeadLetterReason::Unparseable, &detail, acker)
                .await?);
        }

        // validated -> reserved | failed, committed with the ledger record
        let faults = self.faults.apply().await;
        let request = reservation_request(&envelope, faults.force_failure, self.clock.as_ref());
        let fate = match self.bounded("inventory store", self.store.reserve(request)).await? {
            ReservationCommit::Committed(record) => {
                self.publish_outcome(&record).await?;
                self.mark_published(&order_id).await;
                match record.reason {
                    None => Fate::Reserved,
                    Some(reason) => Fate::Failed(reason),
                }
            },
            ReservationCommit::Duplicate(entry) => {
                return Ok(self.finish_duplicate(entry, delivery, acker).await?);
            },
        };

        self.ack(delivery, acker).await?;
        tracing::info!(
            order_id = %order_id,
            fate = fate.label(),
            position = %delivery.position,
            "Order processed"
        );
        Ok(fate)
    }

    async fn finish_duplicate(
        &self,
        entry: LedgerEntry,
        delivery: &Delivery,
        acker: &dyn Acknowledger,
    ) -> Result<Fate, ConsumerError> {
        let order_id = entry.record.order_id.clone();
        let fate = if entry.published {
            Fate::Duplicate
        } else {
            self.publish_outcome(&entry.record).await?;
            self.mark_published(&order_id).await;
            Fate::Republished
        };
        self.ack(delivery, acker).await?;
        tracing::info!(
            order_id = %order_id,
            fate = fate.label(),
            position = %delivery.position,
            "Duplicate order acknowledged"
        );
        Ok(fate)
    }

    /// Ledger entry of the delivery's order, if there is one and the ledger
    /// answers.
    async fn decided(&self, delivery: &Delivery) -> Option<LedgerEntry> {
        let envelope = validate(&delivery.payload).ok()?;
        match self.bounded("ledger", self.store.find(envelope.order_id)).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    position = %delivery.position,
                    error = %e,
                    "Ledger unreadable with the delivery budget spent"
                );
                None
            },
        }
    }

    /// The outcome is already out; a lost marker only costs a re-publish if
    /// the order is delivered again.
    async fn mark_published(&self, order_id: &OrderId) {
        if let Err(e) = self.bounded("ledger", self.store.mark_published(order_id.clone())).await {
            tracing::warn!(order_id = %order_id, error = %e, "Failed to mark outcome published");
        }
    }

    async fn publish_outcome(&self, record: &IdempotencyRecord) -> Result<(), ConsumerError> {
        let event = record.outcome_event();
        let topic = match record.event_type() {
            EventType::InventoryReserved => &self.config.reserved_topic,
            _ => &self.config.failed_topic,
        };
        let payload = event.to_bytes()?;
        retry_broker(&self.config.broker_retry, "outcome publish", || {
            self.bus.publish(
                OutboundRecord::new(topic.clone(), payload.clone())
                    .with_key(record.order_id.as_str()),
            )
        })
        .await?;
        InventoryMetrics::record_outcome_published(record.event_type().as_str());
        Ok(())
    }

    async fn ack(
        &self,
        delivery: &Delivery,
        acker: &dyn Acknowledger,
    ) -> Result<(), ConsumerError> {
        retry_broker(&self.config.broker_retry, "acknowledge", || {
            acker.ack(delivery.position.clone())
        })
        .await
    }

    /// Run a store call under the dependency timeout.
    async fn bounded<T>(
        &self,
        dependency: &'static str,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> Result<T, TransientDependencyError> {
        let timeout = self.config.dependency_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TransientDependencyError::new(dependency, e.to_string())),
            Err(_) => Err(TransientDependencyError::timed_out(dependency, timeout)),
        }
    }
}

fn reservation_request(
    envelope: &Envelope,
    force_failure: bool,
    clock: &dyn Clock,
) -> ReservationRequest {
    ReservationRequest {
        order_id: envelope.order_id.clone(),
        item: envelope.payload.item.clone(),
        quantity: envelope.payload.quantity,
        placed_at: envelope.published_at,
        force_failure,
        committed_at: clock.now(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fault::FaultInjection;
    use fulfillment_core::dead_letter::{DeadLetterRecord, HEADER_REASON};
    use fulfillment_core::envelope::Outcome;
    use fulfillment_core::event_bus::Subscription as _;
    use fulfillment_testing::{InMemoryEventBus, InMemoryInventoryStore, helpers, test_clock};

    fn config(shards: usize, max_deliveries: u32) -> InventoryConfig {
        InventoryConfig {
            shards,
            max_deliveries,
            poll_timeout: Duration::from_millis(10),
            dependency_timeout: Duration::from_millis(200),
            broker_retry: RetryPolicy::builder()
                .max_retries(1)
                .initial_delay(Duration::from_millis(1))
                .jitter(0.0)
                .attempt_timeout(Duration::from_millis(200))
                .build(),
            ..InventoryConfig::default()
        }
    }

    fn stocked() -> InMemoryInventoryStore {
        InMemoryInventoryStore::with_stock([("burger", 100), ("pizza", 1)])
    }

    /// Run a consumer until `done` holds, then shut it down.
    async fn run_until(
        consumer: InventoryConsumer,
        done: impl Fn() -> bool,
    ) -> Result<InventoryStats, ConsumerError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(shutdown_rx));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && !handle.is_finished() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send_replace(true);
        handle.await.unwrap()
    }

    fn consumer(
        bus: &InMemoryEventBus,
        store: &InMemoryInventoryStore,
        config: InventoryConfig,
    ) -> InventoryConsumer {
        InventoryConsumer::new(Arc::new(bus.clone()), Arc::new(store.clone()), config)
            .with_clock(Arc::new(test_clock()))
    }

    fn committed_total(bus: &InMemoryEventBus) -> i64 {
        (0..4)
            .filter_map(|p| bus.committed("inventory-service", "order.placed", p))
            .sum()
    }

    #[tokio::test]
    async fn reserves_stock_and_publishes_outcome() {
        helpers::init_test_tracing();
        let bus = InMemoryEventBus::new();
        let store = stocked();
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 2).await;

        let stats = run_until(consumer(&bus, &store, config(2, 5)), || {
            committed_total(&bus) == 1
        })
        .await
        .unwrap();

        assert_eq!(stats.reserved, 1);
        assert_eq!(store.available("burger"), Some(98));
        assert!(store.is_published("o1"));

        let reserved = bus.records("inventory.reserved");
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].key.as_deref(), Some("o1"));
        let event: serde_json::Value = serde_json::from_slice(&reserved[0].payload).unwrap();
        assert_eq!(event["event_type"], "InventoryReserved");
        assert_eq!(event["outcome"], "reserved");
        assert_eq!(event["qty"], 2);
    }

    #[tokio::test]
    async fn duplicate_order_reserves_once() {
        let bus = InMemoryEventBus::new();
        let store = stocked();
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 2).await;
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 2).await;

        let stats = run_until(consumer(&bus, &store, config(4, 5)), || {
            committed_total(&bus) == 2
        })
        .await
        .unwrap();

        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(store.available("burger"), Some(98));
        assert_eq!(store.ledger_len(), 1);
        assert_eq!(bus.record_count("inventory.reserved"), 1);
    }

    #[tokio::test]
    async fn insufficient_and_unknown_stock_fail_the_order() {
        let bus = InMemoryEventBus::new();
        let store = stocked();
        helpers::publish_order(&bus, "order.placed", "o1", "pizza", 2).await;
        helpers::publish_order(&bus, "order.placed", "o2", "ramen", 1).await;

        let stats = run_until(consumer(&bus, &store, config(1, 5)), || {
            bus.record_count("inventory.failed") == 2
        })
        .await
        .unwrap();

        assert_eq!(stats.failed, 2);
        assert_eq!(store.available("pizza"), Some(1));
        assert_eq!(store.record("o1").unwrap().reason, Some(FailureReason::OutOfStock));
        assert_eq!(store.record("o2").unwrap().reason, Some(FailureReason::UnknownItem));
        assert_eq!(store.record("o2").unwrap().outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn poison_message_is_isolated_without_blocking_its_partition() {
        let bus = InMemoryEventBus::with_partitions(1);
        let store = stocked();
        let bad = br#"{"order_id":"bad","item":"burger"}"#;
        helpers::publish_raw(&bus, "order.placed", "bad", bad.to_vec()).await;
        helpers::publish_order(&bus, "order.placed", "o2", "burger", 1).await;

        let stats = run_until(consumer(&bus, &store, config(1, 5)), || {
            bus.committed("inventory-service", "order.placed", 0) == Some(2)
        })
        .await
        .unwrap();

        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.reserved, 1);
        let dlq = bus.records("order.placed.dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].headers[HEADER_REASON], "missing_field");
        assert_eq!(dlq[0].payload, br#"{"order_id":"bad","item":"burger"}"#.to_vec());
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn outcome_events_on_the_order_topic_are_schema_violations() {
        let bus = InMemoryEventBus::with_partitions(1);
        let store = stocked();
        let stray = br#"{"event_type":"InventoryReserved","order_id":"o9","item":"burger",
            "qty":1,"outcome":"reserved"}"#;
        helpers::publish_raw(&bus, "order.placed", "o9", stray.to_vec()).await;

        let stats = run_until(consumer(&bus, &store, config(1, 5)), || {
            bus.record_count("order.placed.dlq") == 1
        })
        .await
        .unwrap();

        assert_eq!(stats.dead_lettered, 1);
        let record = DeadLetterRecord::from_delivery(&bus.records("order.placed.dlq")[0]).unwrap();
        assert_eq!(record.reason, DeadLetterReason::SchemaViolation);
    }

    #[tokio::test]
    async fn outage_redelivers_then_dead_letters_past_budget() {
        let bus = InMemoryEventBus::with_partitions(1);
        let store = stocked();
        store.set_unavailable(true);
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 1).await;

        let stats = run_until(consumer(&bus, &store, config(1, 3)), || {
            bus.record_count("order.placed.dlq") == 1
        })
        .await
        .unwrap();

        assert_eq!(stats.redelivered, 2);
        assert_eq!(stats.dead_lettered, 1);
        let record = DeadLetterRecord::from_delivery(&bus.records("order.placed.dlq")[0]).unwrap();
        assert_eq!(record.reason, DeadLetterReason::Unparseable);
        assert!(record.detail.contains("3 delivery attempts"));
        assert_eq!(bus.committed("inventory-service", "order.placed", 0), Some(1));
    }

    #[tokio::test]
    async fn recovers_after_short_outage() {
        let bus = InMemoryEventBus::with_partitions(1);
        let store = stocked();
        store.set_unavailable(true);
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 1).await;

        let flip = store.clone();
        let checks = std::sync::atomic::AtomicU32::new(0);
        let stats = run_until(consumer(&bus, &store, config(1, u32::MAX)), || {
            if checks.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 10 {
                flip.set_unavailable(false);
            }
            committed_total(&bus) == 1
        })
        .await
        .unwrap();

        assert_eq!(stats.reserved, 1);
        assert!(stats.redelivered >= 1);
        assert_eq!(store.available("burger"), Some(99));
        assert_eq!(bus.record_count("order.placed.dlq"), 0);
    }

    #[tokio::test]
    async fn forced_failure_overrides_stock() {
        let bus = InMemoryEventBus::new();
        let store = stocked();
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 1).await;

        let stats = run_until(
            consumer(&bus, &store, config(2, 5))
                .with_faults(FaultSwitch::new(FaultInjection::new(5, true))),
            || bus.record_count("inventory.failed") == 1,
        )
        .await
        .unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(store.available("burger"), Some(100));
        assert_eq!(store.record("o1").unwrap().reason, Some(FailureReason::ForcedFailure));
    }

    #[tokio::test]
    async fn decided_order_past_the_budget_is_acknowledged_as_duplicate() {
        let bus = InMemoryEventBus::with_partitions(1);
        let store = stocked();
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 2).await;
        store
            .reserve(ReservationRequest {
                order_id: OrderId::new("o1"),
                item: "burger".to_string(),
                quantity: 2,
                placed_at: None,
                force_failure: false,
                committed_at: test_clock().now(),
            })
            .await
            .unwrap();
        store.mark_published(OrderId::new("o1")).await.unwrap();

        // Earlier members took the message and died before acknowledging it.
        for _ in 0..5 {
            let mut sub = bus
                .subscribe("inventory-service", &["order.placed".to_string()])
                .await
                .unwrap();
            let taken = sub.poll(Duration::from_millis(20)).await.unwrap();
            assert!(taken.is_some());
        }

        let stats = run_until(consumer(&bus, &store, config(1, 5)), || {
            committed_total(&bus) == 1
        })
        .await
        .unwrap();

        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(bus.record_count("order.placed.dlq"), 0);
        assert_eq!(bus.record_count("inventory.reserved"), 0);
        assert_eq!(store.available("burger"), Some(98));
    }

    #[tokio::test]
    async fn lost_publication_marker_does_not_redeliver() {
        let bus = InMemoryEventBus::with_partitions(1);
        let store = stocked();
        store.set_marking_unavailable(true);
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 2).await;

        let stats = run_until(consumer(&bus, &store, config(1, 3)), || {
            committed_total(&bus) == 1
        })
        .await
        .unwrap();

        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.redelivered, 0);
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(bus.record_count("inventory.reserved"), 1);
        assert_eq!(bus.record_count("order.placed.dlq"), 0);
        assert_eq!(store.available("burger"), Some(98));
        assert!(!store.is_published("o1"));
    }

    #[tokio::test]
    async fn oversized_quantity_fails_out_of_stock() {
        let bus = InMemoryEventBus::new();
        let store = stocked();
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 3_000_000_000).await;

        let stats = run_until(consumer(&bus, &store, config(1, 5)), || {
            bus.record_count("inventory.failed") == 1
        })
        .await
        .unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(store.record("o1").unwrap().reason, Some(FailureReason::OutOfStock));
        assert_eq!(store.available("burger"), Some(100));
    }

    #[tokio::test]
    async fn unpublished_record_is_republished_on_redelivery() {
        let bus = InMemoryEventBus::new();
        let store = stocked();
        let record = IdempotencyRecord {
            order_id: fulfillment_core::envelope::OrderId::new("o1"),
            outcome: Outcome::Reserved,
            reason: None,
            item: "burger".to_string(),
            quantity: 2,
            placed_at: None,
            committed_at: test_clock().now(),
        };
        store.record_outcome(record).await.unwrap();
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 2).await;

        let stats = run_until(consumer(&bus, &store, config(2, 5)), || {
            committed_total(&bus) == 1
        })
        .await
        .unwrap();

        assert_eq!(stats.republished, 1);
        assert!(store.is_published("o1"));
        assert_eq!(bus.record_count("inventory.reserved"), 1);
        assert_eq!(store.available("burger"), Some(100));
    }

    #[tokio::test]
    async fn unreachable_outcome_topic_halts_without_acknowledging() {
        let bus = InMemoryEventBus::with_partitions(1);
        let store = stocked();
        bus.fail_publishes("inventory.reserved");
        helpers::publish_order(&bus, "order.placed", "o1", "burger", 1).await;

        let err = run_until(consumer(&bus, &store, config(1, 5)), || false)
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumerError::Broker { operation: "outcome publish", .. }));
        assert_eq!(bus.committed("inventory-service", "order.placed", 0), None);
        assert!(!store.is_published("o1"));
        assert!(!bus.is_group_active("inventory-service"));
    }

    #[tokio::test]
    async fn drains_a_backlog_across_shards() {
        let bus = InMemoryEventBus::new();
        let store = InMemoryInventoryStore::with_stock([("burger", 1_000)]);
        for n in 0..40 {
            helpers::publish_order(&bus, "order.placed", &format!("o{n}"), "burger", 1).await;
        }

        let stats = run_until(consumer(&bus, &store, config(4, 5)), || {
            committed_total(&bus) == 40
        })
        .await
        .unwrap();

        assert_eq!(stats.reserved, 40);
        assert_eq!(stats.acknowledged(), 40);
        assert_eq!(store.available("burger"), Some(960));
        assert_eq!(bus.record_count("inventory.reserved"), 40);
    }

    #[tokio::test]
    async fn shutdown_with_empty_topic_returns_zero_stats() {
        let bus = InMemoryEventBus::new();
        let store = stocked();

        let stats = run_until(consumer(&bus, &store, config(2, 5)), || true)
            .await
            .unwrap();

        assert_eq!(stats, InventoryStats::default());
        assert!(!bus.is_group_active("inventory-service"));
    }
}
