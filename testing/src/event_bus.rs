//! In-memory broker with consumer-group semantics.
//!
//! [`InMemoryEventBus`] keeps a partitioned, append-only log per topic and,
//! per consumer group, the committed offsets and delivery attempt counts. It
//! reproduces the parts of a Kafka-compatible broker the consumers rely on:
//!
//! - records with the same key land on the same partition, in order
//! - a new member resumes from the group's committed offsets
//! - `nack` rewinds a partition so the record is redelivered with `attempt + 1`
//! - dropping a subscription releases the group; uncommitted records come back
//! - offset resets are refused while the group has an active member
//!
//! One active member per group; a second `subscribe` on a busy group fails.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use fulfillment_core::event_bus::{
    Acknowledger, Delivery, DeliveryPosition, EventBus, EventBusError, OffsetAdmin,
    OffsetResetRequest, OffsetResetTarget, OutboundRecord, PartitionLag, PublishReceipt,
    Subscription,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_PARTITIONS: i32 = 4;

#[derive(Clone, Debug)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
}

type PartitionKey = (String, i32);

#[derive(Debug, Default)]
struct GroupState {
    committed: HashMap<PartitionKey, i64>,
    attempts: HashMap<DeliveryPosition, u32>,
    member: Option<Member>,
}

#[derive(Debug)]
struct Member {
    id: u64,
    topics: Vec<String>,
    fetch: HashMap<PartitionKey, i64>,
    cursor: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<String, GroupState>,
    failing_topics: HashSet<String>,
    next_member_id: u64,
    round_robin: u64,
}

impl BrokerState {
    fn ensure_topic(&mut self, topic: &str, partitions: i32) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); usize::try_from(partitions).unwrap()])
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    partitions: i32,
}

/// In-memory, partitioned, consumer-group aware event bus.
///
/// # Example
///
/// ```
/// use fulfillment_core::event_bus::{EventBus, OutboundRecord};
/// use fulfillment_testing::InMemoryEventBus;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryEventBus::new();
/// bus.publish(OutboundRecord::new("order.placed", b"{}".to_vec()).with_key("o1")).await?;
///
/// let mut subscription = bus.subscribe("inventory-service", &["order.placed".to_string()]).await?;
/// let delivery = subscription.poll(Duration::from_millis(10)).await?.unwrap();
/// assert_eq!(delivery.attempt, 1);
/// subscription.acknowledger().ack(delivery.position).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

impl InMemoryEventBus {
    /// Create a bus whose topics have four partitions.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Create a bus whose topics have `partitions` partitions (at least one).
    #[must_use]
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                partitions: partitions.max(1),
            }),
        }
    }

    /// Partition a key is routed to.
    #[must_use]
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let partitions = u64::try_from(self.inner.partitions).unwrap();
        i32::try_from(hasher.finish() % partitions).unwrap()
    }

    /// Make every publish to `topic` fail until [`InMemoryEventBus::restore_publishes`].
    pub fn fail_publishes(&self, topic: &str) {
        self.inner
            .state
            .lock()
            .unwrap()
            .failing_topics
            .insert(topic.to_string());
    }

    /// Undo [`InMemoryEventBus::fail_publishes`].
    pub fn restore_publishes(&self, topic: &str) {
        self.inner.state.lock().unwrap().failing_topics.remove(topic);
    }

    /// Every record of `topic`, partition by partition, in offset order.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<Delivery> {
        let state = self.inner.state.lock().unwrap();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, record)| Delivery {
                    position: DeliveryPosition::new(
                        topic,
                        i32::try_from(partition).unwrap(),
                        i64::try_from(offset).unwrap(),
                    ),
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                    headers: record.headers.clone(),
                    attempt: 0,
                })
            })
            .collect()
    }

    /// Number of records in `topic`.
    #[must_use]
    pub fn record_count(&self, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum())
    }

    /// Committed offset of `group` on one partition.
    #[must_use]
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .state
            .lock()
            .unwrap()
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)).copied())
    }

    /// Whether `group` has an active member.
    #[must_use]
    pub fn is_group_active(&self, group: &str) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .groups
            .get(group)
            .is_some_and(|g| g.member.is_some())
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        record: OutboundRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let receipt = {
                let mut state = self.inner.state.lock().unwrap();
                if state.failing_topics.contains(&record.topic) {
                    return Err(EventBusError::PublishFailed {
                        topic: record.topic,
                        reason: "broker unavailable".to_string(),
                    });
                }

                let partition = match &record.key {
                    Some(key) => self.partition_for(key),
                    None => {
                        state.round_robin += 1;
                        let partitions = u64::try_from(self.inner.partitions).unwrap();
                        i32::try_from(state.round_robin % partitions).unwrap()
                    },
                };
                let log = &mut state.ensure_topic(&record.topic, self.inner.partitions)
                    [usize::try_from(partition).unwrap()];
                let offset = i64::try_from(log.len()).unwrap();
                log.push(StoredRecord {
                    key: record.key,
                    payload: record.payload,
                    headers: record.headers,
                });
                PublishReceipt {
                    topic: record.topic,
                    partition,
                    offset,
                }
            };
            self.inner.notify.notify_waiters();
            Ok(receipt)
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
            let mut state = self.inner.state.lock().unwrap();
            for topic in &topics {
                state.ensure_topic(topic, self.inner.partitions);
            }
            state.next_member_id += 1;
            let member_id = state.next_member_id;

            let group_state = state.groups.entry(group.clone()).or_default();
            if group_state.member.is_some() {
                return Err(EventBusError::SubscriptionFailed {
                    topics,
                    reason: format!("group '{group}' already has an active member"),
                });
            }
            group_state.member = Some(Member {
                id: member_id,
                topics: topics.clone(),
                fetch: HashMap::new(),
                cursor: 0,
            });

            let subscription: Box<dyn Subscription> = Box::new(InMemorySubscription {
                inner: Arc::clone(&self.inner),
                group,
                member_id,
            });
            Ok(subscription)
        })
    }
}

struct InMemorySubscription {
    inner: Arc<Inner>,
    group: String,
    member_id: u64,
}

impl InMemorySubscription {
    fn next_delivery(&self) -> Result<Option<Delivery>, EventBusError> {
        let mut state = self.inner.state.lock().unwrap();
        let BrokerState { topics, groups, .. } = &mut *state;
        let group = groups
            .get_mut(&self.group)
            .ok_or_else(|| {
                EventBusError::ConsumerGroupError(format!("unknown group '{}'", self.group))
            })?;
        let member = match &mut group.member {
            Some(member) if member.id == self.member_id => member,
            _ => {
                return Err(EventBusError::ConsumerGroupError(format!(
                    "member {} no longer belongs to group '{}'",
                    self.member_id, self.group
                )));
            },
        };

        let assignment: Vec<PartitionKey> = member
            .topics
            .iter()
            .flat_map(|topic| {
                let count = topics.get(topic).map_or(0, Vec::len);
                (0..count).map(move |p| (topic.clone(), i32::try_from(p).unwrap()))
            })
            .collect();
        if assignment.is_empty() {
            return Ok(None);
        }

        for step in 0..assignment.len() {
            let index = (member.cursor + step) % assignment.len();
            let key = &assignment[index];
            let log = &topics[&key.0][usize::try_from(key.1).unwrap()];
            let next = *member
                .fetch
                .entry(key.clone())
                .or_insert_with(|| group.committed.get(key).copied().unwrap_or(0));
            let Some(record) = usize::try_from(next).ok().and_then(|n| log.get(n)) else {
                continue;
            };

            member.fetch.insert(key.clone(), next + 1);
            member.cursor = index + 1;
            let position = DeliveryPosition::new(key.0.clone(), key.1, next);
            let attempt = group.attempts.entry(position.clone()).or_insert(0);
            *attempt += 1;
            return Ok(Some(Delivery {
                position,
                key: record.key.clone(),
                payload: record.payload.clone(),
                headers: record.headers.clone(),
                attempt: *attempt,
            }));
        }
        Ok(None)
    }
}

impl Subscription for InMemorySubscription {
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let notified = self.inner.notify.notified();
                if let Some(delivery) = self.next_delivery()? {
                    return Ok(Some(delivery));
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn acknowledger(&self) -> Arc<dyn Acknowledger> {
        Arc::new(InMemoryAcknowledger {
            inner: Arc::clone(&self.inner),
            group: self.group.clone(),
            member_id: self.member_id,
        })
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            if let Some(group) = state.groups.get_mut(&self.group) {
                if group.member.as_ref().is_some_and(|m| m.id == self.member_id) {
                    group.member = None;
                }
            }
        }
    }
}

struct InMemoryAcknowledger {
    inner: Arc<Inner>,
    group: String,
    member_id: u64,
}

impl InMemoryAcknowledger {
    fn with_member<T>(
        &self,
        position: &DeliveryPosition,
        f: impl FnOnce(&mut GroupState) -> T,
    ) -> Result<T, EventBusError> {
        let mut state = self.inner.state.lock().unwrap();
        let group = state
            .groups
            .get_mut(&self.group)
            .filter(|g| g.member.as_ref().is_some_and(|m| m.id == self.member_id))
            .ok_or_else(|| EventBusError::CommitFailed {
                position: position.clone(),
                reason: format!("member no longer owns its partitions in '{}'", self.group),
            })?;
        Ok(f(group))
    }
}

impl Acknowledger for InMemoryAcknowledger {
    fn ack(
        &self,
        position: DeliveryPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(async move {
            self.with_member(&position, |group| {
                let committed = group
                    .committed
                    .entry((position.topic.clone(), position.partition))
                    .or_insert(0);
                *committed = (*committed).max(position.offset + 1);
            })
        })
    }

    fn nack(
        &self,
        position: DeliveryPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(async move {
            self.with_member(&position, |group| {
                let Some(member) = &mut group.member else {
                    return;
                };
                let fetch = member
                    .fetch
                    .entry((position.topic.clone(), position.partition))
                    .or_insert(position.offset);
                let fetched_up_to = *fetch;
                *fetch = (*fetch).min(position.offset);

                // Records handed out after the rewound one were never processed.
                for offset in position.offset + 1..fetched_up_to {
                    let recalled =
                        DeliveryPosition::new(position.topic.clone(), position.partition, offset);
                    if let Some(attempt) = group.attempts.get_mut(&recalled) {
                        *attempt = attempt.saturating_sub(1);
                    }
                }
            })?;
            self.inner.notify.notify_waiters();
            Ok(())
        })
    }
}

impl OffsetAdmin for InMemoryEventBus {
    fn reset_offsets(
        &self,
        request: OffsetResetRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.inner.state.lock().unwrap();
            let BrokerState { topics, groups, .. } = &mut *state;
            let group = groups.entry(request.consumer_group.clone()).or_default();
            if group.member.is_some() {
                return Err(EventBusError::GroupActive(request.consumer_group));
            }

            for topic in &request.topics {
                let partitions = topics
                    .get(topic)
                    .ok_or_else(|| EventBusError::InvalidTopic(topic.clone()))?;
                for (partition, log) in partitions.iter().enumerate() {
                    let offset = match request.target {
                        OffsetResetTarget::Earliest => 0,
                        OffsetResetTarget::Latest => i64::try_from(log.len()).unwrap(),
                    };
                    group
                        .committed
                        .insert((topic.clone(), i32::try_from(partition).unwrap()), offset);
                }
                group.attempts.retain(|position, _| &position.topic != topic);
            }
            Ok(())
        })
    }

    fn consumer_lag(
        &self,
        group: &str,
        topics: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PartitionLag>, EventBusError>> + Send + '_>> {
        let group = group.to_string();
        let topics = topics.to_vec();
        Box::pin(async move {
            let state = self.inner.state.lock().unwrap();
            let committed = state.groups.get(&group).map(|g| &g.committed);
            let mut report = Vec::new();
            for topic in &topics {
                let Some(partitions) = state.topics.get(topic) else {
                    continue;
                };
                for (partition, log) in partitions.iter().enumerate() {
                    let partition = i32::try_from(partition).unwrap();
                    let offset =
                        committed.and_then(|c| c.get(&(topic.clone(), partition)).copied());
                    report.push(PartitionLag::from_watermarks(
                        group.clone(),
                        topic.clone(),
                        partition,
                        offset,
                        0,
                        i64::try_from(log.len()).unwrap(),
                    ));
                }
            }
            Ok(report)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "order.placed";
    const POLL: Duration = Duration::from_millis(20);

    fn topics() -> Vec<String> {
        vec![TOPIC.to_string()]
    }

    async fn publish(bus: &InMemoryEventBus, key: &str, body: &str) -> PublishReceipt {
        bus.publish(OutboundRecord::new(TOPIC, body.as_bytes().to_vec()).with_key(key))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn same_key_same_partition_in_order() {
        let bus = InMemoryEventBus::new();
        let first = publish(&bus, "o1", "a").await;
        let second = publish(&bus, "o1", "b").await;

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn resumes_from_committed_offset() {
        let bus = InMemoryEventBus::with_partitions(1);
        publish(&bus, "o1", "a").await;
        publish(&bus, "o2", "b").await;

        {
            let mut sub = bus.subscribe("g", &topics()).await.unwrap();
            let first = sub.poll(POLL).await.unwrap().unwrap();
            sub.acknowledger().ack(first.position).await.unwrap();
            let _unacked = sub.poll(POLL).await.unwrap().unwrap();
        }

        let mut sub = bus.subscribe("g", &topics()).await.unwrap();
        let redelivered = sub.poll(POLL).await.unwrap().unwrap();
        assert_eq!(redelivered.payload, b"b");
        assert_eq!(redelivered.attempt, 2);
        assert!(sub.poll(POLL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_rewinds_partition() {
        let bus = InMemoryEventBus::with_partitions(1);
        publish(&bus, "o1", "a").await;
        publish(&bus, "o2", "b").await;

        let mut sub = bus.subscribe("g", &topics()).await.unwrap();
        let acker = sub.acknowledger();
        let first = sub.poll(POLL).await.unwrap().unwrap();
        let _second = sub.poll(POLL).await.unwrap().unwrap();
        acker.nack(first.position.clone()).await.unwrap();

        let again = sub.poll(POLL).await.unwrap().unwrap();
        assert_eq!(again.position, first.position);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn one_member_per_group() {
        let bus = InMemoryEventBus::new();
        let _sub = bus.subscribe("g", &topics()).await.unwrap();
        assert!(bus.subscribe("g", &topics()).await.is_err());
        assert!(bus.subscribe("other", &topics()).await.is_ok());
    }

    #[tokio::test]
    async fn reset_refused_while_active_then_rewinds() {
        let bus = InMemoryEventBus::with_partitions(1);
        publish(&bus, "o1", "a").await;
        let request = OffsetResetRequest {
            consumer_group: "g".to_string(),
            topics: topics(),
            target: OffsetResetTarget::Earliest,
        };

        {
            let mut sub = bus.subscribe("g", &topics()).await.unwrap();
            let d = sub.poll(POLL).await.unwrap().unwrap();
            sub.acknowledger().ack(d.position).await.unwrap();
            assert_eq!(
                bus.reset_offsets(request.clone()).await.unwrap_err(),
                EventBusError::GroupActive("g".to_string())
            );
        }

        assert_eq!(bus.consumer_lag("g", &topics()).await.unwrap()[0].lag, 0);
        bus.reset_offsets(request).await.unwrap();
        assert_eq!(bus.consumer_lag("g", &topics()).await.unwrap()[0].lag, 1);
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe("g", &topics()).await.unwrap();
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publish(&publisher, "o1", "late").await;
        });

        let delivery = sub.poll(Duration::from_secs(2)).await.unwrap();
        assert_eq!(delivery.unwrap().payload, b"late");
    }

    #[tokio::test]
    async fn failing_topic_rejects_publishes() {
        let bus = InMemoryEventBus::new();
        bus.fail_publishes(TOPIC);
        assert!(
            bus.publish(OutboundRecord::new(TOPIC, Vec::new()))
                .await
                .is_err()
        );
        bus.restore_publishes(TOPIC);
        assert!(bus.publish(OutboundRecord::new(TOPIC, Vec::new())).await.is_ok());
    }
}
