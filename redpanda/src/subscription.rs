//! Consumer-group subscription over an rdkafka `StreamConsumer`.

use fulfillment_core::event_bus::{
    Acknowledger, Delivery, DeliveryPosition, EventBusError, Subscription,
};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Delivery counts for positions that are not yet committed.
///
/// Kafka does not track redeliveries, so the count lives in the process and
/// restarts at one after a restart or rebalance.
#[derive(Debug, Default)]
struct AttemptCounter {
    seen: Mutex<HashMap<DeliveryPosition, u32>>,
}

impl AttemptCounter {
    fn lock(&self) -> MutexGuard<'_, HashMap<DeliveryPosition, u32>> {
        self.seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next(&self, position: &DeliveryPosition) -> u32 {
        let mut seen = self.lock();
        let attempt = seen.entry(position.clone()).or_insert(0);
        *attempt += 1;
        *attempt
    }

    /// Forget everything up to and including a committed position.
    fn settle(&self, committed: &DeliveryPosition) {
        self.lock().retain(|p, _| {
            p.topic != committed.topic
                || p.partition != committed.partition
                || p.offset > committed.offset
        });
    }

    /// A rewind re-fetches records after `rewound` that were never at fault;
    /// take back the delivery they are about to be charged again.
    fn recall_after(&self, rewound: &DeliveryPosition) {
        for (position, attempt) in self.lock().iter_mut() {
            if position.topic == rewound.topic
                && position.partition == rewound.partition
                && position.offset > rewound.offset
            {
                *attempt = attempt.saturating_sub(1);
            }
        }
    }
}

fn read_headers<H: Headers + ?Sized>(headers: &H) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|header| {
            header
                .value
                .map(|value| (header.key.to_string(), String::from_utf8_lossy(value).into_owned()))
        })
        .collect()
}

fn commit_failed(position: &DeliveryPosition, reason: impl Display) -> EventBusError {
    EventBusError::CommitFailed {
        position: position.clone(),
        reason: reason.to_string(),
    }
}

/// Live membership in a consumer group.
///
/// Dropping it unsubscribes, releasing the group's partitions.
pub struct RedpandaSubscription {
    consumer: Arc<StreamConsumer>,
    attempts: Arc<AttemptCounter>,
    timeout: Duration,
}

impl RedpandaSubscription {
    pub(crate) fn new(consumer: Arc<StreamConsumer>, timeout: Duration) -> Self {
        Self {
            consumer,
            attempts: Arc::new(AttemptCounter::default()),
            timeout,
        }
    }
}

impl Subscription for RedpandaSubscription {
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Failed to receive message");
                    return Err(EventBusError::TransportError(format!(
                        "Failed to receive message: {e}"
                    )));
                },
                Ok(Ok(message)) => message,
            };

            let position =
                DeliveryPosition::new(message.topic(), message.partition(), message.offset());
            let delivery = Delivery {
                attempt: self.attempts.next(&position),
                key: message.key().map(|key| String::from_utf8_lossy(key).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                headers: message.headers().map(read_headers).unwrap_or_default(),
                position,
            };
            tracing::trace!(
                position = %delivery.position,
                attempt = delivery.attempt,
                "Received record"
            );
            Ok(Some(delivery))
        })
    }

    fn acknowledger(&self) -> Arc<dyn Acknowledger> {
        Arc::new(RedpandaAcknowledger {
            consumer: Arc::clone(&self.consumer),
            attempts: Arc::clone(&self.attempts),
            timeout: self.timeout,
        })
    }
}

impl Drop for RedpandaSubscription {
    fn drop(&mut self) {
        self.consumer.unsubscribe();
        tracing::debug!("Subscription dropped, partitions released");
    }
}

/// Commits and rewinds positions of a [`RedpandaSubscription`].
///
/// Commits are synchronous on the broker side: `ack` returns only once the
/// group coordinator has stored the offset.
pub struct RedpandaAcknowledger {
    consumer: Arc<StreamConsumer>,
    attempts: Arc<AttemptCounter>,
    timeout: Duration,
}

impl Acknowledger for RedpandaAcknowledger {
    fn ack(
        &self,
        position: DeliveryPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let mut offsets = TopicPartitionList::new();
            offsets
                .add_partition_offset(
                    &position.topic,
                    position.partition,
                    Offset::Offset(position.offset + 1),
                )
                .map_err(|e| commit_failed(&position, e))?;

            let consumer = Arc::clone(&self.consumer);
            tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
                .await
                .map_err(|e| commit_failed(&position, e))?
                .map_err(|e| {
                    tracing::error!(position = %position, error = %e, "Failed to commit offset");
                    commit_failed(&position, e)
                })?;

            self.attempts.settle(&position);
            tracing::trace!(position = %position, "Offset committed");
            Ok(())
        })
    }

    fn nack(
        &self,
        position: DeliveryPosition,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let consumer = Arc::clone(&self.consumer);
            let (topic, partition, offset, timeout) =
                (position.topic.clone(), position.partition, position.offset, self.timeout);
            tokio::task::spawn_blocking(move || {
                consumer.seek(&topic, partition, Offset::Offset(offset), timeout)
            })
            .await
            .map_err(|e| commit_failed(&position, e))?
            .map_err(|e| {
                tracing::error!(position = %position, error = %e, "Failed to rewind partition");
                commit_failed(&position, e)
            })?;

            self.attempts.recall_after(&position);
            tracing::debug!(position = %position, "Partition rewound for redelivery");
            Ok(())
        })
    }
}
