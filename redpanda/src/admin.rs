//! Offset administration: consumer lag and offset resets.
//!
//! Both operations use a short-lived `BaseConsumer` configured with the
//! target group id. It never subscribes, so it never joins the group; it only
//! reads or writes the group's committed offsets through the coordinator.

use crate::RedpandaEventBus;
use fulfillment_core::event_bus::{
    EventBusError, OffsetAdmin, OffsetResetRequest, OffsetResetTarget, PartitionLag,
};
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

fn transport(context: &str, error: impl std::fmt::Display) -> EventBusError {
    EventBusError::TransportError(format!("{context}: {error}"))
}

/// Partition ids of `topic`. A topic the broker does not know has none.
fn partitions(
    consumer: &BaseConsumer,
    topic: &str,
    timeout: Duration,
) -> Result<Vec<i32>, EventBusError> {
    let metadata = consumer
        .fetch_metadata(Some(topic), timeout)
        .map_err(|e| transport(&format!("metadata of '{topic}'"), e))?;
    let partitions: Vec<i32> = metadata
        .topics()
        .iter()
        .filter(|t| t.name() == topic)
        .flat_map(|t| t.partitions().iter().map(|p| p.id()))
        .collect();
    if partitions.is_empty() {
        tracing::warn!(topic, "Topic has no partitions");
    }
    Ok(partitions)
}

/// `(topic, partition, low, high)` for every partition of `topics`.
fn watermarks(
    consumer: &BaseConsumer,
    topics: &[String],
    timeout: Duration,
) -> Result<Vec<(String, i32, i64, i64)>, EventBusError> {
    let mut marks = Vec::new();
    for topic in topics {
        for partition in partitions(consumer, topic, timeout)? {
            let (low, high) = consumer
                .fetch_watermarks(topic, partition, timeout)
                .map_err(|e| transport(&format!("watermarks of {topic}/{partition}"), e))?;
            marks.push((topic.clone(), partition, low, high));
        }
    }
    Ok(marks)
}

fn collect_lag(
    consumer: &BaseConsumer,
    group: &str,
    topics: &[String],
    timeout: Duration,
) -> Result<Vec<PartitionLag>, EventBusError> {
    let marks = watermarks(consumer, topics, timeout)?;

    let mut assignment = TopicPartitionList::new();
    for (topic, partition, _, _) in &marks {
        assignment.add_partition(topic, *partition);
    }
    let committed = consumer
        .committed_offsets(assignment, timeout)
        .map_err(|e| {
            EventBusError::ConsumerGroupError(format!("committed offsets of '{group}': {e}"))
        })?;

    Ok(marks
        .into_iter()
        .map(|(topic, partition, low, high)| {
            let offset = committed
                .find_partition(&topic, partition)
                .and_then(|elem| match elem.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                });
            PartitionLag::from_watermarks(group, topic, partition, offset, low, high)
        })
        .collect())
}

fn reset(
    consumer: &BaseConsumer,
    request: &OffsetResetRequest,
    timeout: Duration,
) -> Result<usize, EventBusError> {
    let group = &request.consumer_group;
    let listing = consumer
        .fetch_group_list(Some(group), timeout)
        .map_err(|e| EventBusError::ConsumerGroupError(format!("describe '{group}': {e}")))?;
    if listing
        .groups()
        .iter()
        .any(|g| g.name() == group.as_str() && !g.members().is_empty())
    {
        return Err(EventBusError::GroupActive(group.clone()));
    }

    let mut offsets = TopicPartitionList::new();
    for (topic, partition, low, high) in watermarks(consumer, &request.topics, timeout)? {
        let target = match request.target {
            OffsetResetTarget::Earliest => low,
            OffsetResetTarget::Latest => high,
        };
        offsets
            .add_partition_offset(&topic, partition, Offset::Offset(target))
            .map_err(|e| transport(&format!("offset for {topic}/{partition}"), e))?;
    }

    let moved = offsets.count();
    if moved > 0 {
        consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| EventBusError::ConsumerGroupError(format!("reset '{group}': {e}")))?;
    }
    Ok(moved)
}

impl RedpandaEventBus {
    fn admin_consumer(&self, group: &str) -> Result<BaseConsumer, EventBusError> {
        self.consumer_config(group)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create admin consumer: {e}"))
            })
    }
}

impl OffsetAdmin for RedpandaEventBus {
    fn reset_offsets(
        &self,
        request: OffsetResetRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let consumer = self.admin_consumer(&request.consumer_group)?;
            let timeout = self.timeout();
            let (request, moved) = tokio::task::spawn_blocking(move || {
                reset(&consumer, &request, timeout).map(|moved| (request, moved))
            })
            .await
            .map_err(|e| transport("offset reset task", e))??;

            tracing::info!(
                consumer_group = %request.consumer_group,
                topics = ?request.topics,
                target = ?request.target,
                partitions = moved,
                "Consumer group offsets reset"
            );
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
            let consumer = self.admin_consumer(&group)?;
            let timeout = self.timeout();
            tokio::task::spawn_blocking(move || collect_lag(&consumer, &group, &topics, timeout))
                .await
                .map_err(|e| transport("consumer lag task", e))?
        })
    }
}
