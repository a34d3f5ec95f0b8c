//! Consumer-lag monitoring.
//!
//! Lag is the number of records published to a partition but not yet
//! committed by a group. The monitor is read-only: it never joins a group
//! and never moves offsets.
//!
//! It answers three questions:
//! - how far behind is a group right now ([`LagMonitor::report`])
//! - has a backlog finished draining ([`LagMonitor::wait_for_drain`])
//! - should a producer slow down ([`LagMonitor::throttle_advice`])

use crate::error::ConsumerError;
use crate::metrics::LagMetrics;
use crate::retry::{RetryPolicy, retry_broker};
use fulfillment_core::event_bus::{OffsetAdmin, PartitionLag};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Lag of one group across its partitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LagReport {
    /// Consumer group
    pub consumer_group: String,
    /// Per-partition lag, ordered by topic then partition
    pub partitions: Vec<PartitionLag>,
}

impl LagReport {
    /// Total lag over all partitions.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.partitions.iter().map(|p| p.lag).sum()
    }

    /// Whether every published record has been committed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.total() == 0
    }
}

/// Advice for a producer deciding whether to keep publishing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleAdvice {
    /// Lag is under the threshold
    Proceed,
    /// Lag reached the threshold; slow down
    Throttle {
        /// Current total lag
        lag: u64,
    },
}

/// A group and the topics to watch it on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LagWatch {
    /// Consumer group
    pub consumer_group: String,
    /// Topics the group consumes
    pub topics: Vec<String>,
}

impl LagWatch {
    /// Watch `consumer_group` on `topics`.
    #[must_use]
    pub fn new(consumer_group: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            topics,
        }
    }
}

/// Reads consumer lag through an [`OffsetAdmin`].
#[derive(Clone)]
pub struct LagMonitor {
    admin: Arc<dyn OffsetAdmin>,
    retry: RetryPolicy,
}

impl LagMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(admin: Arc<dyn OffsetAdmin>) -> Self {
        Self {
            admin,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the broker retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Current lag of `group` on `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Broker`] if offsets cannot be read after retries.
    pub async fn report(&self, group: &str, topics: &[String]) -> Result<LagReport, ConsumerError> {
        let mut partitions = retry_broker(&self.retry, "consumer lag", || {
            self.admin.consumer_lag(group, topics)
        })
        .await?;
        partitions.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));

        let report = LagReport {
            consumer_group: group.to_string(),
            partitions,
        };
        for partition in &report.partitions {
            LagMetrics::record_partition(
                group,
                &partition.topic,
                partition.partition,
                partition.lag,
            );
        }
        LagMetrics::record_total(group, report.total());
        Ok(report)
    }

    /// Poll until `group` has no lag on `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::DrainTimeout`] if lag is still positive after
    /// `timeout`, or [`ConsumerError::Broker`] if offsets cannot be read.
    pub async fn wait_for_drain(
        &self,
        group: &str,
        topics: &[String],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<LagReport, ConsumerError> {
        let started = Instant::now();
        loop {
            let report = self.report(group, topics).await?;
            if report.is_drained() {
                tracing::info!(
                    consumer_group = group,
                    waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Consumer group drained"
                );
                return Ok(report);
            }
            if started.elapsed() >= timeout {
                return Err(ConsumerError::DrainTimeout {
                    group: group.to_string(),
                    lag: report.total(),
                    waited: started.elapsed(),
                });
            }
            tracing::debug!(consumer_group = group, lag = report.total(), "Waiting for drain");
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Compare the group's total lag against `threshold`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Broker`] if offsets cannot be read.
    pub async fn throttle_advice(
        &self,
        group: &str,
        topics: &[String],
        threshold: u64,
    ) -> Result<ThrottleAdvice, ConsumerError> {
        let lag = self.report(group, topics).await?.total();
        if lag >= threshold {
            tracing::warn!(consumer_group = group, lag, threshold, "Consumer lag above threshold");
            Ok(ThrottleAdvice::Throttle { lag })
        } else {
            Ok(ThrottleAdvice::Proceed)
        }
    }

    /// Log and record lag for every watch each `interval` until shutdown.
    ///
    /// Read failures are logged and the next tick tries again.
    pub async fn run_reporter(
        &self,
        watches: Vec<LagWatch>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for watch in &watches {
                        match self.report(&watch.consumer_group, &watch.topics).await {
                            Ok(report) => tracing::info!(
                                consumer_group = %watch.consumer_group,
                                lag = report.total(),
                                partitions = report.partitions.len(),
                                "Consumer lag"
                            ),
                            Err(e) => tracing::warn!(
                                consumer_group = %watch.consumer_group,
                                error = %e,
                                "Failed to read consumer lag"
                            ),
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Lag reporter stopped");
                        return;
                    }
                },
            }
        }
    }
}
