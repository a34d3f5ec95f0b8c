//! Analytics aggregates.
//!
//! A pure fold over the event stream: the same multiset of events always
//! yields the same aggregates, in any order. Every map is a `BTreeMap` so the
//! serialized form is byte-stable across runs.

use chrono::{DateTime, Utc};
use fulfillment_core::envelope::{validate, Envelope, EventType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bucket used for orders that carry no publication time.
pub const UNKNOWN_MINUTE: &str = "unknown";

/// Latency between an order's publication and its outcome event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyTally {
    /// Samples folded
    pub count: u64,
    /// Sum of samples in milliseconds
    pub sum_ms: i64,
    /// Smallest sample
    pub min_ms: Option<i64>,
    /// Largest sample
    pub max_ms: Option<i64>,
}

impl LatencyTally {
    fn record(&mut self, sample_ms: i64) {
        self.count += 1;
        self.sum_ms = self.sum_ms.saturating_add(sample_ms);
        self.min_ms = Some(self.min_ms.map_or(sample_ms, |m| m.min(sample_ms)));
        self.max_ms = Some(self.max_ms.map_or(sample_ms, |m| m.max(sample_ms)));
    }
}

/// Count and latency of one event type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTally {
    /// Events of this type
    pub count: u64,
    /// Latency samples, from outcome events that carry `placed_at`
    pub latency: LatencyTally,
}

/// Aggregated analytics over the order and outcome streams.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsAggregates {
    /// `OrderPlaced` events seen
    pub total_orders: u64,
    /// `InventoryReserved` events seen
    pub total_reserved: u64,
    /// `InventoryFailed` events seen
    pub total_failed: u64,
    /// `failed / (reserved + failed)`, rounded to 6 places
    pub failure_rate: f64,
    /// Orders per minute of their own publication time, `YYYY-MM-DDTHH:MMZ`
    pub orders_per_minute: BTreeMap<String, u64>,
    /// Per event type tallies, keyed by wire name
    pub by_event_type: BTreeMap<String, EventTally>,
    /// Failed outcomes per reason
    pub failure_reasons: BTreeMap<String, u64>,
    /// Records that failed validation
    pub invalid_events: u64,
}

impl AnalyticsAggregates {
    /// Empty aggregates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold raw record bytes. Invalid records only bump `invalid_events`.
    pub fn fold_bytes(&mut self, raw: &[u8]) {
        match validate(raw) {
            Ok(envelope) => self.fold(&envelope),
            Err(_) => self.invalid_events += 1,
        }
    }

    /// Fold one validated event.
    pub fn fold(&mut self, envelope: &Envelope) {
        let tally = self
            .by_event_type
            .entry(envelope.event_type.as_str().to_string())
            .or_default();
        tally.count += 1;

        match envelope.event_type {
            EventType::OrderPlaced => {
                self.total_orders += 1;
                *self
                    .orders_per_minute
                    .entry(minute_bucket(envelope.published_at))
                    .or_default() += 1;
            },
            EventType::InventoryReserved => self.total_reserved += 1,
            EventType::InventoryFailed => self.total_failed += 1,
        }

        if let Some(details) = &envelope.outcome {
            if let (Some(placed_at), Some(decided_at)) =
                (details.placed_at, envelope.published_at)
            {
                tally.latency.record((decided_at - placed_at).num_milliseconds());
            }
            if let Some(reason) = details.reason {
                *self.failure_reasons.entry(reason.as_str().to_string()).or_default() += 1;
            }
        }

        self.failure_rate = failure_rate(self.total_reserved, self.total_failed);
    }

    /// Events folded, valid or not.
    #[must_use]
    pub fn events_folded(&self) -> u64 {
        self.by_event_type.values().map(|t| t.count).sum::<u64>() + self.invalid_events
    }
}

/// Minute bucket of a publication time.
#[must_use]
pub fn minute_bucket(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(
        || UNKNOWN_MINUTE.to_string(),
        |at| at.format("%Y-%m-%dT%H:%MZ").to_string(),
    )
}

#[allow(clippy::cast_precision_loss)]
fn failure_rate(reserved: u64, failed: u64) -> f64 {
    let decided = reserved + failed;
    if decided == 0 {
        return 0.0;
    }
    ((failed as f64 / decided as f64) * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use fulfillment_core::envelope::{
        FailureReason, OrderId, OrderPlacedEvent, Outcome, OutcomeEvent,
    };
    use fulfillment_testing::properties::arb_outcome_event;
    use proptest::prelude::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn outcome(order_id: &str, failed: bool, placed_at: Option<&str>, timestamp: &str) -> Vec<u8> {
        OutcomeEvent {
            event_type: if failed {
                EventType::InventoryFailed
            } else {
                EventType::InventoryReserved
            },
            order_id: OrderId::new(order_id),
            item: "burger".to_string(),
            qty: 1,
            outcome: if failed { Outcome::Failed } else { Outcome::Reserved },
            reason: failed.then_some(FailureReason::OutOfStock),
            placed_at: placed_at.map(at),
            timestamp: at(timestamp),
        }
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn counts_orders_per_minute() {
        let mut aggregates = AnalyticsAggregates::new();
        for (id, ts) in [
            ("o1", "2025-01-01T10:00:05Z"),
            ("o2", "2025-01-01T10:00:59Z"),
            ("o3", "2025-01-01T10:01:00Z"),
        ] {
            let raw = OrderPlacedEvent::new(id, "burger", 1)
                .published_at(at(ts))
                .to_bytes()
                .unwrap();
            aggregates.fold_bytes(&raw);
        }
        aggregates.fold_bytes(&OrderPlacedEvent::new("o4", "pizza", 1).to_bytes().unwrap());

        assert_eq!(aggregates.total_orders, 4);
        assert_eq!(aggregates.orders_per_minute["2025-01-01T10:00Z"], 2);
        assert_eq!(aggregates.orders_per_minute["2025-01-01T10:01Z"], 1);
        assert_eq!(aggregates.orders_per_minute[UNKNOWN_MINUTE], 1);
    }

    #[test]
    fn tallies_outcomes_latency_and_reasons() {
        let mut aggregates = AnalyticsAggregates::new();
        let placed = Some("2025-01-01T10:00:00Z");
        aggregates.fold_bytes(&outcome("o1", false, placed, "2025-01-01T10:00:00.120Z"));
        aggregates.fold_bytes(&outcome("o2", false, placed, "2025-01-01T10:00:00.080Z"));
        aggregates.fold_bytes(&outcome("o3", true, None, "2025-01-01T10:00:01Z"));

        assert_eq!(aggregates.total_reserved, 2);
        assert_eq!(aggregates.total_failed, 1);
        assert_eq!(aggregates.failure_rate, 0.333_333);
        assert_eq!(aggregates.failure_reasons["out_of_stock"], 1);

        let reserved = aggregates.by_event_type["InventoryReserved"];
        assert_eq!(reserved.count, 2);
        assert_eq!(reserved.latency.sum_ms, 200);
        assert_eq!(reserved.latency.min_ms, Some(80));
        assert_eq!(reserved.latency.max_ms, Some(120));
        assert_eq!(aggregates.by_event_type["InventoryFailed"].latency.count, 0);
    }

    #[test]
    fn invalid_records_are_counted_not_folded() {
        let mut aggregates = AnalyticsAggregates::new();
        aggregates.fold_bytes(b"garbage");
        aggregates.fold_bytes(br#"{"order_id":"o1","item":"burger"}"#);

        assert_eq!(aggregates.invalid_events, 2);
        assert_eq!(aggregates.total_orders, 0);
        assert_eq!(aggregates.events_folded(), 2);
    }

    #[test]
    fn no_outcomes_means_zero_failure_rate() {
        let aggregates = AnalyticsAggregates::new();
        assert_eq!(aggregates.failure_rate, 0.0);
    }

    proptest! {
        #[test]
        fn fold_is_order_independent(
            events in prop::collection::vec(arb_outcome_event(), 0..60),
            seed in any::<u64>(),
        ) {
            let bytes: Vec<Vec<u8>> = events.iter().map(|e| e.to_bytes().unwrap()).collect();

            let mut forward = AnalyticsAggregates::new();
            bytes.iter().for_each(|raw| forward.fold_bytes(raw));

            let mut shuffled = bytes.clone();
            let len = shuffled.len();
            if len > 1 {
                let k = usize::try_from(seed % len as u64).unwrap();
                shuffled.rotate_left(k);
                shuffled.reverse();
            }
            let mut permuted = AnalyticsAggregates::new();
            shuffled.iter().for_each(|raw| permuted.fold_bytes(raw));

            prop_assert_eq!(
                serde_json::to_vec(&forward).unwrap(),
                serde_json::to_vec(&permuted).unwrap()
            );
            prop_assert_eq!(forward.total_reserved + forward.total_failed, events.len() as u64);
        }
    }
}
