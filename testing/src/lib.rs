//! # Fulfillment Testing
//!
//! Testing utilities for the order fulfillment consumers.
//!
//! This crate provides:
//! - [`InMemoryEventBus`]: partitioned broker with consumer groups, redelivery and offset resets
//! - [`InMemoryInventoryStore`]: stock levels plus idempotency ledger, with outage simulation
//! - [`InMemorySnapshotStore`]: projection snapshots
//! - [`FixedClock`] / [`test_clock`]: deterministic time
//! - proptest strategies for order traffic
//!
//! ## Example
//!
//! ```ignore
//! use fulfillment_testing::{InMemoryEventBus, InMemoryInventoryStore, helpers};
//!
//! #[tokio::test]
//! async fn reserves_burgers() {
//!     let bus = InMemoryEventBus::new();
//!     let store = InMemoryInventoryStore::with_stock([("burger", 100)]);
//!     helpers::publish_order(&bus, "order.placed", "o1", "burger", 2).await;
//!
//!     // run the inventory consumer against `bus` and `store` ...
//!     assert_eq!(store.available("burger"), Some(98));
//! }
//! ```

use chrono::{DateTime, Utc};
use fulfillment_core::environment::Clock;

pub mod event_bus;
pub mod inventory;
pub mod snapshot;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time until advanced, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use fulfillment_testing::mocks::FixedClock;
    /// use fulfillment_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// assert_eq!(time1, clock.now());
    ///
    /// clock.advance(Duration::seconds(2));
    /// assert_eq!(clock.now() - time1, Duration::seconds(2));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward. Clones share the same time.
        #[allow(clippy::unwrap_used)] // Mutex poison is unrecoverable
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }
    }

    impl Clock for FixedClock {
        #[allow(clippy::unwrap_used)] // Mutex poison is unrecoverable
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities
pub mod helpers {
    use fulfillment_core::envelope::OrderPlacedEvent;
    use fulfillment_core::event_bus::{EventBus, OutboundRecord, PublishReceipt};

    /// Install a test-friendly tracing subscriber once per process.
    ///
    /// Honors `RUST_LOG`; output is captured by the test harness.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }

    /// JSON bytes of an inbound order.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn order_bytes(order_id: &str, item: &str, qty: u32) -> Vec<u8> {
        OrderPlacedEvent::new(order_id, item, qty)
            .with_student("s123")
            .to_bytes()
            .expect("order serialization cannot fail")
    }

    /// Publish an inbound order keyed by its `order_id`.
    ///
    /// # Panics
    ///
    /// Panics if the bus rejects the publish.
    #[allow(clippy::expect_used)]
    pub async fn publish_order(
        bus: &dyn EventBus,
        topic: &str,
        order_id: &str,
        item: &str,
        qty: u32,
    ) -> PublishReceipt {
        publish_raw(bus, topic, order_id, order_bytes(order_id, item, qty)).await
    }

    /// Publish arbitrary bytes keyed by `key`.
    ///
    /// # Panics
    ///
    /// Panics if the bus rejects the publish.
    #[allow(clippy::expect_used)]
    pub async fn publish_raw(
        bus: &dyn EventBus,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
    ) -> PublishReceipt {
        bus.publish(OutboundRecord::new(topic, payload).with_key(key))
            .await
            .expect("in-memory publish should succeed")
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use chrono::{DateTime, Duration, Utc};
    use fulfillment_core::envelope::{EventType, FailureReason, OrderId, Outcome, OutcomeEvent};
    use proptest::prelude::*;

    /// Items the default stock knows about, plus one it does not.
    pub const ITEMS: [&str; 5] = ["burger", "pizza", "sushi", "salad", "taco"];

    /// Arbitrary outcome events within one day of 2025-01-01.
    pub fn arb_outcome_event() -> impl Strategy<Value = OutcomeEvent> {
        (
            0u32..500,
            prop::sample::select(ITEMS.to_vec()),
            1u32..20,
            any::<bool>(),
            prop::option::of(0i64..86_400),
            0i64..5_000,
        )
            .prop_map(|(n, item, qty, reserved, placed_secs, latency_ms)| {
                let base = DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default();
                let placed_at = placed_secs.map(|s| base + Duration::seconds(s));
                let timestamp = placed_at.unwrap_or(base) + Duration::milliseconds(latency_ms);
                let (outcome, reason) = if reserved {
                    (Outcome::Reserved, None)
                } else {
                    (Outcome::Failed, Some(FailureReason::OutOfStock))
                };
                OutcomeEvent {
                    event_type: if reserved {
                        EventType::InventoryReserved
                    } else {
                        EventType::InventoryFailed
                    },
                    order_id: OrderId::new(format!("o{n}")),
                    item: item.to_string(),
                    qty,
                    outcome,
                    reason,
                    placed_at,
                    timestamp,
                }
            })
    }
}

// Re-export commonly used items
pub use event_bus::InMemoryEventBus;
pub use inventory::InMemoryInventoryStore;
pub use mocks::{FixedClock, test_clock};
pub use snapshot::InMemorySnapshotStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn clones_share_time() {
        let clock = test_clock();
        let other = clock.clone();
        clock.advance(chrono::Duration::milliseconds(250));
        assert_eq!(other.now(), clock.now());
    }
}
