//! In-memory inventory store and idempotency ledger.
//!
//! All state lives behind one mutex, so `reserve` is atomic the same way the
//! Postgres transaction is. Outages and slow storage can be simulated to drive
//! the consumer's transient-failure paths.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use fulfillment_core::dead_letter::DeadLetterReason;
use fulfillment_core::envelope::OrderId;
use fulfillment_core::event_bus::DeliveryPosition;
use fulfillment_core::ledger::{
    decide_reservation, IdempotencyLedger, IdempotencyRecord, InventoryStore, LedgerEntry,
    LedgerError, ReservationCommit, ReservationRequest, StockDecision, StockLevel,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct InventoryState {
    stock: HashMap<String, u32>,
    ledger: HashMap<OrderId, IdempotencyRecord>,
    published: HashSet<OrderId>,
    dead_letters: HashMap<DeliveryPosition, DeadLetterReason>,
}

/// In-memory [`InventoryStore`] for fast, deterministic tests.
///
/// # Example
///
/// ```
/// use fulfillment_core::ledger::{InventoryStore, StockLevel};
/// use fulfillment_testing::InMemoryInventoryStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryInventoryStore::with_stock([("burger", 100)]);
/// assert_eq!(store.stock_level("burger".to_string()).await?, Some(100));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryInventoryStore {
    state: Arc<Mutex<InventoryState>>,
    unavailable: Arc<AtomicBool>,
    marking_unavailable: Arc<AtomicBool>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryInventoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with stock levels.
    #[must_use]
    pub fn with_stock<'a>(levels: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock().unwrap();
            for (item, units) in levels {
                state.stock.insert(item.to_string(), units);
            }
        }
        store
    }

    /// Fail every operation with [`LedgerError::Unavailable`] while `down` is true.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Fail only `mark_published` while `down` is true.
    pub fn set_marking_unavailable(&self, down: bool) {
        self.marking_unavailable.store(down, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Number of ledger records.
    #[must_use]
    pub fn ledger_len(&self) -> usize {
        self.state.lock().unwrap().ledger.len()
    }

    /// The record of an order, if any.
    #[must_use]
    pub fn record(&self, order_id: &str) -> Option<IdempotencyRecord> {
        self.state
            .lock()
            .unwrap()
            .ledger
            .get(&OrderId::new(order_id))
            .cloned()
    }

    /// Whether an order's outcome is marked published.
    #[must_use]
    pub fn is_published(&self, order_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .published
            .contains(&OrderId::new(order_id))
    }

    /// Number of dead-letter markers.
    #[must_use]
    pub fn dead_letter_count(&self) -> usize {
        self.state.lock().unwrap().dead_letters.len()
    }

    /// Current units of an item, without going through the async API.
    #[must_use]
    pub fn available(&self, item: &str) -> Option<u32> {
        self.state.lock().unwrap().stock.get(item).copied()
    }

    async fn enter(&self) -> Result<(), LedgerError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

impl IdempotencyLedger for InMemoryInventoryStore {
    fn find(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LedgerEntry>, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.enter().await?;
            let state = self.state.lock().unwrap();
            Ok(state.ledger.get(&order_id).map(|record| LedgerEntry {
                record: record.clone(),
                published: state.published.contains(&order_id),
            }))
        })
    }

    fn record_outcome(
        &self,
        record: IdempotencyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.enter().await?;
            let mut state = self.state.lock().unwrap();
            if state.ledger.contains_key(&record.order_id) {
                return Err(LedgerError::Conflict(record.order_id));
            }
            state.ledger.insert(record.order_id.clone(), record);
            Ok(())
        })
    }

    fn mark_published(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.enter().await?;
            if self.marking_unavailable.load(Ordering::SeqCst) {
                return Err(LedgerError::Unavailable("simulated marker outage".to_string()));
            }
            let mut state = self.state.lock().unwrap();
            if !state.ledger.contains_key(&order_id) {
                return Err(LedgerError::Storage(format!("no record for order '{order_id}'")));
            }
            state.published.insert(order_id);
            Ok(())
        })
    }

    fn is_dead_lettered(
        &self,
        source: DeliveryPosition,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.state.lock().unwrap().dead_letters.contains_key(&source))
        })
    }

    fn record_dead_letter(
        &self,
        source: DeliveryPosition,
        reason: DeadLetterReason,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.enter().await?;
            let mut state = self.state.lock().unwrap();
            if state.dead_letters.contains_key(&source) {
                return Ok(false);
            }
            state.dead_letters.insert(source, reason);
            Ok(true)
        })
    }
}

impl InventoryStore for InMemoryInventoryStore {
    fn reserve(
        &self,
        request: ReservationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ReservationCommit, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.enter().await?;
            let mut state = self.state.lock().unwrap();
            if let Some(record) = state.ledger.get(&request.order_id) {
                return Ok(ReservationCommit::Duplicate(LedgerEntry {
                    record: record.clone(),
                    published: state.published.contains(&request.order_id),
                }));
            }

            let decision = decide_reservation(
                state.stock.get(&request.item).copied(),
                request.quantity,
                request.force_failure,
            );
            if let StockDecision::Reserve { remaining } = decision {
                state.stock.insert(request.item.clone(), remaining);
            }
            let record = request.into_record(decision);
            state.ledger.insert(record.order_id.clone(), record.clone());
            Ok(ReservationCommit::Committed(record))
        })
    }

    fn stock_level(
        &self,
        item: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u32>, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.state.lock().unwrap().stock.get(&item).copied())
        })
    }

    fn seed_stock(
        &self,
        levels: Vec<StockLevel>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            self.enter().await?;
            let mut state = self.state.lock().unwrap();
            let mut seeded = 0;
            for level in levels {
                if !state.stock.contains_key(&level.item) {
                    state.stock.insert(level.item, level.available);
                    seeded += 1;
                }
            }
            Ok(seeded)
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fulfillment_core::envelope::{FailureReason, Outcome};

    fn request(order_id: &str, item: &str, quantity: u32) -> ReservationRequest {
        ReservationRequest {
            order_id: OrderId::new(order_id),
            item: item.to_string(),
            quantity,
            placed_at: None,
            force_failure: false,
            committed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reserve_commits_once() {
        let store = InMemoryInventoryStore::with_stock([("burger", 100)]);

        let first = store.reserve(request("o1", "burger", 2)).await.unwrap();
        assert!(matches!(
            first,
            ReservationCommit::Committed(ref r) if r.outcome == Outcome::Reserved
        ));
        let second = store.reserve(request("o1", "burger", 2)).await.unwrap();
        assert!(matches!(second, ReservationCommit::Duplicate(_)));

        assert_eq!(store.available("burger"), Some(98));
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn failures_leave_stock_untouched() {
        let store = InMemoryInventoryStore::with_stock([("sushi", 1)]);

        let commit = store.reserve(request("o2", "sushi", 5)).await.unwrap();
        let ReservationCommit::Committed(record) = commit else {
            panic!("expected a committed failure");
        };
        assert_eq!(record.reason, Some(FailureReason::OutOfStock));
        assert_eq!(store.available("sushi"), Some(1));
    }

    #[tokio::test]
    async fn record_outcome_conflicts_on_second_insert() {
        let store = InMemoryInventoryStore::new();
        let record = request("o3", "pizza", 1).into_record(StockDecision::Reserve { remaining: 0 });

        store.record_outcome(record.clone()).await.unwrap();
        assert_eq!(
            store.record_outcome(record).await.unwrap_err(),
            LedgerError::Conflict(OrderId::new("o3"))
        );
        assert!(store.has_processed(OrderId::new("o3")).await.unwrap());
    }

    #[tokio::test]
    async fn seeding_never_refills() {
        let store = InMemoryInventoryStore::with_stock([("burger", 3)]);
        let seeded = store
            .seed_stock(vec![StockLevel::new("burger", 100), StockLevel::new("salad", 200)])
            .await
            .unwrap();

        assert_eq!(seeded, 1);
        assert_eq!(store.available("burger"), Some(3));
        assert_eq!(store.available("salad"), Some(200));
    }

    #[tokio::test]
    async fn outage_is_transient() {
        let store = InMemoryInventoryStore::new();
        store.set_unavailable(true);
        let err = store.find(OrderId::new("o1")).await.unwrap_err();
        assert!(err.is_transient());
    }
}
