//! Idempotency ledger and inventory store contracts.
//!
//! The ledger is the only state shared between inventory consumer instances.
//! It answers one question, "has this order already been decided?", and makes
//! the answer durable in the same transaction that moves stock.
//!
//! # Atomicity
//!
//! Check-then-record is a single conditional insert. Two workers racing on the
//! same `order_id` both attempt the insert; exactly one wins, the other sees
//! [`ReservationCommit::Duplicate`] (or [`LedgerError::Conflict`] from
//! [`IdempotencyLedger::record_outcome`]) and treats its message as a replay.
//!
//! # Records Are Immutable
//!
//! An [`IdempotencyRecord`] is written once and never updated. Whether its
//! outcome event has reached the broker is tracked by a separate publication
//! marker ([`IdempotencyLedger::mark_published`]).

use crate::envelope::{EventType, FailureReason, OrderId, Outcome, OutcomeEvent};
use crate::event_bus::DeliveryPosition;
use crate::dead_letter::DeadLetterReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from ledger and stock storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The order already has a recorded outcome
    #[error("Order '{0}' already has a recorded outcome")]
    Conflict(OrderId),

    /// Storage could not be reached in time (pool exhausted, I/O, timeout)
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// Storage rejected the operation
    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Whether redelivering the message may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Storage(_))
    }
}

/// The committed decision for one order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Business key
    pub order_id: OrderId,
    /// Reserved or failed
    pub outcome: Outcome,
    /// Why it failed
    pub reason: Option<FailureReason>,
    /// Item from the order
    pub item: String,
    /// Quantity from the order
    pub quantity: u32,
    /// When the order was published, if known
    pub placed_at: Option<DateTime<Utc>>,
    /// When the decision was committed
    pub committed_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// The outcome event announcing this record.
    ///
    /// Re-publishing from a stored record yields the same event the first
    /// attempt would have published.
    #[must_use]
    pub fn outcome_event(&self) -> OutcomeEvent {
        OutcomeEvent {
            event_type: self.outcome.event_type(),
            order_id: self.order_id.clone(),
            item: self.item.clone(),
            qty: self.quantity,
            outcome: self.outcome,
            reason: self.reason,
            placed_at: self.placed_at,
            timestamp: self.committed_at,
        }
    }

    /// Event type of the outcome event.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.outcome.event_type()
    }
}

/// A stored record plus its publication marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    /// The immutable record
    pub record: IdempotencyRecord,
    /// Whether the outcome event has been published
    pub published: bool,
}

/// Durable record of decided orders and dead-lettered deliveries.
pub trait IdempotencyLedger: Send + Sync {
    /// Look up an order's record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] / [`LedgerError::Storage`] on
    /// storage failure.
    fn find(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LedgerEntry>, LedgerError>> + Send + '_>>;

    /// Whether the order has a recorded outcome.
    ///
    /// # Errors
    ///
    /// Propagates storage errors from [`IdempotencyLedger::find`].
    fn has_processed(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move { Ok(self.find(order_id).await?.is_some()) })
    }

    /// Insert a record unless one exists for the same order.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Conflict`] if the order was already recorded.
    fn record_outcome(
        &self,
        record: IdempotencyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>>;

    /// Set the publication marker of an order. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or [`LedgerError::Storage`] if the order has
    /// no record.
    fn mark_published(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>>;

    /// Whether the delivery at `source` has already been dead-lettered.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn is_dead_lettered(
        &self,
        source: DeliveryPosition,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>>;

    /// Remember that the delivery at `source` was dead-lettered.
    ///
    /// Returns `true` if the marker is new.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn record_dead_letter(
        &self,
        source: DeliveryPosition,
        reason: DeadLetterReason,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>>;
}

/// Available units of one item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    /// Item name
    pub item: String,
    /// Units available
    pub available: u32,
}

impl StockLevel {
    /// Create a stock level.
    #[must_use]
    pub fn new(item: impl Into<String>, available: u32) -> Self {
        Self {
            item: item.into(),
            available,
        }
    }
}

/// Input to [`InventoryStore::reserve`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationRequest {
    /// Business key
    pub order_id: OrderId,
    /// Item to reserve
    pub item: String,
    /// Units to reserve
    pub quantity: u32,
    /// When the order was published
    pub placed_at: Option<DateTime<Utc>>,
    /// Fail the reservation regardless of stock
    pub force_failure: bool,
    /// Timestamp for the record
    pub committed_at: DateTime<Utc>,
}

impl ReservationRequest {
    /// The record this request commits for a given decision.
    #[must_use]
    pub fn into_record(self, decision: StockDecision) -> IdempotencyRecord {
        let (outcome, reason) = match decision {
            StockDecision::Reserve { .. } => (Outcome::Reserved, None),
            StockDecision::Fail(reason) => (Outcome::Failed, Some(reason)),
        };
        IdempotencyRecord {
            order_id: self.order_id,
            outcome,
            reason,
            item: self.item,
            quantity: self.quantity,
            placed_at: self.placed_at,
            committed_at: self.committed_at,
        }
    }
}

/// Result of [`InventoryStore::reserve`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReservationCommit {
    /// This call decided the order; stock and ledger committed together
    Committed(IdempotencyRecord),
    /// The order was already decided; nothing changed
    Duplicate(LedgerEntry),
}

/// What the reservation rules decide for one order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StockDecision {
    /// Decrement stock to `remaining`
    Reserve {
        /// Units left after the reservation
        remaining: u32,
    },
    /// Leave stock untouched
    Fail(FailureReason),
}

/// Apply reservation rules.
///
/// Forced failure wins over everything; then an item without a stock entry is
/// unknown; then insufficient stock fails.
#[must_use]
pub fn decide_reservation(
    available: Option<u32>,
    quantity: u32,
    force_failure: bool,
) -> StockDecision {
    if force_failure {
        return StockDecision::Fail(FailureReason::ForcedFailure);
    }
    match available {
        None => StockDecision::Fail(FailureReason::UnknownItem),
        Some(units) if units < quantity => StockDecision::Fail(FailureReason::OutOfStock),
        Some(units) => StockDecision::Reserve {
            remaining: units - quantity,
        },
    }
}

/// Stock levels plus the ledger, committed together.
pub trait InventoryStore: IdempotencyLedger {
    /// Decide and commit a reservation.
    ///
    /// In one transaction: if the order has a record, return it unchanged as
    /// [`ReservationCommit::Duplicate`]. Otherwise apply
    /// [`decide_reservation`] to the current stock, decrement it on success,
    /// and insert the record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] / [`LedgerError::Storage`]; on
    /// error nothing was committed.
    fn reserve(
        &self,
        request: ReservationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ReservationCommit, LedgerError>> + Send + '_>>;

    /// Current units of `item`, `None` if the item is unknown.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn stock_level(
        &self,
        item: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u32>, LedgerError>> + Send + '_>>;

    /// Insert stock levels for items that have none yet. Existing levels are
    /// left alone so restarts do not refill stock.
    ///
    /// Returns how many items were seeded.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn seed_stock(
        &self,
        levels: Vec<StockLevel>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, LedgerError>> + Send + '_>>;
}
