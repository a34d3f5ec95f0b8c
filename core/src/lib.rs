//! # Fulfillment Core
//!
//! Core types and traits for the event-driven order-fulfillment services.
//!
//! This crate holds everything the consumers agree on and nothing that does
//! I/O: the wire envelope and its validator, the broker seams, the idempotency
//! ledger contract, dead-letter records and projection snapshots.
//!
//! ## Core Concepts
//!
//! - **Envelope**: a validated `OrderPlaced` / `InventoryReserved` / `InventoryFailed` message
//! - **Event bus**: at-least-once publish/subscribe with consumer groups
//! - **Ledger**: durable "already decided" set keyed by `order_id`
//! - **Dead letter**: a poison message isolated with its reason
//! - **Snapshot**: projection state plus the log positions it covers
//!
//! ## Message Flow
//!
//! ```text
//! order intake ──► order.placed ──► inventory consumer ──► inventory.reserved ─┐
//!                                        │            └──► inventory.failed ───┤
//!                                        └──► order.placed.dlq                 ▼
//!                                                                  analytics consumer
//! ```
//!
//! ## Example
//!
//! ```
//! use fulfillment_core::envelope::{validate, EventType};
//! use fulfillment_core::ledger::{decide_reservation, StockDecision};
//!
//! let envelope = validate(br#"{"order_id":"o1","item":"burger","qty":2,"student_id":"s123"}"#)?;
//! assert_eq!(envelope.event_type, EventType::OrderPlaced);
//!
//! let decision = decide_reservation(Some(100), envelope.payload.quantity, false);
//! assert_eq!(decision, StockDecision::Reserve { remaining: 98 });
//! # Ok::<(), fulfillment_core::envelope::ValidationError>(())
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod dead_letter;
pub mod envelope;
pub mod event_bus;
pub mod ledger;
pub mod projection;

/// Environment module - Dependency injection traits
///
/// External dependencies that make behavior non-deterministic are abstracted
/// behind traits so tests can pin them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use fulfillment_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = chrono::Utc::now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
