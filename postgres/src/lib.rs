//! `PostgreSQL` storage for order fulfillment.
//!
//! Provides [`PostgresInventoryStore`], the durable implementation of the
//! idempotency ledger and inventory store traits from `fulfillment-core`:
//!
//! - Stock levels per item, seeded once and decremented by reservations
//! - Idempotency ledger: one immutable record per decided `order_id`, plus the
//!   publication marker
//! - Dead-letter markers keyed by source topic, partition and offset
//!
//! A reservation locks the item's stock row, checks the ledger, inserts the
//! record and decrements stock in a single transaction. Two deliveries of the
//! same order can never both reserve.
//!
//! # Example
//!
//! ```ignore
//! use fulfillment_postgres::PostgresInventoryStore;
//!
//! let store = PostgresInventoryStore::connect(&database_url, 10).await?;
//! store.migrate().await?;
//! store.seed_stock(vec![StockLevel::new("burger", 100)]).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod inventory_store;

pub use inventory_store::PostgresInventoryStore;
