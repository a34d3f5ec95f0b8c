//! `PostgreSQL` inventory store and idempotency ledger.

use chrono::{DateTime, Utc};
use fulfillment_core::dead_letter::DeadLetterReason;
use fulfillment_core::envelope::{FailureReason, OrderId, Outcome};
use fulfillment_core::event_bus::DeliveryPosition;
use fulfillment_core::ledger::{
    decide_reservation, IdempotencyLedger, IdempotencyRecord, InventoryStore, LedgerEntry,
    LedgerError, ReservationCommit, ReservationRequest, StockDecision, StockLevel,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const LEDGER_COLUMNS: &str =
    "order_id, outcome, reason, item, quantity, placed_at, committed_at, published_at";

/// `PostgreSQL`-backed [`InventoryStore`].
///
/// Stock and the idempotency ledger live in the same database, so a
/// reservation commits the ledger row and the stock decrement in one
/// transaction.
///
/// # Example
///
/// ```no_run
/// use fulfillment_postgres::PostgresInventoryStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresInventoryStore::connect("postgres://localhost/fulfillment", 10).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresInventoryStore {
    pool: PgPool,
}

impl PostgresInventoryStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a bounded pool.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if no connection can be made.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| LedgerError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Create the stock, ledger and dead-letter marker tables.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_in(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &OrderId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM idempotency_ledger WHERE order_id = $1"
        ))
        .bind(order_id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn reserve_in_tx(
        &self,
        request: ReservationRequest,
    ) -> Result<ReservationCommit, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // Serializes reservations of the same item, and of the same order
        // when it is redelivered concurrently.
        let available: Option<i64> =
            sqlx::query_scalar("SELECT available FROM inventory_stock WHERE item = $1 FOR UPDATE")
                .bind(&request.item)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

        if let Some(entry) = Self::find_in(&mut tx, &request.order_id).await? {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(ReservationCommit::Duplicate(entry));
        }

        let available = available
            .map(|units| units_from_column(units, &request.item))
            .transpose()?;
        let decision = decide_reservation(available, request.quantity, request.force_failure);
        let record = request.into_record(decision);

        let inserted = sqlx::query(
            r"
            INSERT INTO idempotency_ledger (
                order_id, outcome, reason, item, quantity, placed_at, committed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id) DO NOTHING
            ",
        )
        .bind(record.order_id.as_str())
        .bind(record.outcome.as_str())
        .bind(record.reason.map(|r| r.as_str()))
        .bind(&record.item)
        .bind(i64::from(record.quantity))
        .bind(record.placed_at)
        .bind(record.committed_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

        if inserted == 0 {
            // Lost a race for an unknown item, which has no stock row to lock.
            let existing = Self::find_in(&mut tx, &record.order_id).await?;
            tx.rollback().await.map_err(map_sqlx_error)?;
            return existing
                .map(ReservationCommit::Duplicate)
                .ok_or_else(|| LedgerError::Conflict(record.order_id.clone()));
        }

        if let StockDecision::Reserve { remaining } = decision {
            sqlx::query(
                "UPDATE inventory_stock SET available = $2, updated_at = now() WHERE item = $1",
            )
            .bind(&record.item)
            .bind(i64::from(remaining))
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        metrics::counter!("inventory_store.reservations", "outcome" => record.outcome.as_str())
            .increment(1);
        tracing::debug!(
            order_id = %record.order_id,
            item = %record.item,
            outcome = record.outcome.as_str(),
            "Reservation committed"
        );
        Ok(ReservationCommit::Committed(record))
    }
}

impl IdempotencyLedger for PostgresInventoryStore {
    fn find(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LedgerEntry>, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!(
                "SELECT {LEDGER_COLUMNS} FROM idempotency_ledger WHERE order_id = $1"
            ))
            .bind(order_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            row.as_ref().map(entry_from_row).transpose()
        })
    }

    fn record_outcome(
        &self,
        record: IdempotencyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let inserted = sqlx::query(
                r"
                INSERT INTO idempotency_ledger (
                    order_id, outcome, reason, item, quantity, placed_at, committed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (order_id) DO NOTHING
                ",
            )
            .bind(record.order_id.as_str())
            .bind(record.outcome.as_str())
            .bind(record.reason.map(|r| r.as_str()))
            .bind(&record.item)
            .bind(i64::from(record.quantity))
            .bind(record.placed_at)
            .bind(record.committed_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();

            if inserted == 0 {
                return Err(LedgerError::Conflict(record.order_id));
            }
            Ok(())
        })
    }

    fn mark_published(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<(), LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE idempotency_ledger
                SET published_at = COALESCE(published_at, now())
                WHERE order_id = $1
                ",
            )
            .bind(order_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();

            if updated == 0 {
                return Err(LedgerError::Storage(format!("no record for order '{order_id}'")));
            }
            Ok(())
        })
    }

    fn is_dead_lettered(
        &self,
        source: DeliveryPosition,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query_scalar(
                r#"SELECT EXISTS (
                    SELECT 1 FROM dead_letter_markers
                    WHERE topic = $1 AND partition = $2 AND "offset" = $3
                )"#,
            )
            .bind(&source.topic)
            .bind(source.partition)
            .bind(source.offset)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
        })
    }

    fn record_dead_letter(
        &self,
        source: DeliveryPosition,
        reason: DeadLetterReason,
    ) -> Pin<Box<dyn Future<Output = Result<bool, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let inserted = sqlx::query(
                r#"
                INSERT INTO dead_letter_markers (topic, partition, "offset", reason)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&source.topic)
            .bind(source.partition)
            .bind(source.offset)
            .bind(reason.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
            Ok(inserted == 1)
        })
    }
}

impl InventoryStore for PostgresInventoryStore {
    fn reserve(
        &self,
        request: ReservationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ReservationCommit, LedgerError>> + Send + '_>> {
        Box::pin(self.reserve_in_tx(request))
    }

    fn stock_level(
        &self,
        item: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u32>, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let available: Option<i64> =
                sqlx::query_scalar("SELECT available FROM inventory_stock WHERE item = $1")
                    .bind(&item)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;
            available.map(|units| units_from_column(units, &item)).transpose()
        })
    }

    fn seed_stock(
        &self,
        levels: Vec<StockLevel>,
    ) -> Pin<Box<dyn Future<Output = Result<usize, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let mut seeded = 0;
            for level in levels {
                let inserted = sqlx::query(
                    r"
                    INSERT INTO inventory_stock (item, available) VALUES ($1, $2)
                    ON CONFLICT (item) DO NOTHING
                    ",
                )
                .bind(&level.item)
                .bind(i64::from(level.available))
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected();
                if inserted == 1 {
                    seeded += 1;
                }
            }
            tracing::info!(seeded, "Inventory stock seeded");
            Ok(seeded)
        })
    }
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, LedgerError> {
    let outcome: String = row.try_get("outcome").map_err(map_sqlx_error)?;
    let reason: Option<String> = row.try_get("reason").map_err(map_sqlx_error)?;
    let quantity: i64 = row.try_get("quantity").map_err(map_sqlx_error)?;
    let published_at: Option<DateTime<Utc>> = row.try_get("published_at").map_err(map_sqlx_error)?;

    let record = IdempotencyRecord {
        order_id: OrderId::new(row.try_get::<String, _>("order_id").map_err(map_sqlx_error)?),
        outcome: Outcome::parse(&outcome)
            .ok_or_else(|| LedgerError::Storage(format!("Invalid outcome: {outcome}")))?,
        reason: reason
            .map(|r| {
                FailureReason::parse(&r)
                    .ok_or_else(|| LedgerError::Storage(format!("Invalid reason: {r}")))
            })
            .transpose()?,
        item: row.try_get("item").map_err(map_sqlx_error)?,
        quantity: units_from_column(quantity, "quantity")?,
        placed_at: row.try_get("placed_at").map_err(map_sqlx_error)?,
        committed_at: row.try_get("committed_at").map_err(map_sqlx_error)?,
    };
    Ok(LedgerEntry {
        record,
        published: published_at.is_some(),
    })
}

/// Unit columns are `BIGINT` so every `u32` quantity round-trips.
fn units_from_column(value: i64, what: &str) -> Result<u32, LedgerError> {
    u32::try_from(value)
        .map_err(|_| LedgerError::Storage(format!("invalid units {value} for '{what}'")))
}

/// Connection-level failures may heal on redelivery; everything else is a
/// storage error.
fn map_sqlx_error(error: sqlx::Error) -> LedgerError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            LedgerError::Unavailable(error.to_string())
        },
        other => LedgerError::Storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_are_unavailable() {
        assert!(matches!(map_sqlx_error(sqlx::Error::PoolTimedOut), LedgerError::Unavailable(_)));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            LedgerError::Storage(_)
        ));
    }

    #[test]
    fn full_u32_range_round_trips() {
        let max = tokio_test::assert_ok!(units_from_column(i64::from(u32::MAX), "quantity"));
        assert_eq!(max, u32::MAX);
        let large = tokio_test::assert_ok!(units_from_column(3_000_000_000, "quantity"));
        assert_eq!(large, 3_000_000_000);
        tokio_test::assert_err!(units_from_column(-1, "burger"));
        tokio_test::assert_err!(units_from_column(i64::from(u32::MAX) + 1, "burger"));
    }
}
