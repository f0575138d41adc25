//! `PostgreSQL` persistence for boxoffice.
//!
//! This crate implements the durable collaborators of the checkout services
//! on top of sqlx:
//!
//! - [`PostgresStore`]: catalog, checkout, payment and ledger repositories
//! - [`PostgresSagaLog`]: append-only saga streams with optimistic concurrency
//! - [`PostgresReconciliationQueue`]: issues awaiting an operator
//!
//! Status transitions are conditional updates on a `version` column, and the
//! ledger's finalization (tickets, seat states, checkout status) runs in one
//! transaction.
//!
//! # Example
//!
//! ```no_run
//! use boxoffice_postgres::{PostgresSagaLog, PostgresStore, connect, migrate};
//!
//! # async fn example() -> Result<(), boxoffice_core::StoreError> {
//! let pool = connect("postgres://localhost/boxoffice", 10).await?;
//! migrate(&pool).await?;
//! let store = PostgresStore::new(pool.clone());
//! let saga = PostgresSagaLog::new(pool);
//! # let _ = (store, saga);
//! # Ok(())
//! # }
//! ```

mod catalog;
mod checkouts;
mod ledger;
mod payments;
mod reconciliation;
mod saga_log;

pub use reconciliation::PostgresReconciliationQueue;
pub use saga_log::PostgresSagaLog;

use boxoffice_core::error::StoreError;
use boxoffice_core::money::Money;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Catalog, checkout, payment and ledger repositories over one pool.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the database is unreachable.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| db_error("Failed to connect to database", &e))
}

/// Run the embedded migrations.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
    tracing::info!("Database migrations applied");
    Ok(())
}

fn db_error(context: &str, error: &sqlx::Error) -> StoreError {
    StoreError::Database(format!("{context}: {error}"))
}

fn version_conflict(entity: &'static str, id: impl ToString, expected: i64) -> StoreError {
    StoreError::VersionConflict {
        entity,
        id: id.to_string(),
        expected,
    }
}

/// Amounts are `BIGINT` columns guarded by `CHECK (>= 0)`.
fn money_to_db(amount: Money) -> Result<i64, StoreError> {
    i64::try_from(amount.minor())
        .map_err(|_| StoreError::Serialization(format!("Amount {amount} exceeds BIGINT")))
}

fn money_from_db(minor: i64) -> Result<Money, StoreError> {
    u64::try_from(minor)
        .map(Money::from_minor)
        .map_err(|_| StoreError::Serialization(format!("Negative amount in database: {minor}")))
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_outside_bigint_are_rejected() {
        assert_eq!(money_to_db(Money::from_minor(50_000)), Ok(50_000));
        assert!(money_to_db(Money::from_minor(u64::MAX)).is_err());
        assert!(money_from_db(-1).is_err());
        assert_eq!(money_from_db(7), Ok(Money::from_minor(7)));
    }

    #[test]
    fn limits_saturate() {
        assert_eq!(limit_to_db(100), 100);
        assert_eq!(limit_to_db(usize::MAX), i64::MAX);
    }
}
