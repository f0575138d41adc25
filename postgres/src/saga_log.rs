//! `PostgreSQL` saga log.
//!
//! One row per step, keyed by `(checkout_id, version)`. The primary key is
//! the concurrency check: two writers appending at the same expected version
//! race for the same key and exactly one wins.

use crate::limit_to_db;
use async_trait::async_trait;
use boxoffice_core::ids::CheckoutId;
use boxoffice_core::saga::{
    BOOKING_REQUESTED_STEP_TYPE, SagaLog, SagaLogError, SagaRecord, SagaStep, TERMINAL_STEP_TYPES,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Saga streams in the `saga_log` table.
#[derive(Clone, Debug)]
pub struct PostgresSagaLog {
    pool: PgPool,
}

impl PostgresSagaLog {
    /// Create a saga log over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_error(error: &sqlx::Error) -> SagaLogError {
    SagaLogError::Database(error.to_string())
}

fn to_db_version(version: u64) -> Result<i64, SagaLogError> {
    i64::try_from(version)
        .map_err(|_| SagaLogError::Database(format!("Saga version {version} exceeds BIGINT")))
}

fn from_db_version(version: i64) -> Result<u64, SagaLogError> {
    u64::try_from(version)
        .map_err(|_| SagaLogError::Database(format!("Negative saga version: {version}")))
}

#[async_trait]
impl SagaLog for PostgresSagaLog {
    async fn append(
        &self,
        checkout_id: CheckoutId,
        expected_version: u64,
        steps: Vec<SagaStep>,
        at: DateTime<Utc>,
    ) -> Result<u64, SagaLogError> {
        let mut tx = self.pool.begin().await.map_err(|e| db_error(&e))?;

        let (current,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM saga_log WHERE checkout_id = $1",
        )
        .bind(checkout_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error(&e))?;
        let current = from_db_version(current)?;
        if current != expected_version {
            return Err(SagaLogError::ConcurrencyConflict {
                checkout_id,
                expected: expected_version,
                actual: current,
            });
        }

        let mut version = expected_version;
        for step in &steps {
            version += 1;
            let result = sqlx::query(
                r"
                INSERT INTO saga_log (checkout_id, version, step_type, step_data, recorded_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(checkout_id.as_uuid())
            .bind(to_db_version(version)?)
            .bind(step.step_type())
            .bind(step.to_bytes()?)
            .bind(at)
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                // Another writer took this version between our read and insert.
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.is_unique_violation() {
                        return Err(SagaLogError::ConcurrencyConflict {
                            checkout_id,
                            expected: expected_version,
                            actual: version,
                        });
                    }
                }
                return Err(db_error(&e));
            }
        }

        tx.commit().await.map_err(|e| db_error(&e))?;

        tracing::debug!(
            checkout_id = %checkout_id,
            version,
            steps = steps.len(),
            "Saga steps appended"
        );
        Ok(version)
    }

    async fn load(&self, checkout_id: CheckoutId) -> Result<Vec<SagaRecord>, SagaLogError> {
        let rows = sqlx::query(
            r"
            SELECT version, step_data, recorded_at
            FROM saga_log
            WHERE checkout_id = $1
            ORDER BY version ASC
            ",
        )
        .bind(checkout_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error(&e))?;

        rows.iter()
            .map(|row| {
                let data: Vec<u8> = row.get("step_data");
                Ok(SagaRecord {
                    checkout_id,
                    version: from_db_version(row.get("version"))?,
                    step: SagaStep::from_bytes(&data)?,
                    recorded_at: row.get("recorded_at"),
                })
            })
            .collect()
    }

    async fn stalled(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CheckoutId>, SagaLogError> {
        let terminal: Vec<String> = TERMINAL_STEP_TYPES.iter().map(ToString::to_string).collect();
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r"
            SELECT checkout_id
            FROM saga_log
            GROUP BY checkout_id
            HAVING bool_or(step_type = $1)
               AND NOT bool_or(step_type = ANY($2))
               AND MAX(recorded_at) < $3
            ORDER BY MAX(recorded_at) ASC
            LIMIT $4
            ",
        )
        .bind(BOOKING_REQUESTED_STEP_TYPE)
        .bind(terminal)
        .bind(idle_since)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error(&e))?;

        Ok(rows
            .into_iter()
            .map(|(id,)| CheckoutId::from_uuid(id))
            .collect())
    }
}
