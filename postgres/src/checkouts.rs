//! The checkout ledger.

use crate::{PostgresStore, db_error, limit_to_db, version_conflict};
use async_trait::async_trait;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::{CheckoutId, SeatLabel, SessionId, UserId};
use boxoffice_core::model::{Checkout, CheckoutStatus, HoldToken};
use boxoffice_core::repository::CheckoutRepository;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;

const CHECKOUT_COLUMNS: &str = "id, user_id, session_id, chart_key, status, seats, hold_token, \
                                hold_expires_at, payment_deadline, created_at, updated_at, \
                                version";

#[async_trait]
impl CheckoutRepository for PostgresStore {
    async fn insert(&self, checkout: &Checkout) -> Result<(), StoreError> {
        let seats: Vec<String> = checkout.seats.iter().map(ToString::to_string).collect();
        sqlx::query(
            r"
            INSERT INTO checkouts (
                id, user_id, session_id, chart_key, status, seats,
                hold_token, hold_expires_at, payment_deadline, created_at, updated_at,
                version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(checkout.id.as_uuid())
        .bind(checkout.user_id.as_uuid())
        .bind(checkout.session_id.as_uuid())
        .bind(&checkout.chart_key)
        .bind(checkout.status.as_str())
        .bind(seats)
        .bind(checkout.hold.as_ref().map(|hold| hold.token.clone()))
        .bind(checkout.hold.as_ref().map(|hold| hold.expires_at))
        .bind(checkout.payment_deadline)
        .bind(checkout.created_at)
        .bind(checkout.updated_at)
        .bind(checkout.version)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert checkout", &e))?;
        Ok(())
    }

    async fn find(&self, id: CheckoutId) -> Result<Option<Checkout>, StoreError> {
        let row = sqlx::query(&format!("SELECT {CHECKOUT_COLUMNS} FROM checkouts WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load checkout", &e))?;
        row.as_ref().map(row_to_checkout).transpose()
    }

    async fn attach_hold(
        &self,
        id: CheckoutId,
        hold: &HoldToken,
        expected_version: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let version: Option<(i64,)> = sqlx::query_as(
            r"
            UPDATE checkouts
            SET hold_token = $1, hold_expires_at = $2, updated_at = $3, version = version + 1
            WHERE id = $4 AND status = 'init' AND version = $5
            RETURNING version
            ",
        )
        .bind(&hold.token)
        .bind(hold.expires_at)
        .bind(at)
        .bind(id.as_uuid())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to attach hold", &e))?;

        version
            .map(|(version,)| version)
            .ok_or_else(|| version_conflict("checkout", id, expected_version))
    }

    async fn transition(
        &self,
        id: CheckoutId,
        from: CheckoutStatus,
        to: CheckoutStatus,
        expected_version: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let version: Option<(i64,)> = sqlx::query_as(
            r"
            UPDATE checkouts
            SET status = $1, updated_at = $2, version = version + 1
            WHERE id = $3 AND status = $4 AND version = $5
            RETURNING version
            ",
        )
        .bind(to.as_str())
        .bind(at)
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update checkout status", &e))?;

        match version {
            Some((version,)) => {
                tracing::debug!(
                    checkout_id = %id,
                    from = %from,
                    to = %to,
                    version,
                    "Checkout transitioned"
                );
                Ok(version)
            },
            None => Err(version_conflict("checkout", id, expected_version)),
        }
    }

    async fn extend_payment_deadline(
        &self,
        id: CheckoutId,
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE checkouts
            SET payment_deadline = GREATEST(COALESCE(payment_deadline, $1), $1),
                updated_at = $2
            WHERE id = $3 AND status = 'init'
            ",
        )
        .bind(deadline)
        .bind(at)
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to extend payment deadline", &e))?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT version FROM checkouts WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load checkout", &e))?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                entity: "checkout",
                id: id.to_string(),
            }),
        }
    }

    async fn list_abandoned(
        &self,
        now: DateTime<Utc>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Checkout>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {CHECKOUT_COLUMNS}
            FROM checkouts
            WHERE status = 'init'
              AND ((hold_expires_at IS NOT NULL AND hold_expires_at < $1)
                OR (hold_expires_at IS NULL AND created_at < $2))
              AND (payment_deadline IS NULL OR payment_deadline < $1)
            ORDER BY created_at ASC
            LIMIT $3
            "
        ))
        .bind(now)
        .bind(created_before)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list abandoned checkouts", &e))?;

        rows.iter().map(row_to_checkout).collect()
    }
}

fn row_to_checkout(row: &PgRow) -> Result<Checkout, StoreError> {
    let status: String = row.get("status");
    let seats: Vec<String> = row.get("seats");
    let hold_token: Option<String> = row.get("hold_token");
    let hold_expires_at: Option<DateTime<Utc>> = row.get("hold_expires_at");

    Ok(Checkout {
        id: CheckoutId::from_uuid(row.get("id")),
        user_id: UserId::from_uuid(row.get("user_id")),
        session_id: SessionId::from_uuid(row.get("session_id")),
        chart_key: row.get("chart_key"),
        status: CheckoutStatus::parse(&status)?,
        seats: seats.into_iter().map(SeatLabel::new).collect(),
        hold: hold_token
            .zip(hold_expires_at)
            .map(|(token, expires_at)| HoldToken { token, expires_at }),
        payment_deadline: row.get("payment_deadline"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        version: row.get("version"),
    })
}
