//! Payments, one per checkout.

use crate::{PostgresStore, db_error, money_from_db, money_to_db, version_conflict};
use async_trait::async_trait;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::{CheckoutId, PaymentId, SessionId, UserId};
use boxoffice_core::model::{GatewayMetadata, Payment, PaymentDraft, PaymentStatus};
use boxoffice_core::repository::PaymentRepository;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use std::collections::BTreeMap;

const PAYMENT_COLUMNS: &str = "id, checkout_id, user_id, session_id, reference, gross_minor, \
                               platform_fee_minor, organizer_amount_minor, status, verified, \
                               transaction_no, response_code, gateway_extra, failure_reason, \
                               paid_at, created_at, updated_at, version";

#[async_trait]
impl PaymentRepository for PostgresStore {
    async fn upsert_intent(&self, draft: &PaymentDraft) -> Result<Payment, StoreError> {
        // A settled payment keeps its status; anything else is pending again.
        let row = sqlx::query(&format!(
            r"
            INSERT INTO payments (
                id, checkout_id, user_id, session_id, reference,
                gross_minor, platform_fee_minor, organizer_amount_minor,
                status, verified, created_at, updated_at, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', FALSE, $9, $9, 1)
            ON CONFLICT (checkout_id) DO UPDATE SET
                gross_minor = EXCLUDED.gross_minor,
                platform_fee_minor = EXCLUDED.platform_fee_minor,
                organizer_amount_minor = EXCLUDED.organizer_amount_minor,
                status = CASE WHEN payments.status = 'success'
                              THEN payments.status ELSE 'pending' END,
                failure_reason = CASE WHEN payments.status = 'success'
                                      THEN payments.failure_reason ELSE NULL END,
                updated_at = EXCLUDED.updated_at,
                version = payments.version + 1
            RETURNING {PAYMENT_COLUMNS}
            "
        ))
        .bind(draft.id.as_uuid())
        .bind(draft.checkout_id.as_uuid())
        .bind(draft.user_id.as_uuid())
        .bind(draft.session_id.as_uuid())
        .bind(&draft.reference)
        .bind(money_to_db(draft.gross)?)
        .bind(money_to_db(draft.platform_fee)?)
        .bind(money_to_db(draft.organizer_amount)?)
        .bind(draft.at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to upsert payment intent", &e))?;

        row_to_payment(&row)
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load payment", &e))?;
        row.as_ref().map(row_to_payment).transpose()
    }

    async fn find_by_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE checkout_id = $1"
        ))
        .bind(checkout_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load payment", &e))?;
        row.as_ref().map(row_to_payment).transpose()
    }

    async fn settle(
        &self,
        id: PaymentId,
        expected_version: i64,
        gateway: &GatewayMetadata,
        paid_at: DateTime<Utc>,
    ) -> Result<Payment, StoreError> {
        let row = sqlx::query(&format!(
            r"
            UPDATE payments
            SET status = 'success', verified = TRUE,
                transaction_no = $1, response_code = $2, gateway_extra = $3,
                failure_reason = NULL, paid_at = $4, updated_at = $4,
                version = version + 1
            WHERE id = $5 AND version = $6
            RETURNING {PAYMENT_COLUMNS}
            "
        ))
        .bind(&gateway.transaction_no)
        .bind(&gateway.response_code)
        .bind(Json(&gateway.extra))
        .bind(paid_at)
        .bind(id.as_uuid())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to settle payment", &e))?;

        let payment = row
            .as_ref()
            .map(row_to_payment)
            .transpose()?
            .ok_or_else(|| version_conflict("payment", id, expected_version))?;
        tracing::info!(
            payment_id = %id,
            checkout_id = %payment.checkout_id,
            gross = payment.gross.minor(),
            "Payment settled"
        );
        Ok(payment)
    }

    async fn mark_failed(
        &self,
        id: PaymentId,
        expected_version: i64,
        reason: &str,
        gateway: Option<&GatewayMetadata>,
        at: DateTime<Utc>,
    ) -> Result<Payment, StoreError> {
        // Without gateway details the stored ones are kept. A settled payment
        // matches no row and surfaces as a version conflict.
        let row = sqlx::query(&format!(
            r"
            UPDATE payments
            SET status = 'failed', failure_reason = $1,
                transaction_no = CASE WHEN $2 THEN $3 ELSE transaction_no END,
                response_code = CASE WHEN $2 THEN $4 ELSE response_code END,
                gateway_extra = CASE WHEN $2 THEN $5 ELSE gateway_extra END,
                updated_at = $6, version = version + 1
            WHERE id = $7 AND version = $8 AND status <> 'success'
            RETURNING {PAYMENT_COLUMNS}
            "
        ))
        .bind(reason)
        .bind(gateway.is_some())
        .bind(gateway.and_then(|g| g.transaction_no.clone()))
        .bind(gateway.and_then(|g| g.response_code.clone()))
        .bind(Json(gateway.map(|g| g.extra.clone()).unwrap_or_default()))
        .bind(at)
        .bind(id.as_uuid())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to mark payment failed", &e))?;

        row.as_ref()
            .map(row_to_payment)
            .transpose()?
            .ok_or_else(|| version_conflict("payment", id, expected_version))
    }
}

fn row_to_payment(row: &PgRow) -> Result<Payment, StoreError> {
    let status: String = row.get("status");
    let Json(extra): Json<BTreeMap<String, String>> = row
        .try_get("gateway_extra")
        .map_err(|e| StoreError::Serialization(format!("Invalid gateway metadata: {e}")))?;

    Ok(Payment {
        id: PaymentId::from_uuid(row.get("id")),
        checkout_id: CheckoutId::from_uuid(row.get("checkout_id")),
        user_id: UserId::from_uuid(row.get("user_id")),
        session_id: SessionId::from_uuid(row.get("session_id")),
        reference: row.get("reference"),
        gross: money_from_db(row.get("gross_minor"))?,
        platform_fee: money_from_db(row.get("platform_fee_minor"))?,
        organizer_amount: money_from_db(row.get("organizer_amount_minor"))?,
        status: PaymentStatus::parse(&status)?,
        verified: row.get("verified"),
        gateway: GatewayMetadata {
            transaction_no: row.get("transaction_no"),
            response_code: row.get("response_code"),
            extra,
        },
        failure_reason: row.get("failure_reason"),
        paid_at: row.get("paid_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        version: row.get("version"),
    })
}
