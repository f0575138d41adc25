//! Tickets, seat states and payouts.

use crate::{PostgresStore, db_error, money_from_db, money_to_db, version_conflict};
use async_trait::async_trait;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::{CheckoutId, SeatLabel, SessionId, TicketClassId, TicketId, UserId};
use boxoffice_core::model::{
    CheckoutStatus, Finalization, FinalizeOutcome, Payout, PayoutAccrual, SeatState, SeatStatus,
    Ticket,
};
use boxoffice_core::repository::LedgerRepository;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

#[async_trait]
impl LedgerRepository for PostgresStore {
    async fn finalize(&self, finalization: &Finalization) -> Result<FinalizeOutcome, StoreError> {
        let checkout_id = finalization.checkout_id;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to start transaction", &e))?;

        // Lock the checkout row so a concurrent cancel or finalize waits for us.
        let current: Option<(String, i64)> =
            sqlx::query_as("SELECT status, version FROM checkouts WHERE id = $1 FOR UPDATE")
                .bind(checkout_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to lock checkout", &e))?;
        let Some((status, version)) = current else {
            return Err(StoreError::NotFound {
                entity: "checkout",
                id: checkout_id.to_string(),
            });
        };
        let status = CheckoutStatus::parse(&status)?;
        let at_expected =
            status == CheckoutStatus::Init && version == finalization.expected_version;
        if !at_expected && status != finalization.target {
            // Dropping the transaction rolls it back.
            return Err(version_conflict(
                "checkout",
                checkout_id,
                finalization.expected_version,
            ));
        }

        let mut outcome = FinalizeOutcome::default();
        for ticket in &finalization.tickets {
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r"
                INSERT INTO tickets (
                    id, checkout_id, session_id, user_id, seat,
                    ticket_class_id, price_minor, issued_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (session_id, seat) DO NOTHING
                RETURNING id
                ",
            )
            .bind(ticket.id.as_uuid())
            .bind(ticket.checkout_id.as_uuid())
            .bind(ticket.session_id.as_uuid())
            .bind(ticket.user_id.as_uuid())
            .bind(ticket.seat.as_str())
            .bind(ticket.ticket_class_id.as_uuid())
            .bind(money_to_db(ticket.price)?)
            .bind(ticket.issued_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to insert ticket", &e))?;

            if inserted.is_some() {
                outcome.issued.push(ticket.clone());
                continue;
            }
            let existing = sqlx::query(
                r"
                SELECT id, checkout_id, session_id, user_id, seat, ticket_class_id,
                       price_minor, issued_at
                FROM tickets
                WHERE session_id = $1 AND seat = $2
                ",
            )
            .bind(ticket.session_id.as_uuid())
            .bind(ticket.seat.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to load existing ticket", &e))?;
            outcome.existing.push(row_to_ticket(&existing)?);
        }

        for ticket in outcome.issued.iter().chain(&outcome.existing) {
            sqlx::query(
                r"
                INSERT INTO seat_states (session_id, seat, status, ticket_id, updated_at)
                VALUES ($1, $2, 'paid', $3, $4)
                ON CONFLICT (session_id, seat) DO UPDATE SET
                    status = 'paid',
                    ticket_id = EXCLUDED.ticket_id,
                    updated_at = EXCLUDED.updated_at
                WHERE seat_states.status <> 'paid'
                ",
            )
            .bind(finalization.session_id.as_uuid())
            .bind(ticket.seat.as_str())
            .bind(ticket.id.as_uuid())
            .bind(finalization.at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to update seat state", &e))?;
        }

        outcome.checkout_version = if at_expected {
            let (version,): (i64,) = sqlx::query_as(
                r"
                UPDATE checkouts
                SET status = $1, updated_at = $2, version = version + 1
                WHERE id = $3
                RETURNING version
                ",
            )
            .bind(finalization.target.as_str())
            .bind(finalization.at)
            .bind(checkout_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to finalize checkout", &e))?;
            version
        } else {
            version
        };

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit finalization", &e))?;

        tracing::debug!(
            checkout_id = %checkout_id,
            issued = outcome.issued.len(),
            existing = outcome.existing.len(),
            status = %finalization.target,
            "Finalization committed"
        );
        Ok(outcome)
    }

    async fn accrue_payout(&self, accrual: &PayoutAccrual) -> Result<bool, StoreError> {
        let gross = money_to_db(accrual.gross)?;
        let platform_fee = money_to_db(accrual.platform_fee)?;
        let organizer_amount = money_to_db(accrual.organizer_amount)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to start transaction", &e))?;

        let recorded = sqlx::query(
            r"
            INSERT INTO payout_accruals (
                payment_id, session_id, gross_minor, platform_fee_minor,
                organizer_amount_minor, accrued_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (payment_id) DO NOTHING
            ",
        )
        .bind(accrual.payment_id.as_uuid())
        .bind(accrual.session_id.as_uuid())
        .bind(gross)
        .bind(platform_fee)
        .bind(organizer_amount)
        .bind(accrual.at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to record payout accrual", &e))?;
        if recorded.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r"
            INSERT INTO payouts (
                session_id, gross_minor, platform_fee_minor, organizer_amount_minor,
                payments, updated_at
            ) VALUES ($1, $2, $3, $4, 1, $5)
            ON CONFLICT (session_id) DO UPDATE SET
                gross_minor = payouts.gross_minor + EXCLUDED.gross_minor,
                platform_fee_minor = payouts.platform_fee_minor + EXCLUDED.platform_fee_minor,
                organizer_amount_minor =
                    payouts.organizer_amount_minor + EXCLUDED.organizer_amount_minor,
                payments = payouts.payments + 1,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(accrual.session_id.as_uuid())
        .bind(gross)
        .bind(platform_fee)
        .bind(organizer_amount)
        .bind(accrual.at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to accrue payout", &e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit payout accrual", &e))?;
        Ok(true)
    }

    async fn seat_state(
        &self,
        session_id: SessionId,
        seat: &SeatLabel,
    ) -> Result<Option<SeatState>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT session_id, seat, status, ticket_id, updated_at
            FROM seat_states
            WHERE session_id = $1 AND seat = $2
            ",
        )
        .bind(session_id.as_uuid())
        .bind(seat.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load seat state", &e))?;
        row.as_ref().map(row_to_seat_state).transpose()
    }

    async fn seat_states(&self, session_id: SessionId) -> Result<Vec<SeatState>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT session_id, seat, status, ticket_id, updated_at
            FROM seat_states
            WHERE session_id = $1
            ORDER BY seat ASC
            ",
        )
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load seat states", &e))?;
        rows.iter().map(row_to_seat_state).collect()
    }

    async fn tickets_for_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Vec<Ticket>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, checkout_id, session_id, user_id, seat, ticket_class_id,
                   price_minor, issued_at
            FROM tickets
            WHERE checkout_id = $1
            ORDER BY seat ASC
            ",
        )
        .bind(checkout_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load tickets", &e))?;
        rows.iter().map(row_to_ticket).collect()
    }

    async fn payout(&self, session_id: SessionId) -> Result<Option<Payout>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT session_id, gross_minor, platform_fee_minor, organizer_amount_minor,
                   payments, updated_at
            FROM payouts
            WHERE session_id = $1
            ",
        )
        .bind(session_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load payout", &e))?;

        row.map(|row| {
            let payments: i64 = row.get("payments");
            Ok(Payout {
                session_id,
                gross: money_from_db(row.get("gross_minor"))?,
                platform_fee: money_from_db(row.get("platform_fee_minor"))?,
                organizer_amount: money_from_db(row.get("organizer_amount_minor"))?,
                payments: u64::try_from(payments).map_err(|_| {
                    StoreError::Serialization(format!("Negative payout count: {payments}"))
                })?,
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }
}

fn row_to_seat_state(row: &PgRow) -> Result<SeatState, StoreError> {
    let status: String = row.get("status");
    let ticket_id: Option<Uuid> = row.get("ticket_id");
    Ok(SeatState {
        session_id: SessionId::from_uuid(row.get("session_id")),
        seat: SeatLabel::new(row.get::<String, _>("seat")),
        status: SeatStatus::parse(&status)?,
        ticket_id: ticket_id.map(TicketId::from_uuid),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_ticket(row: &PgRow) -> Result<Ticket, StoreError> {
    Ok(Ticket {
        id: TicketId::from_uuid(row.get("id")),
        checkout_id: CheckoutId::from_uuid(row.get("checkout_id")),
        session_id: SessionId::from_uuid(row.get("session_id")),
        user_id: UserId::from_uuid(row.get("user_id")),
        seat: SeatLabel::new(row.get::<String, _>("seat")),
        ticket_class_id: TicketClassId::from_uuid(row.get("ticket_class_id")),
        price: money_from_db(row.get("price_minor"))?,
        issued_at: row.get("issued_at"),
    })
}
