//! Read access to sessions, seats and ticket classes.

use crate::{PostgresStore, db_error, money_from_db};
use async_trait::async_trait;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::{SeatLabel, SessionId, TicketClassId};
use boxoffice_core::model::{Seat, SellableSession, TicketClass};
use boxoffice_core::repository::CatalogRepository;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

#[async_trait]
impl CatalogRepository for PostgresStore {
    async fn find_session(&self, id: SessionId) -> Result<Option<SellableSession>, StoreError> {
        let row = sqlx::query("SELECT id, name, chart_key FROM sessions WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load session", &e))?;

        Ok(row.map(|row| SellableSession {
            id: SessionId::from_uuid(row.get("id")),
            name: row.get("name"),
            chart_key: row.get("chart_key"),
        }))
    }

    async fn find_seats(
        &self,
        session_id: SessionId,
        labels: &[SeatLabel],
    ) -> Result<Vec<Seat>, StoreError> {
        let labels: Vec<String> = labels.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(
            r"
            SELECT label, category
            FROM seats
            WHERE session_id = $1 AND label = ANY($2)
            ",
        )
        .bind(session_id.as_uuid())
        .bind(labels)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load seats", &e))?;

        Ok(rows
            .iter()
            .map(|row| Seat {
                session_id,
                label: SeatLabel::new(row.get::<String, _>("label")),
                category: row.get("category"),
            })
            .collect())
    }

    async fn ticket_classes(&self, session_id: SessionId) -> Result<Vec<TicketClass>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, session_id, name, category, price_minor, sort_order
            FROM ticket_classes
            WHERE session_id = $1
            ORDER BY sort_order ASC, name ASC
            ",
        )
        .bind(session_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load ticket classes", &e))?;

        rows.iter().map(row_to_ticket_class).collect()
    }
}

fn row_to_ticket_class(row: &PgRow) -> Result<TicketClass, StoreError> {
    Ok(TicketClass {
        id: TicketClassId::from_uuid(row.get::<Uuid, _>("id")),
        session_id: SessionId::from_uuid(row.get("session_id")),
        name: row.get("name"),
        category: row.get("category"),
        price: money_from_db(row.get("price_minor"))?,
        sort_order: row.get("sort_order"),
    })
}
