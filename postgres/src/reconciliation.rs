//! Reconciliation queue for checkouts that need an operator.
//!
//! Provides persistent storage of issues the checkout services could not
//! repair themselves. Raising an issue that is already open for the same
//! checkout bumps its occurrence count instead of adding a row, so a failing
//! sweep does not flood the queue.

use crate::{db_error, limit_to_db};
use async_trait::async_trait;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::{CheckoutId, PaymentId};
use boxoffice_core::reconciliation::{
    IssueKind, IssueStatus, NewIssue, ReconciliationIssue, ReconciliationQueue,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const ISSUE_COLUMNS: &str = "id, checkout_id, payment_id, kind, detail, occurrences, status, \
                             raised_at, last_raised_at, resolved_at, resolved_by, \
                             resolution_notes";

/// `PostgreSQL`-based reconciliation queue.
///
/// # Example
///
/// ```no_run
/// use boxoffice_core::reconciliation::ReconciliationQueue;
/// use boxoffice_postgres::PostgresReconciliationQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), boxoffice_core::StoreError> {
/// let queue = PostgresReconciliationQueue::new(pool);
///
/// for issue in queue.list_open(100).await? {
///     println!("{} {:?} x{}", issue.checkout_id, issue.kind, issue.occurrences);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresReconciliationQueue {
    pool: PgPool,
}

impl PostgresReconciliationQueue {
    /// Create a queue over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of open issues. Useful for monitoring and health checks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count_open(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM reconciliation_issues WHERE status = 'open'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("Failed to count open issues", &e))?;
        Ok(count)
    }

    fn row_to_issue(row: &PgRow) -> Result<ReconciliationIssue, StoreError> {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        let payment_id: Option<Uuid> = row.get("payment_id");

        Ok(ReconciliationIssue {
            id: row.get("id"),
            checkout_id: CheckoutId::from_uuid(row.get("checkout_id")),
            payment_id: payment_id.map(PaymentId::from_uuid),
            kind: IssueKind::parse(&kind)?,
            detail: row.get("detail"),
            occurrences: row.get("occurrences"),
            status: IssueStatus::parse(&status)?,
            raised_at: row.get("raised_at"),
            last_raised_at: row.get("last_raised_at"),
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

#[async_trait]
impl ReconciliationQueue for PostgresReconciliationQueue {
    async fn raise(&self, issue: &NewIssue) -> Result<i64, StoreError> {
        let (id, occurrences): (i64, i32) = sqlx::query_as(
            r"
            INSERT INTO reconciliation_issues (
                checkout_id, payment_id, kind, detail, raised_at, last_raised_at
            ) VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (checkout_id, kind) WHERE status = 'open' DO UPDATE SET
                occurrences = reconciliation_issues.occurrences + 1,
                detail = EXCLUDED.detail,
                payment_id = COALESCE(EXCLUDED.payment_id, reconciliation_issues.payment_id),
                last_raised_at = EXCLUDED.last_raised_at
            RETURNING id, occurrences
            ",
        )
        .bind(issue.checkout_id.as_uuid())
        .bind(issue.payment_id.map(|id| *id.as_uuid()))
        .bind(issue.kind.as_str())
        .bind(&issue.detail)
        .bind(issue.at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to raise reconciliation issue", &e))?;

        tracing::debug!(
            issue_id = id,
            checkout_id = %issue.checkout_id,
            kind = issue.kind.as_str(),
            occurrences,
            detail = %issue.detail,
            "Reconciliation issue raised"
        );

        Ok(id)
    }

    async fn list_open(&self, limit: usize) -> Result<Vec<ReconciliationIssue>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {ISSUE_COLUMNS}
            FROM reconciliation_issues
            WHERE status = 'open'
            ORDER BY raised_at ASC
            LIMIT $1
            "
        ))
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list open issues", &e))?;

        rows.iter().map(Self::row_to_issue).collect()
    }

    async fn list_for_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Vec<ReconciliationIssue>, StoreError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {ISSUE_COLUMNS}
            FROM reconciliation_issues
            WHERE checkout_id = $1
            ORDER BY raised_at ASC, id ASC
            "
        ))
        .bind(checkout_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list checkout issues", &e))?;

        rows.iter().map(Self::row_to_issue).collect()
    }

    async fn close(
        &self,
        id: i64,
        status: IssueStatus,
        resolved_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE reconciliation_issues
            SET status = $1,
                resolved_at = $2,
                resolved_by = $3,
                resolution_notes = $4
            WHERE id = $5 AND status = 'open'
            ",
        )
        .bind(status.as_str())
        .bind(at)
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to close reconciliation issue", &e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "reconciliation issue",
                id: id.to_string(),
            });
        }

        tracing::info!(
            issue_id = id,
            status = status.as_str(),
            resolved_by,
            "Reconciliation issue closed"
        );
        metrics::counter!(
            "boxoffice_reconciliation_issues_closed_total",
            "status" => status.as_str()
        )
        .increment(1);

        Ok(())
    }
}
