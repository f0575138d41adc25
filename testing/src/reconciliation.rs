//! In-memory reconciliation queue.

use crate::lock;
use async_trait::async_trait;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::CheckoutId;
use boxoffice_core::reconciliation::{
    IssueStatus, NewIssue, ReconciliationIssue, ReconciliationQueue,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Issues kept in a `Vec`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReconciliationQueue {
    issues: Arc<Mutex<Vec<ReconciliationIssue>>>,
}

impl InMemoryReconciliationQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every issue ever raised (for assertions).
    #[must_use]
    pub fn all(&self) -> Vec<ReconciliationIssue> {
        lock(&self.issues).clone()
    }
}

#[async_trait]
impl ReconciliationQueue for InMemoryReconciliationQueue {
    async fn raise(&self, issue: &NewIssue) -> Result<i64, StoreError> {
        let mut issues = lock(&self.issues);
        if let Some(open) = issues.iter_mut().find(|existing| {
            existing.status == IssueStatus::Open
                && existing.checkout_id == issue.checkout_id
                && existing.kind == issue.kind
        }) {
            open.occurrences += 1;
            open.detail.clone_from(&issue.detail);
            open.last_raised_at = issue.at;
            return Ok(open.id);
        }

        let id = i64::try_from(issues.len()).unwrap_or(i64::MAX - 1) + 1;
        issues.push(ReconciliationIssue {
            id,
            checkout_id: issue.checkout_id,
            payment_id: issue.payment_id,
            kind: issue.kind,
            detail: issue.detail.clone(),
            occurrences: 1,
            status: IssueStatus::Open,
            raised_at: issue.at,
            last_raised_at: issue.at,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        });
        Ok(id)
    }

    async fn list_open(&self, limit: usize) -> Result<Vec<ReconciliationIssue>, StoreError> {
        Ok(lock(&self.issues)
            .iter()
            .filter(|issue| issue.status == IssueStatus::Open)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_for_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Vec<ReconciliationIssue>, StoreError> {
        Ok(lock(&self.issues)
            .iter()
            .filter(|issue| issue.checkout_id == checkout_id)
            .cloned()
            .collect())
    }

    async fn close(
        &self,
        id: i64,
        status: IssueStatus,
        resolved_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut issues = lock(&self.issues);
        let issue = issues
            .iter_mut()
            .find(|issue| issue.id == id && issue.status == IssueStatus::Open)
            .ok_or_else(|| StoreError::NotFound {
                entity: "reconciliation issue",
                id: id.to_string(),
            })?;
        issue.status = status;
        issue.resolved_at = Some(at);
        issue.resolved_by = Some(resolved_by.to_string());
        issue.resolution_notes = notes.map(str::to_string);
        Ok(())
    }
}
