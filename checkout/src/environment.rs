//! Injected collaborators.

use crate::authority::RetryingAuthority;
use boxoffice_core::authority::SeatChartAuthority;
use boxoffice_core::environment::Clock;
use boxoffice_core::ids::{CheckoutId, PaymentId};
use boxoffice_core::locks::{CheckoutCache, SeatLockStore};
use boxoffice_core::reconciliation::{IssueKind, NewIssue, ReconciliationQueue};
use boxoffice_core::repository::{
    CatalogRepository, CheckoutRepository, LedgerRepository, PaymentRepository,
};
use boxoffice_core::saga::SagaLog;
use boxoffice_runtime::BackoffPolicy;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Everything the checkout services talk to.
///
/// The services hold no mutable state of their own; all coordination state
/// lives behind these handles, so one environment can be shared by any number
/// of concurrent requests.
#[derive(Clone)]
pub struct CheckoutEnvironment {
    /// Seat locks
    pub locks: Arc<dyn SeatLockStore>,
    /// Checkout summary cache
    pub cache: Arc<dyn CheckoutCache>,
    /// Seat-chart authority
    pub authority: Arc<dyn SeatChartAuthority>,
    /// Sessions, seats, ticket classes
    pub catalog: Arc<dyn CatalogRepository>,
    /// Checkout ledger
    pub checkouts: Arc<dyn CheckoutRepository>,
    /// Payments
    pub payments: Arc<dyn PaymentRepository>,
    /// Tickets, seat states, payouts
    pub ledger: Arc<dyn LedgerRepository>,
    /// Saga log
    pub saga: Arc<dyn SagaLog>,
    /// Operator queue
    pub issues: Arc<dyn ReconciliationQueue>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl CheckoutEnvironment {
    /// Wrap the authority so transient failures are retried with `policy`.
    #[must_use]
    pub fn with_retrying_authority(mut self, policy: BackoffPolicy) -> Self {
        self.authority = Arc::new(RetryingAuthority::new(self.authority, policy));
        self
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Raise an operator issue. Failure to raise is logged, never returned:
    /// the caller is already reporting a worse error.
    pub(crate) async fn raise_issue(
        &self,
        kind: IssueKind,
        checkout_id: CheckoutId,
        payment_id: Option<PaymentId>,
        detail: String,
    ) {
        let issue = NewIssue {
            checkout_id,
            payment_id,
            kind,
            detail,
            at: self.now(),
        };
        match self.issues.raise(&issue).await {
            Ok(issue_id) => {
                crate::metrics::record_issue(kind);
                tracing::warn!(
                    issue_id,
                    checkout_id = %checkout_id,
                    kind = kind.as_str(),
                    detail = %issue.detail,
                    "Reconciliation issue raised"
                );
            },
            Err(e) => {
                tracing::error!(
                    checkout_id = %checkout_id,
                    kind = kind.as_str(),
                    detail = %issue.detail,
                    error = %e,
                    "Failed to raise reconciliation issue"
                );
            },
        }
    }
}
