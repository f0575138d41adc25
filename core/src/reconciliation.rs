//! Issues that need an operator.
//!
//! Raised when a checkout reached a state the services cannot repair on their
//! own: money taken for a canceled checkout, a booking whose outcome is
//! unknown, a finalization that keeps failing after the seats were booked.

use crate::error::StoreError;
use crate::ids::{CheckoutId, PaymentId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    /// Seats booked upstream but the local ledger is not finalized
    FinalizeIncomplete,
    /// `book` was called and its result never recorded
    BookingOutcomeUnknown,
    /// A successful payment arrived for a canceled checkout (refund needed)
    PaidAfterCancel,
    /// A successful payment arrived for a checkout confirmed without one
    /// (refund needed)
    PaidAfterConfirm,
}

impl IssueKind {
    /// Convert kind to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FinalizeIncomplete => "finalize_incomplete",
            Self::BookingOutcomeUnknown => "booking_outcome_unknown",
            Self::PaidAfterCancel => "paid_after_cancel",
            Self::PaidAfterConfirm => "paid_after_confirm",
        }
    }

    /// Parse kind from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known kind.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "finalize_incomplete" => Ok(Self::FinalizeIncomplete),
            "booking_outcome_unknown" => Ok(Self::BookingOutcomeUnknown),
            "paid_after_cancel" => Ok(Self::PaidAfterCancel),
            "paid_after_confirm" => Ok(Self::PaidAfterConfirm),
            _ => Err(StoreError::Serialization(format!("Invalid issue kind: {s}"))),
        }
    }
}

/// Status of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueStatus {
    /// Awaiting an operator
    Open,
    /// Fixed
    Resolved,
    /// Closed without action
    Dismissed,
}

impl IssueStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            "dismissed" => Ok(Self::Dismissed),
            _ => Err(StoreError::Serialization(format!("Invalid issue status: {s}"))),
        }
    }
}

/// An issue to raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIssue {
    /// Affected checkout
    pub checkout_id: CheckoutId,
    /// Affected payment, if any
    pub payment_id: Option<PaymentId>,
    /// What went wrong
    pub kind: IssueKind,
    /// Human-readable detail
    pub detail: String,
    /// Raise time
    pub at: DateTime<Utc>,
}

/// A stored issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationIssue {
    /// Issue id
    pub id: i64,
    /// Affected checkout
    pub checkout_id: CheckoutId,
    /// Affected payment
    pub payment_id: Option<PaymentId>,
    /// What went wrong
    pub kind: IssueKind,
    /// Detail of the latest occurrence
    pub detail: String,
    /// How many times it was raised while open
    pub occurrences: i32,
    /// Current status
    pub status: IssueStatus,
    /// First raise
    pub raised_at: DateTime<Utc>,
    /// Latest raise
    pub last_raised_at: DateTime<Utc>,
    /// When it was closed
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who closed it
    pub resolved_by: Option<String>,
    /// Closing notes
    pub resolution_notes: Option<String>,
}

/// Durable queue of [`ReconciliationIssue`]s.
#[async_trait]
pub trait ReconciliationQueue: Send + Sync {
    /// Raise an issue. An open issue of the same kind for the same checkout
    /// is reused (its occurrence count and detail are updated). Returns the
    /// issue id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    async fn raise(&self, issue: &NewIssue) -> Result<i64, StoreError>;

    /// Open issues, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    async fn list_open(&self, limit: usize) -> Result<Vec<ReconciliationIssue>, StoreError>;

    /// Every issue of a checkout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    async fn list_for_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Vec<ReconciliationIssue>, StoreError>;

    /// Close an issue as `Resolved` or `Dismissed`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no open issue has this id.
    async fn close(
        &self,
        id: i64,
        status: IssueStatus,
        resolved_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
