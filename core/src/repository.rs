//! Durable repositories.
//!
//! Every status transition on a checkout or payment is a conditional update
//! against the row's `version`; losing the race yields
//! [`StoreError::VersionConflict`] and changes nothing.

use crate::error::StoreError;
use crate::ids::{CheckoutId, PaymentId, SeatLabel, SessionId};
use crate::model::{
    Checkout, CheckoutStatus, Finalization, FinalizeOutcome, GatewayMetadata, HoldToken, Payment,
    PaymentDraft, Payout, PayoutAccrual, Seat, SeatState, SellableSession, Ticket, TicketClass,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Read access to sessions, seats and ticket classes.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Look up a sellable session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn find_session(&self, id: SessionId) -> Result<Option<SellableSession>, StoreError>;

    /// Seats of `session_id` whose label is in `labels`. Unknown labels are
    /// simply absent from the result.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn find_seats(
        &self,
        session_id: SessionId,
        labels: &[SeatLabel],
    ) -> Result<Vec<Seat>, StoreError>;

    /// Ticket classes of a session in listing order (`sort_order`, then name).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn ticket_classes(&self, session_id: SessionId) -> Result<Vec<TicketClass>, StoreError>;
}

/// The checkout ledger.
#[async_trait]
pub trait CheckoutRepository: Send + Sync {
    /// Persist a new checkout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure, including a duplicate id.
    async fn insert(&self, checkout: &Checkout) -> Result<(), StoreError>;

    /// Load a checkout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn find(&self, id: CheckoutId) -> Result<Option<Checkout>, StoreError>;

    /// Record the authority hold on an `Init` checkout. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] if the checkout moved on.
    async fn attach_hold(
        &self,
        id: CheckoutId,
        hold: &HoldToken,
        expected_version: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Move a checkout from `from` to `to`. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] unless the row is at
    /// (`from`, `expected_version`).
    async fn transition(
        &self,
        id: CheckoutId,
        from: CheckoutStatus,
        to: CheckoutStatus,
        expected_version: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Push the payment deadline of an `Init` checkout to `deadline`. Never
    /// moves it earlier and leaves the version alone: the deadline only gates
    /// the hold reaper, it is not part of the status CAS.
    ///
    /// Returns `false` if the checkout is no longer `Init`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown checkout.
    async fn extend_payment_deadline(
        &self,
        id: CheckoutId,
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `Init` checkouts whose hold expired before `now`, or that never got a
    /// hold and were created before `created_before`, and whose payment
    /// deadline (if any) also passed. Oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn list_abandoned(
        &self,
        now: DateTime<Utc>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Checkout>, StoreError>;
}

/// Payments, one per checkout.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Create the checkout's payment, or refresh its amounts.
    ///
    /// An existing row keeps its id and reference; its status is reset to
    /// `Pending` unless it is `Success`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    async fn upsert_intent(&self, draft: &PaymentDraft) -> Result<Payment, StoreError>;

    /// Look up a payment by gateway reference.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn find_by_reference(&self, reference: &str) -> Result<Option<Payment>, StoreError>;

    /// Look up the payment of a checkout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn find_by_checkout(&self, checkout_id: CheckoutId)
    -> Result<Option<Payment>, StoreError>;

    /// Mark the payment `Success` and verified.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] if the row moved on.
    async fn settle(
        &self,
        id: PaymentId,
        expected_version: i64,
        gateway: &GatewayMetadata,
        paid_at: DateTime<Utc>,
    ) -> Result<Payment, StoreError>;

    /// Mark the payment `Failed`, replacing the stored gateway details when
    /// `gateway` is given.
    ///
    /// A settled payment never leaves `Success`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] if the row moved on or is
    /// already `Success`.
    async fn mark_failed(
        &self,
        id: PaymentId,
        expected_version: i64,
        reason: &str,
        gateway: Option<&GatewayMetadata>,
        at: DateTime<Utc>,
    ) -> Result<Payment, StoreError>;
}

/// Tickets, seat states and payouts.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Apply a [`Finalization`] in one transaction.
    ///
    /// Tickets are inserted unless the (session, seat) already has one, in
    /// which case the existing ticket is reported. Seat states move to `Paid`.
    /// The checkout moves from `Init` at `expected_version` to the target
    /// status; a checkout already at the target is accepted unchanged so a
    /// resumed finalization is idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] (and applies nothing) if the
    /// checkout is neither at the expected `Init` version nor at the target.
    async fn finalize(&self, finalization: &Finalization) -> Result<FinalizeOutcome, StoreError>;

    /// Add a payment to its session payout. Returns `false` if this payment
    /// was already accrued.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    async fn accrue_payout(&self, accrual: &PayoutAccrual) -> Result<bool, StoreError>;

    /// Seat state of one seat.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn seat_state(
        &self,
        session_id: SessionId,
        seat: &SeatLabel,
    ) -> Result<Option<SeatState>, StoreError>;

    /// Every recorded seat state of a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn seat_states(&self, session_id: SessionId) -> Result<Vec<SeatState>, StoreError>;

    /// Tickets issued to a checkout.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn tickets_for_checkout(&self, checkout_id: CheckoutId)
    -> Result<Vec<Ticket>, StoreError>;

    /// Payout of a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on query failure.
    async fn payout(&self, session_id: SessionId) -> Result<Option<Payout>, StoreError>;
}
