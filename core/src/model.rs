//! Entities of the checkout ledger.

use crate::ids::{CheckoutId, PaymentId, SeatLabel, SessionId, TicketClassId, TicketId, UserId};
use crate::money::Money;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Catalog (read-only for this subsystem)
// ============================================================================

/// One performance of an event that tickets are sold for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellableSession {
    /// Session id
    pub id: SessionId,
    /// Display name
    pub name: String,
    /// Key of the session on the seat-chart authority. A session without a
    /// chart cannot be sold.
    pub chart_key: Option<String>,
}

/// A seat on a session's chart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    /// Owning session
    pub session_id: SessionId,
    /// Chart label
    pub label: SeatLabel,
    /// Seat category as drawn on the chart (`"VIP"`, `"Stalls"`)
    pub category: Option<String>,
}

/// A price tier of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketClass {
    /// Class id
    pub id: TicketClassId,
    /// Owning session
    pub session_id: SessionId,
    /// Display name
    pub name: String,
    /// Seat category this class prices
    pub category: Option<String>,
    /// Unit price
    pub price: Money,
    /// Listing position, lowest first
    pub sort_order: i32,
}

// ============================================================================
// Checkout
// ============================================================================

/// Lifecycle of a checkout.
///
/// `Init` is the only mutable state. `Confirmed` is reached by a direct
/// confirm, `Paid` by payment reconciliation, `Canceled` by the buyer or the
/// hold reaper.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckoutStatus {
    /// Seats locked, awaiting confirm or payment
    Init,
    /// Booked without a gateway payment
    Confirmed,
    /// Booked after a verified payment
    Paid,
    /// Abandoned before booking
    Canceled,
}

impl CheckoutStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Confirmed => "confirmed",
            Self::Paid => "paid",
            Self::Canceled => "canceled",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "init" => Ok(Self::Init),
            "confirmed" => Ok(Self::Confirmed),
            "paid" => Ok(Self::Paid),
            "canceled" => Ok(Self::Canceled),
            _ => Err(StoreError::Serialization(format!(
                "Invalid checkout status: {s}"
            ))),
        }
    }

    /// Whether the checkout can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Init)
    }

    /// Whether the seats were booked.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Paid)
    }
}

impl fmt::Display for CheckoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hold token issued by the seat-chart authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldToken {
    /// Opaque token
    pub token: String,
    /// When the authority drops the hold
    pub expires_at: DateTime<Utc>,
}

/// A checkout attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    /// Checkout id
    pub id: CheckoutId,
    /// Buyer
    pub user_id: UserId,
    /// Target session
    pub session_id: SessionId,
    /// Chart key of the session at creation time
    pub chart_key: String,
    /// Current status
    pub status: CheckoutStatus,
    /// Requested seats, unique, in request order
    pub seats: Vec<SeatLabel>,
    /// Authority hold, once created
    pub hold: Option<HoldToken>,
    /// End of the payment window, once a payment intent was issued
    pub payment_deadline: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by every write
    pub version: i64,
}

impl Checkout {
    /// A fresh `Init` checkout at version 1.
    #[must_use]
    pub fn open(
        id: CheckoutId,
        user_id: UserId,
        session_id: SessionId,
        chart_key: String,
        seats: Vec<SeatLabel>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            session_id,
            chart_key,
            status: CheckoutStatus::Init,
            seats,
            hold: None,
            payment_deadline: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Whether `user_id` owns this checkout.
    #[must_use]
    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == user_id
    }

    /// When the checkout counts as abandoned: the authority hold expiry (or
    /// `created_at + hold_ttl` if no hold was ever recorded), pushed back to
    /// the end of the payment window when one is open.
    #[must_use]
    pub fn abandoned_after(&self, hold_ttl: chrono::Duration) -> DateTime<Utc> {
        let hold_deadline = self
            .hold
            .as_ref()
            .map_or(self.created_at + hold_ttl, |hold| hold.expires_at);
        self.payment_deadline
            .map_or(hold_deadline, |deadline| deadline.max(hold_deadline))
    }

    /// The caller-facing projection.
    #[must_use]
    pub fn view(&self) -> CheckoutView {
        CheckoutView {
            id: self.id,
            status: self.status,
            seats: self.seats.clone(),
            hold_expires_at: self.hold.as_ref().map(|hold| hold.expires_at),
        }
    }
}

/// What a caller sees of a checkout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutView {
    /// Checkout id
    pub id: CheckoutId,
    /// Current status
    pub status: CheckoutStatus,
    /// Requested seats
    pub seats: Vec<SeatLabel>,
    /// Authority hold expiry
    pub hold_expires_at: Option<DateTime<Utc>>,
}

/// Short-lived summary cached next to the seat locks for confirm-time checks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSummary {
    /// Checkout id
    pub checkout_id: CheckoutId,
    /// Buyer
    pub user_id: UserId,
    /// Session
    pub session_id: SessionId,
    /// Locked seats
    pub seats: Vec<SeatLabel>,
}

impl From<&Checkout> for CheckoutSummary {
    fn from(checkout: &Checkout) -> Self {
        Self {
            checkout_id: checkout.id,
            user_id: checkout.user_id,
            session_id: checkout.session_id,
            seats: checkout.seats.clone(),
        }
    }
}

// ============================================================================
// Payment
// ============================================================================

/// Payment state machine: `Pending → Success | Failed`.
///
/// `Failed → Success` is reserved for saga recovery of a payment whose
/// booking is proven by the saga log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// Awaiting the gateway
    Pending,
    /// Verified and settled
    Success,
    /// Declined by the gateway, or finalization failed after booking
    Failed,
}

impl PaymentStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::Serialization(format!(
                "Invalid payment status: {s}"
            ))),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction details echoed by the gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayMetadata {
    /// Gateway-side transaction number
    pub transaction_no: Option<String>,
    /// Gateway response code
    pub response_code: Option<String>,
    /// Every other callback field
    pub extra: BTreeMap<String, String>,
}

/// A payment for one checkout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment id
    pub id: PaymentId,
    /// Paid checkout (unique)
    pub checkout_id: CheckoutId,
    /// Payer
    pub user_id: UserId,
    /// Session
    pub session_id: SessionId,
    /// Reference sent to the gateway, stable across intent re-requests
    pub reference: String,
    /// Gross amount, fixed at creation
    pub gross: Money,
    /// Platform share
    pub platform_fee: Money,
    /// Organizer share
    pub organizer_amount: Money,
    /// Current status
    pub status: PaymentStatus,
    /// Whether a signed callback confirmed it
    pub verified: bool,
    /// Gateway details from the last callback
    pub gateway: GatewayMetadata,
    /// Why the payment failed, when it did
    pub failure_reason: Option<String>,
    /// Settlement time
    pub paid_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token
    pub version: i64,
}

/// Input for creating or refreshing the payment of a checkout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentDraft {
    /// Id to use when the row does not exist yet
    pub id: PaymentId,
    /// Checkout being paid
    pub checkout_id: CheckoutId,
    /// Payer
    pub user_id: UserId,
    /// Session
    pub session_id: SessionId,
    /// Reference to use when the row does not exist yet
    pub reference: String,
    /// Gross amount
    pub gross: Money,
    /// Platform share
    pub platform_fee: Money,
    /// Organizer share
    pub organizer_amount: Money,
    /// Write time
    pub at: DateTime<Utc>,
}

// ============================================================================
// Seat state, tickets, payouts
// ============================================================================

/// Read-side status of a seat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeatStatus {
    /// Sellable
    Free,
    /// Sold; immutable here
    Paid,
}

impl SeatStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Paid => "paid",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "free" => Ok(Self::Free),
            "paid" => Ok(Self::Paid),
            _ => Err(StoreError::Serialization(format!("Invalid seat status: {s}"))),
        }
    }
}

/// Per-(session, seat) status projection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatState {
    /// Session
    pub session_id: SessionId,
    /// Seat
    pub seat: SeatLabel,
    /// Status
    pub status: SeatStatus,
    /// Ticket, set only when `Paid`
    pub ticket_id: Option<TicketId>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

/// An issued ticket. Unique per (session, seat).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket id
    pub id: TicketId,
    /// Checkout that bought it
    pub checkout_id: CheckoutId,
    /// Session
    pub session_id: SessionId,
    /// Holder
    pub user_id: UserId,
    /// Seat
    pub seat: SeatLabel,
    /// Price tier
    pub ticket_class_id: TicketClassId,
    /// Unit price at issue time
    pub price: Money,
    /// Issue time
    pub issued_at: DateTime<Utc>,
}

/// Accumulated organizer payout of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Session
    pub session_id: SessionId,
    /// Sum of gross amounts
    pub gross: Money,
    /// Sum of platform fees
    pub platform_fee: Money,
    /// Sum of organizer amounts
    pub organizer_amount: Money,
    /// Number of accrued payments
    pub payments: u64,
    /// Last accrual
    pub updated_at: DateTime<Utc>,
}

/// One payment's contribution to its session payout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayoutAccrual {
    /// Accrual key; a payment accrues at most once
    pub payment_id: PaymentId,
    /// Session
    pub session_id: SessionId,
    /// Gross
    pub gross: Money,
    /// Platform fee
    pub platform_fee: Money,
    /// Organizer amount
    pub organizer_amount: Money,
    /// Accrual time
    pub at: DateTime<Utc>,
}

impl PayoutAccrual {
    /// The accrual for a settled payment.
    #[must_use]
    pub const fn for_payment(payment: &Payment, at: DateTime<Utc>) -> Self {
        Self {
            payment_id: payment.id,
            session_id: payment.session_id,
            gross: payment.gross,
            platform_fee: payment.platform_fee,
            organizer_amount: payment.organizer_amount,
            at,
        }
    }
}

/// Local half of a booking: issue tickets, mark seats paid and move the
/// checkout out of `Init`, all in one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finalization {
    /// Checkout being finalized
    pub checkout_id: CheckoutId,
    /// Session
    pub session_id: SessionId,
    /// Version the checkout is expected at while still `Init`
    pub expected_version: i64,
    /// `Confirmed` or `Paid`
    pub target: CheckoutStatus,
    /// Tickets to issue, one per resolvable seat
    pub tickets: Vec<Ticket>,
    /// Transaction time
    pub at: DateTime<Utc>,
}

/// Result of a [`Finalization`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalizeOutcome {
    /// Tickets inserted by this call
    pub issued: Vec<Ticket>,
    /// Tickets already stored for the requested seats, possibly issued to
    /// another checkout
    pub existing: Vec<Ticket>,
    /// Checkout version after the transaction
    pub checkout_version: i64,
}

impl FinalizeOutcome {
    /// Tickets of `checkout_id` covering the finalized seats, whether issued
    /// by this call or by an earlier run.
    #[must_use]
    pub fn ticket_ids(&self, checkout_id: CheckoutId) -> Vec<TicketId> {
        self.issued
            .iter()
            .chain(&self.existing)
            .filter(|ticket| ticket.checkout_id == checkout_id)
            .map(|ticket| ticket.id)
            .collect()
    }

    /// Seats whose ticket belongs to another checkout.
    #[must_use]
    pub fn taken_elsewhere(&self, checkout_id: CheckoutId) -> Vec<SeatLabel> {
        self.existing
            .iter()
            .filter(|ticket| ticket.checkout_id != checkout_id)
            .map(|ticket| ticket.seat.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default()
            + chrono::Duration::minutes(minutes)
    }

    fn checkout() -> Checkout {
        Checkout::open(
            CheckoutId::new(),
            UserId::new(),
            SessionId::new(),
            "chart".to_string(),
            vec![SeatLabel::new("A1")],
            t(0),
        )
    }

    fn ticket(checkout_id: CheckoutId, seat: &str) -> Ticket {
        Ticket {
            id: TicketId::new(),
            checkout_id,
            session_id: SessionId::new(),
            user_id: UserId::new(),
            seat: SeatLabel::new(seat),
            ticket_class_id: TicketClassId::new(),
            price: Money::from_minor(100),
            issued_at: t(0),
        }
    }

    #[test]
    fn abandoned_after_falls_back_to_creation_plus_ttl() {
        let checkout = checkout();
        assert_eq!(checkout.abandoned_after(chrono::Duration::minutes(15)), t(15));
    }

    #[test]
    fn payment_window_postpones_abandonment() {
        let mut checkout = checkout();
        checkout.hold = Some(HoldToken {
            token: "hold".to_string(),
            expires_at: t(15),
        });
        checkout.payment_deadline = Some(t(19));
        assert_eq!(checkout.abandoned_after(chrono::Duration::minutes(15)), t(19));

        // An earlier window never shortens the hold.
        checkout.payment_deadline = Some(t(10));
        assert_eq!(checkout.abandoned_after(chrono::Duration::minutes(15)), t(15));
    }

    #[test]
    fn tickets_of_other_checkouts_are_not_reported_as_own() {
        let own = CheckoutId::new();
        let other = CheckoutId::new();
        let issued = ticket(own, "A1");
        let replayed = ticket(own, "A2");
        let foreign = ticket(other, "A3");
        let outcome = FinalizeOutcome {
            issued: vec![issued.clone()],
            existing: vec![replayed.clone(), foreign],
            checkout_version: 2,
        };

        assert_eq!(outcome.ticket_ids(own), vec![issued.id, replayed.id]);
        assert_eq!(outcome.taken_elsewhere(own), vec![SeatLabel::new("A3")]);
    }
}
