//! Checkout saga log.
//!
//! Every step a checkout takes against the lock store, the authority and the
//! ledger is appended to an append-only, per-checkout stream. The stream is
//! versioned: an append states the version it expects the stream to be at and
//! fails with [`SagaLogError::ConcurrencyConflict`] otherwise, which is what
//! serializes two racing finalize (or finalize vs. cancel) attempts.
//!
//! Folding a stream with [`SagaProgress::from_records`] tells a resumed
//! checkout which steps are already done.
//!
//! Steps are stored as bincode with a versioned type tag
//! (`"BookingConfirmed.v1"`), so the schema can evolve without rewriting old
//! streams.

use crate::ids::{CheckoutId, PaymentId, SeatLabel, TicketId};
use crate::model::CheckoutStatus;
use crate::money::Money;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during saga log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SagaLogError {
    /// Another writer appended first.
    #[error("Concurrency conflict on saga {checkout_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The saga stream
        checkout_id: CheckoutId,
        /// Version the caller expected
        expected: u64,
        /// Version actually found
        actual: u64,
    },

    /// Database connection error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// What drives a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizeVia {
    /// Direct confirm by the buyer
    Confirm,
    /// Verified gateway payment
    Payment {
        /// The settled payment
        payment_id: PaymentId,
    },
}

impl FinalizeVia {
    /// Checkout status a successful finalization ends in.
    #[must_use]
    pub const fn target_status(&self) -> CheckoutStatus {
        match self {
            Self::Confirm => CheckoutStatus::Confirmed,
            Self::Payment { .. } => CheckoutStatus::Paid,
        }
    }
}

/// Why a checkout is being canceled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The buyer canceled
    Requested,
    /// The hold reaper found it abandoned
    HoldLapsed,
}

/// A completed step of a checkout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStep {
    /// Seat locks taken
    LocksAcquired {
        /// Locked seats
        seats: Vec<SeatLabel>,
    },
    /// Checkout row persisted
    CheckoutOpened,
    /// Authority issued a hold token
    HoldCreated {
        /// Token
        token: String,
        /// Expiry
        expires_at: DateTime<Utc>,
    },
    /// Authority holds the seats
    SeatsHeld,
    /// Hold could not be created or applied
    HoldFailed {
        /// Failure detail
        reason: String,
    },
    /// Seat locks released
    LocksReleased,
    /// Payment intent issued
    PaymentIntentIssued {
        /// Payment
        payment_id: PaymentId,
        /// Gateway reference
        reference: String,
        /// Gross amount
        gross: Money,
    },
    /// About to call the authority's irreversible `book`
    BookingRequested {
        /// What drives the booking
        via: FinalizeVia,
    },
    /// Authority refused the booking; nothing was booked
    BookingFailed {
        /// Failure detail
        reason: String,
    },
    /// Authority booked the seats
    BookingConfirmed,
    /// Ledger transaction committed
    TicketsIssued {
        /// Tickets covering the seats
        tickets: Vec<TicketId>,
        /// Seats with no resolvable ticket class
        skipped: Vec<SeatLabel>,
    },
    /// Payment marked `Success`
    PaymentSettled {
        /// Payment
        payment_id: PaymentId,
    },
    /// Session payout accrued
    PayoutAccrued {
        /// Payment
        payment_id: PaymentId,
    },
    /// Finalization finished
    Completed {
        /// Final checkout status
        status: CheckoutStatus,
    },
    /// Cancellation claimed the saga
    CancelRequested {
        /// Why
        reason: CancelReason,
    },
    /// Authority released the hold
    AuthorityReleased,
    /// Authority release failed (best effort)
    AuthorityReleaseFailed {
        /// Failure detail
        reason: String,
    },
    /// Checkout canceled by the buyer
    Canceled,
    /// Checkout canceled by the hold reaper
    Expired,
    /// Finalization failed after booking; recovery will resume it
    ReconciliationRequired {
        /// Failure detail
        reason: String,
    },
    /// Handed to an operator; recovery will not touch it again
    Escalated {
        /// Why
        reason: String,
    },
}

impl SagaStep {
    /// Versioned type tag stored alongside the payload.
    #[must_use]
    pub const fn step_type(&self) -> &'static str {
        match self {
            Self::LocksAcquired { .. } => "LocksAcquired.v1",
            Self::CheckoutOpened => "CheckoutOpened.v1",
            Self::HoldCreated { .. } => "HoldCreated.v1",
            Self::SeatsHeld => "SeatsHeld.v1",
            Self::HoldFailed { .. } => "HoldFailed.v1",
            Self::LocksReleased => "LocksReleased.v1",
            Self::PaymentIntentIssued { .. } => "PaymentIntentIssued.v1",
            Self::BookingRequested { .. } => BOOKING_REQUESTED_STEP_TYPE,
            Self::BookingFailed { .. } => "BookingFailed.v1",
            Self::BookingConfirmed => "BookingConfirmed.v1",
            Self::TicketsIssued { .. } => "TicketsIssued.v1",
            Self::PaymentSettled { .. } => "PaymentSettled.v1",
            Self::PayoutAccrued { .. } => "PayoutAccrued.v1",
            Self::Completed { .. } => "Completed.v1",
            Self::CancelRequested { .. } => "CancelRequested.v1",
            Self::AuthorityReleased => "AuthorityReleased.v1",
            Self::AuthorityReleaseFailed { .. } => "AuthorityReleaseFailed.v1",
            Self::Canceled => "Canceled.v1",
            Self::Expired => "Expired.v1",
            Self::ReconciliationRequired { .. } => "ReconciliationRequired.v1",
            Self::Escalated { .. } => "Escalated.v1",
        }
    }

    /// Whether the step closes the saga.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Canceled | Self::Expired | Self::Escalated { .. }
        )
    }

    /// Serialize this step to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SagaLogError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SagaLogError> {
        bincode::serialize(self).map_err(|e| SagaLogError::Serialization(e.to_string()))
    }

    /// Deserialize a step from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SagaLogError::Serialization`] if the bytes are not a step.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SagaLogError> {
        bincode::deserialize(bytes).map_err(|e| SagaLogError::Serialization(e.to_string()))
    }
}

/// Type tag of [`SagaStep::BookingRequested`]; recovery scans for it.
pub const BOOKING_REQUESTED_STEP_TYPE: &str = "BookingRequested.v1";

/// Step types that close a saga, as stored in the `step_type` column.
pub const TERMINAL_STEP_TYPES: [&str; 4] =
    ["Completed.v1", "Canceled.v1", "Expired.v1", "Escalated.v1"];

/// A stored step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SagaRecord {
    /// Saga stream
    pub checkout_id: CheckoutId,
    /// Position in the stream, starting at 1
    pub version: u64,
    /// The step
    pub step: SagaStep,
    /// Append time
    pub recorded_at: DateTime<Utc>,
}

/// Append-only saga storage with optimistic concurrency.
///
/// # Implementations
///
/// - `PostgresSagaLog` (in `boxoffice-postgres`)
/// - `InMemorySagaLog` (in `boxoffice-testing`)
#[async_trait]
pub trait SagaLog: Send + Sync {
    /// Append `steps` to the checkout's stream, which must currently be at
    /// `expected_version` (0 for a new stream). Returns the new version.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: another writer appended first; nothing was written
    /// - `Database`: storage failed
    async fn append(
        &self,
        checkout_id: CheckoutId,
        expected_version: u64,
        steps: Vec<SagaStep>,
        at: DateTime<Utc>,
    ) -> Result<u64, SagaLogError>;

    /// Load a stream, oldest first. Unknown streams are empty.
    ///
    /// # Errors
    ///
    /// - `Database`: storage failed
    /// - `Serialization`: a stored step could not be decoded
    async fn load(&self, checkout_id: CheckoutId) -> Result<Vec<SagaRecord>, SagaLogError>;

    /// Checkouts with a booking requested, no terminal step, and no append
    /// since `idle_since`. Oldest first.
    ///
    /// # Errors
    ///
    /// - `Database`: storage failed
    async fn stalled(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CheckoutId>, SagaLogError>;
}

/// Where a booking stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BookingStage {
    /// No booking attempted (or the last one was refused)
    #[default]
    NotRequested,
    /// `book` was called; its outcome is not recorded
    Requested(FinalizeVia),
    /// Authority booked the seats
    Confirmed(FinalizeVia),
}

/// How a saga ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SagaOutcome {
    /// Finalized with this status
    Completed(CheckoutStatus),
    /// Canceled by the buyer
    Canceled,
    /// Canceled by the hold reaper
    Expired,
    /// Handed to an operator
    Escalated,
}

/// The fold of a saga stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SagaProgress {
    /// Current stream version (the next append expects this)
    pub version: u64,
    /// Locks were taken
    pub locks_acquired: bool,
    /// Authority holds the seats
    pub seats_held: bool,
    /// Locks were released
    pub locks_released: bool,
    /// Latest payment intent
    pub payment_intent: Option<PaymentId>,
    /// Booking stage
    pub booking: BookingStage,
    /// Tickets, once the ledger transaction committed
    pub tickets: Option<Vec<TicketId>>,
    /// Payment marked `Success`
    pub payment_settled: bool,
    /// Payout accrued
    pub payout_accrued: bool,
    /// A cancel claimed the saga
    pub cancel_requested: bool,
    /// A post-booking failure was flagged
    pub reconciliation_flagged: bool,
    /// Set once a terminal step is recorded
    pub outcome: Option<SagaOutcome>,
    /// Time of the last append
    pub last_recorded_at: Option<DateTime<Utc>>,
}

impl SagaProgress {
    /// Fold a stream.
    #[must_use]
    pub fn from_records(records: &[SagaRecord]) -> Self {
        let mut progress = Self::default();
        for record in records {
            progress.apply(&record.step);
            progress.version = record.version;
            progress.last_recorded_at = Some(record.recorded_at);
        }
        progress
    }

    /// Apply one step. Does not touch `version`.
    pub fn apply(&mut self, step: &SagaStep) {
        match step {
            SagaStep::LocksAcquired { .. } => self.locks_acquired = true,
            SagaStep::SeatsHeld => self.seats_held = true,
            SagaStep::LocksReleased => self.locks_released = true,
            SagaStep::PaymentIntentIssued { payment_id, .. } => {
                self.payment_intent = Some(*payment_id);
            },
            SagaStep::BookingRequested { via } => self.booking = BookingStage::Requested(*via),
            SagaStep::BookingFailed { .. } => self.booking = BookingStage::NotRequested,
            SagaStep::BookingConfirmed => {
                if let BookingStage::Requested(via) = self.booking {
                    self.booking = BookingStage::Confirmed(via);
                }
            },
            SagaStep::TicketsIssued { tickets, .. } => self.tickets = Some(tickets.clone()),
            SagaStep::PaymentSettled { .. } => self.payment_settled = true,
            SagaStep::PayoutAccrued { .. } => self.payout_accrued = true,
            SagaStep::CancelRequested { .. } => self.cancel_requested = true,
            SagaStep::ReconciliationRequired { .. } => self.reconciliation_flagged = true,
            SagaStep::Completed { status } => self.outcome = Some(SagaOutcome::Completed(*status)),
            SagaStep::Canceled => self.outcome = Some(SagaOutcome::Canceled),
            SagaStep::Expired => self.outcome = Some(SagaOutcome::Expired),
            SagaStep::Escalated { .. } => self.outcome = Some(SagaOutcome::Escalated),
            SagaStep::CheckoutOpened
            | SagaStep::HoldCreated { .. }
            | SagaStep::HoldFailed { .. }
            | SagaStep::AuthorityReleased
            | SagaStep::AuthorityReleaseFailed { .. } => {},
        }
    }

    /// Whether a terminal step was recorded.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    /// A booking was requested and the saga is still open.
    #[must_use]
    pub const fn booking_in_flight(&self) -> bool {
        !self.is_closed() && !matches!(self.booking, BookingStage::NotRequested)
    }

    /// What drove the booking, if one was requested.
    #[must_use]
    pub const fn booking_via(&self) -> Option<FinalizeVia> {
        match self.booking {
            BookingStage::NotRequested => None,
            BookingStage::Requested(via) | BookingStage::Confirmed(via) => Some(via),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(version: u64, step: SagaStep) -> SagaRecord {
        SagaRecord {
            checkout_id: CheckoutId::new(),
            version,
            step,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn step_roundtrips_through_bincode() {
        let step = SagaStep::TicketsIssued {
            tickets: vec![TicketId::new()],
            skipped: vec![SeatLabel::new("A9")],
        };
        let bytes = step.to_bytes().unwrap();
        assert_eq!(SagaStep::from_bytes(&bytes).unwrap(), step);
    }

    #[test]
    fn terminal_tags_match_terminal_steps() {
        let terminal = [
            SagaStep::Completed { status: CheckoutStatus::Paid },
            SagaStep::Canceled,
            SagaStep::Expired,
            SagaStep::Escalated { reason: String::new() },
        ];
        for step in &terminal {
            assert!(step.is_terminal());
            assert!(TERMINAL_STEP_TYPES.contains(&step.step_type()));
        }
        assert!(!SagaStep::ReconciliationRequired { reason: String::new() }.is_terminal());
    }

    #[test]
    fn refused_booking_can_be_requested_again() {
        let via = FinalizeVia::Confirm;
        let progress = SagaProgress::from_records(&[
            record(1, SagaStep::LocksAcquired { seats: vec![] }),
            record(2, SagaStep::BookingRequested { via }),
            record(3, SagaStep::BookingFailed { reason: "rejected".into() }),
        ]);
        assert_eq!(progress.version, 3);
        assert_eq!(progress.booking, BookingStage::NotRequested);
        assert!(!progress.booking_in_flight());
    }

    #[test]
    fn confirmed_booking_stays_in_flight_until_completed() {
        let payment_id = PaymentId::new();
        let via = FinalizeVia::Payment { payment_id };
        let mut records = vec![
            record(1, SagaStep::BookingRequested { via }),
            record(2, SagaStep::BookingConfirmed),
            record(3, SagaStep::ReconciliationRequired { reason: "db down".into() }),
        ];
        let progress = SagaProgress::from_records(&records);
        assert_eq!(progress.booking, BookingStage::Confirmed(via));
        assert!(progress.booking_in_flight());
        assert!(progress.reconciliation_flagged);

        records.push(record(4, SagaStep::Completed { status: CheckoutStatus::Paid }));
        let progress = SagaProgress::from_records(&records);
        assert!(!progress.booking_in_flight());
        assert_eq!(
            progress.outcome,
            Some(SagaOutcome::Completed(CheckoutStatus::Paid))
        );
    }
}
