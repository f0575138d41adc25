//! Error taxonomy.
//!
//! Collaborators fail with their own narrow errors ([`StoreError`],
//! [`AuthorityError`], [`SagaLogError`](crate::saga::SagaLogError)); services
//! surface a single [`ReservationError`] whose [`ErrorKind`] the HTTP layer
//! maps to a status code.

use crate::ids::SeatLabel;
use crate::saga::SagaLogError;
use thiserror::Error;

/// Errors from the lock store, cache and durable repositories.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database connection or query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Lock store or cache failed.
    #[error("Cache error: {0}")]
    Cache(String),

    /// A value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Conditional update lost the race: the row is no longer at the expected
    /// version.
    #[error("Version conflict on {entity} {id}: expected version {expected}")]
    VersionConflict {
        /// Entity kind (`"checkout"`, `"payment"`)
        entity: &'static str,
        /// Row id
        id: String,
        /// Version the caller read
        expected: i64,
    },

    /// Row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Row id
        id: String,
    },
}

/// Errors from the seat-chart authority.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    /// Authority unreachable or timed out. Safe to retry for idempotent calls.
    #[error("Seat chart authority unavailable: {0}")]
    Unavailable(String),

    /// Authority refused the request (seat not holdable, hold expired, ...).
    #[error("Seat chart authority rejected request: {0}")]
    Rejected(String),
}

impl AuthorityError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Coarse classification of a [`ReservationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing session, seat, checkout or ticket class
    NotFound,
    /// Seat contention or lost optimistic race
    Conflict,
    /// Caller does not own the checkout
    Unauthorized,
    /// Operation not valid in the current status
    InvalidState,
    /// Checkout session cache lapsed
    Expired,
    /// Malformed request
    InvalidRequest,
    /// Seat-chart authority failed
    UpstreamFailure,
    /// Signature or amount mismatch
    IntegrityFailure,
    /// Storage failure
    Storage,
}

/// Errors surfaced by the reservation and payment services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// An entity could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Some requested seats are not on the chart.
    #[error("Seats not found: expected {expected}, found {found} (missing: {missing:?})")]
    SeatsNotFound {
        /// Number of requested seats
        expected: usize,
        /// Number that resolved
        found: usize,
        /// Labels that did not resolve
        missing: Vec<SeatLabel>,
    },

    /// Seat already locked, lock lapsed, or a concurrent writer won.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Checkout belongs to someone else.
    #[error("Checkout does not belong to caller")]
    Unauthorized,

    /// Operation not allowed in the current status.
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        /// Required status
        expected: String,
        /// Actual status
        actual: String,
    },

    /// The checkout's session cache lapsed.
    #[error("Checkout expired")]
    Expired,

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The seat-chart authority failed or refused.
    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    /// Signature or amount verification failed.
    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    /// A store failed.
    #[error("Storage failure: {0}")]
    Storage(String),
}

impl ReservationError {
    /// Classification for callers.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::SeatsNotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Expired => ErrorKind::Expired,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::UpstreamFailure(_) => ErrorKind::UpstreamFailure,
            Self::IntegrityFailure(_) => ErrorKind::IntegrityFailure,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether the caller should start over ("seat no longer available",
    /// "checkout expired") or simply retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Expired | Self::UpstreamFailure(_) | Self::Storage(_)
        )
    }

    /// Shorthand for a status precondition failure.
    pub fn invalid_state(expected: impl ToString, actual: impl ToString) -> Self {
        Self::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl From<StoreError> for ReservationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::VersionConflict { .. } => Self::Conflict(error.to_string()),
            StoreError::NotFound { .. } => Self::NotFound(error.to_string()),
            StoreError::Database(_) | StoreError::Cache(_) | StoreError::Serialization(_) => {
                Self::Storage(error.to_string())
            },
        }
    }
}

impl From<AuthorityError> for ReservationError {
    fn from(error: AuthorityError) -> Self {
        Self::UpstreamFailure(error.to_string())
    }
}

impl From<SagaLogError> for ReservationError {
    fn from(error: SagaLogError) -> Self {
        match error {
            SagaLogError::ConcurrencyConflict { .. } => Self::Conflict(error.to_string()),
            SagaLogError::Database(_) | SagaLogError::Serialization(_) => {
                Self::Storage(error.to_string())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflicts_surface_as_conflict() {
        let error: ReservationError = StoreError::VersionConflict {
            entity: "checkout",
            id: "c-1".to_string(),
            expected: 3,
        }
        .into();
        assert_eq!(error.kind(), ErrorKind::Conflict);
        assert!(error.is_retryable());
    }

    #[test]
    fn authority_rejection_is_upstream_failure() {
        let error: ReservationError = AuthorityError::Rejected("seat booked".into()).into();
        assert_eq!(error.kind(), ErrorKind::UpstreamFailure);
        assert!(!AuthorityError::Rejected(String::new()).is_transient());
        assert!(AuthorityError::Unavailable(String::new()).is_transient());
    }

    #[test]
    fn unauthorized_is_not_retryable() {
        assert!(!ReservationError::Unauthorized.is_retryable());
        assert!(
            !ReservationError::IntegrityFailure("bad signature".into()).is_retryable()
        );
    }
}
