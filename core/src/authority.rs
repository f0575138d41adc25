//! The external seat-chart authority.
//!
//! The authority owns the canonical layout and the hold/book/release state of
//! every seat. Its answers are mirrored locally, never assumed.

use crate::error::AuthorityError;
use crate::ids::SeatLabel;
use crate::model::HoldToken;
use async_trait::async_trait;
use std::time::Duration;

/// Narrow interface to the seat-chart service.
///
/// `book` is irreversible. Callers record a saga step before calling it and
/// never retry it blindly.
#[async_trait]
pub trait SeatChartAuthority: Send + Sync {
    /// Whether a chart session exists for `chart_key`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::Unavailable`] if the authority cannot be reached.
    async fn retrieve_session(&self, chart_key: &str) -> Result<bool, AuthorityError>;

    /// Issue a hold token valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if no token could be issued.
    async fn create_hold(&self, ttl: Duration) -> Result<HoldToken, AuthorityError>;

    /// Hold `seats` under `hold_token`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::Rejected`] if any seat cannot be held.
    async fn hold(
        &self,
        chart_key: &str,
        seats: &[SeatLabel],
        hold_token: &str,
    ) -> Result<(), AuthorityError>;

    /// Book `seats`, consuming the hold when one is given.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::Rejected`] if any seat cannot be booked.
    async fn book(
        &self,
        chart_key: &str,
        seats: &[SeatLabel],
        hold_token: Option<&str>,
    ) -> Result<(), AuthorityError>;

    /// Release held seats back to free.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError`] if the release was not applied.
    async fn release(&self, chart_key: &str, seats: &[SeatLabel]) -> Result<(), AuthorityError>;
}
