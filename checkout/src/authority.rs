//! Retrying seat-chart authority client.

use async_trait::async_trait;
use boxoffice_core::authority::SeatChartAuthority;
use boxoffice_core::error::AuthorityError;
use boxoffice_core::ids::SeatLabel;
use boxoffice_core::model::HoldToken;
use boxoffice_runtime::{BackoffPolicy, retry_if};
use std::sync::Arc;
use std::time::Duration;

/// Wraps an authority and retries [`AuthorityError::Unavailable`] with
/// exponential backoff.
///
/// `book` is passed through untouched: a timed-out `book` may have
/// succeeded upstream, and booking twice is refused by the authority, so the
/// caller records the attempt in the saga log and lets recovery decide.
pub struct RetryingAuthority {
    inner: Arc<dyn SeatChartAuthority>,
    policy: BackoffPolicy,
}

impl RetryingAuthority {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn SeatChartAuthority>, policy: BackoffPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl SeatChartAuthority for RetryingAuthority {
    async fn retrieve_session(&self, chart_key: &str) -> Result<bool, AuthorityError> {
        retry_if(
            &self.policy,
            "authority.retrieve_session",
            || self.inner.retrieve_session(chart_key),
            AuthorityError::is_transient,
        )
        .await
    }

    async fn create_hold(&self, ttl: Duration) -> Result<HoldToken, AuthorityError> {
        retry_if(
            &self.policy,
            "authority.create_hold",
            || self.inner.create_hold(ttl),
            AuthorityError::is_transient,
        )
        .await
    }

    async fn hold(
        &self,
        chart_key: &str,
        seats: &[SeatLabel],
        hold_token: &str,
    ) -> Result<(), AuthorityError> {
        retry_if(
            &self.policy,
            "authority.hold",
            || self.inner.hold(chart_key, seats, hold_token),
            AuthorityError::is_transient,
        )
        .await
    }

    async fn book(
        &self,
        chart_key: &str,
        seats: &[SeatLabel],
        hold_token: Option<&str>,
    ) -> Result<(), AuthorityError> {
        self.inner.book(chart_key, seats, hold_token).await
    }

    async fn release(&self, chart_key: &str, seats: &[SeatLabel]) -> Result<(), AuthorityError> {
        retry_if(
            &self.policy,
            "authority.release",
            || self.inner.release(chart_key, seats),
            AuthorityError::is_transient,
        )
        .await
    }
}
