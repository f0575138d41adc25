//! Transient per-seat locks and the checkout summary cache.
//!
//! A seat lock is the key `(session, seat)` mapped to the owning checkout with
//! a TTL. The TTL is the only timeout for abandoned checkouts, so every
//! operation that touches an existing lock is owner-checked.

use crate::error::StoreError;
use crate::ids::{CheckoutId, SeatLabel, SessionId};
use crate::model::CheckoutSummary;
use async_trait::async_trait;
use std::time::Duration;

/// Per-seat exclusive locks with TTL.
///
/// # Atomicity
///
/// `acquire_all` and `extend_all` operate on the whole seat set at once:
/// either every seat is locked (extended) or none is. Implementations must use
/// a single multi-key primitive (a Lua script, a single critical section), not
/// a loop of independent single-key calls.
#[async_trait]
pub trait SeatLockStore: Send + Sync {
    /// Lock every seat for `owner`, or none of them.
    ///
    /// Returns `false` (leaving nothing locked) if any seat holds an unexpired
    /// lock, including one held by `owner` itself.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cache`] if the store is unreachable.
    async fn acquire_all(
        &self,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release the seats still locked by `owner`. Locks held by anyone else
    /// are left alone. Returns how many locks were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cache`] if the store is unreachable.
    async fn release_all(
        &self,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
    ) -> Result<usize, StoreError>;

    /// Whether the seat has an unexpired lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cache`] if the store is unreachable.
    async fn is_locked(&self, session_id: SessionId, seat: &SeatLabel) -> Result<bool, StoreError>;

    /// The checkout holding the seat, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cache`] if the store is unreachable.
    async fn lock_owner(
        &self,
        session_id: SessionId,
        seat: &SeatLabel,
    ) -> Result<Option<CheckoutId>, StoreError>;

    /// Extend every lock to at least `ttl` from now, provided all of them are
    /// still held by `owner`. Never shortens a TTL.
    ///
    /// Returns `false` (changing nothing) if any lock lapsed or belongs to
    /// someone else.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cache`] if the store is unreachable.
    async fn extend_all(
        &self,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

/// Short-lived checkout summaries.
#[async_trait]
pub trait CheckoutCache: Send + Sync {
    /// Store (or replace) a summary.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the cache is unreachable or the summary
    /// cannot be encoded.
    async fn put(&self, summary: &CheckoutSummary, ttl: Duration) -> Result<(), StoreError>;

    /// Fetch a summary that has not expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the cache is unreachable or the entry is
    /// corrupt.
    async fn get(&self, checkout_id: CheckoutId) -> Result<Option<CheckoutSummary>, StoreError>;

    /// Extend the summary to at least `ttl` from now. Returns `false` if it
    /// already expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cache`] if the cache is unreachable.
    async fn extend(&self, checkout_id: CheckoutId, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop the summary.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cache`] if the cache is unreachable.
    async fn delete(&self, checkout_id: CheckoutId) -> Result<(), StoreError>;
}
