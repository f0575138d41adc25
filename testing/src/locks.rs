//! In-memory seat locks and checkout cache.

use crate::{lock, to_chrono};
use async_trait::async_trait;
use boxoffice_core::environment::Clock;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::{CheckoutId, SeatLabel, SessionId};
use boxoffice_core::locks::{CheckoutCache, SeatLockStore};
use boxoffice_core::model::CheckoutSummary;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type LockKey = (SessionId, SeatLabel);

#[derive(Debug, Default)]
struct LockState {
    locks: HashMap<LockKey, (CheckoutId, DateTime<Utc>)>,
    summaries: HashMap<CheckoutId, (CheckoutSummary, DateTime<Utc>)>,
}

/// Seat locks and checkout summaries expiring against a [`Clock`].
///
/// Every batch operation runs under one mutex, giving the same
/// all-or-nothing behavior as the Redis scripts.
#[derive(Clone)]
pub struct InMemorySeatLockStore {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<LockState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemorySeatLockStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(LockState::default())),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every call fail with [`StoreError::Cache`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Unexpired locks of a session (for assertions).
    #[must_use]
    pub fn held_locks(&self, session_id: SessionId) -> Vec<(SeatLabel, CheckoutId)> {
        let now = self.clock.now();
        let state = lock(&self.state);
        let mut held: Vec<_> = state
            .locks
            .iter()
            .filter(|((session, _), (_, expires_at))| *session == session_id && *expires_at > now)
            .map(|((_, seat), (owner, _))| (seat.clone(), *owner))
            .collect();
        held.sort();
        held
    }

    /// Expiry of a seat lock (for assertions).
    #[must_use]
    pub fn lock_expiry(&self, session_id: SessionId, seat: &SeatLabel) -> Option<DateTime<Utc>> {
        lock(&self.state)
            .locks
            .get(&(session_id, seat.clone()))
            .map(|(_, expires_at)| *expires_at)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Cache("lock store unavailable".to_string()));
        }
        Ok(())
    }

    fn live_owner(
        state: &LockState,
        now: DateTime<Utc>,
        session_id: SessionId,
        seat: &SeatLabel,
    ) -> Option<CheckoutId> {
        state
            .locks
            .get(&(session_id, seat.clone()))
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(owner, _)| *owner)
    }
}

#[async_trait]
impl SeatLockStore for InMemorySeatLockStore {
    async fn acquire_all(
        &self,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = lock(&self.state);

        if seats
            .iter()
            .any(|seat| Self::live_owner(&state, now, session_id, seat).is_some())
        {
            return Ok(false);
        }

        let expires_at = now + to_chrono(ttl);
        for seat in seats {
            state
                .locks
                .insert((session_id, seat.clone()), (owner, expires_at));
        }
        Ok(true)
    }

    async fn release_all(
        &self,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
    ) -> Result<usize, StoreError> {
        self.check_available()?;
        let mut state = lock(&self.state);
        let mut released = 0;
        for seat in seats {
            let key = (session_id, seat.clone());
            if state.locks.get(&key).is_some_and(|(holder, _)| *holder == owner) {
                state.locks.remove(&key);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn is_locked(&self, session_id: SessionId, seat: &SeatLabel) -> Result<bool, StoreError> {
        self.lock_owner(session_id, seat)
            .await
            .map(|owner| owner.is_some())
    }

    async fn lock_owner(
        &self,
        session_id: SessionId,
        seat: &SeatLabel,
    ) -> Result<Option<CheckoutId>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let state = lock(&self.state);
        Ok(Self::live_owner(&state, now, session_id, seat))
    }

    async fn extend_all(
        &self,
        session_id: SessionId,
        seats: &[SeatLabel],
        owner: CheckoutId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = lock(&self.state);

        if seats
            .iter()
            .any(|seat| Self::live_owner(&state, now, session_id, seat) != Some(owner))
        {
            return Ok(false);
        }

        let target = now + to_chrono(ttl);
        for seat in seats {
            if let Some((_, expires_at)) = state.locks.get_mut(&(session_id, seat.clone())) {
                if target > *expires_at {
                    *expires_at = target;
                }
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl CheckoutCache for InMemorySeatLockStore {
    async fn put(&self, summary: &CheckoutSummary, ttl: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        let expires_at = self.clock.now() + to_chrono(ttl);
        lock(&self.state)
            .summaries
            .insert(summary.checkout_id, (summary.clone(), expires_at));
        Ok(())
    }

    async fn get(&self, checkout_id: CheckoutId) -> Result<Option<CheckoutSummary>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(lock(&self.state)
            .summaries
            .get(&checkout_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(summary, _)| summary.clone()))
    }

    async fn extend(&self, checkout_id: CheckoutId, ttl: Duration) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let target = now + to_chrono(ttl);
        let mut state = lock(&self.state);
        match state.summaries.get_mut(&checkout_id) {
            Some((_, expires_at)) if *expires_at > now => {
                if target > *expires_at {
                    *expires_at = target;
                }
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn delete(&self, checkout_id: CheckoutId) -> Result<(), StoreError> {
        self.check_available()?;
        lock(&self.state).summaries.remove(&checkout_id);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use boxoffice_core::ids::seat_labels;

    fn store() -> (InMemorySeatLockStore, ManualClock) {
        let clock = ManualClock::default();
        (InMemorySeatLockStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn acquisition_is_all_or_nothing() {
        let (locks, _) = store();
        let session = SessionId::new();
        let first = CheckoutId::new();
        let second = CheckoutId::new();
        let ttl = Duration::from_secs(300);

        assert!(locks.acquire_all(session, &seat_labels(&["A1", "A2"]), first, ttl).await.unwrap());
        assert!(!locks.acquire_all(session, &seat_labels(&["A2", "A3"]), second, ttl).await.unwrap());
        assert!(!locks.is_locked(session, &SeatLabel::new("A3")).await.unwrap());
    }

    #[tokio::test]
    async fn locks_lapse_after_ttl() {
        let (locks, clock) = store();
        let session = SessionId::new();
        let owner = CheckoutId::new();
        let seats = seat_labels(&["A1"]);

        locks.acquire_all(session, &seats, owner, Duration::from_secs(300)).await.unwrap();
        clock.advance(chrono::Duration::seconds(301));

        assert!(!locks.is_locked(session, &seats[0]).await.unwrap());
        assert!(!locks.extend_all(session, &seats, owner, Duration::from_secs(900)).await.unwrap());
    }

    #[tokio::test]
    async fn extension_never_shortens() {
        let (locks, clock) = store();
        let session = SessionId::new();
        let owner = CheckoutId::new();
        let seats = seat_labels(&["A1"]);

        locks.acquire_all(session, &seats, owner, Duration::from_secs(900)).await.unwrap();
        let before = locks.lock_expiry(session, &seats[0]).unwrap();
        assert!(locks.extend_all(session, &seats, owner, Duration::from_secs(60)).await.unwrap());
        assert_eq!(locks.lock_expiry(session, &seats[0]).unwrap(), before);
        assert_eq!(before, clock.now() + chrono::Duration::seconds(900));
    }

    #[tokio::test]
    async fn release_is_owner_checked() {
        let (locks, _) = store();
        let session = SessionId::new();
        let owner = CheckoutId::new();
        let seats = seat_labels(&["A1", "A2"]);

        locks.acquire_all(session, &seats, owner, Duration::from_secs(300)).await.unwrap();
        assert_eq!(locks.release_all(session, &seats, CheckoutId::new()).await.unwrap(), 0);
        assert_eq!(locks.release_all(session, &seats, owner).await.unwrap(), 2);
        assert!(locks.held_locks(session).is_empty());
    }
}
