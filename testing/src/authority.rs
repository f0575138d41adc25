//! In-memory seat-chart authority.

use crate::{lock, to_chrono};
use async_trait::async_trait;
use boxoffice_core::authority::SeatChartAuthority;
use boxoffice_core::environment::Clock;
use boxoffice_core::error::AuthorityError;
use boxoffice_core::ids::SeatLabel;
use boxoffice_core::model::HoldToken;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Authority operations, for failure injection and call assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthorityOp {
    /// `retrieve_session`
    RetrieveSession,
    /// `create_hold`
    CreateHold,
    /// `hold`
    Hold,
    /// `book`
    Book,
    /// `release`
    Release,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityCall {
    /// Operation
    pub op: AuthorityOp,
    /// Chart key, when the operation takes one
    pub chart_key: Option<String>,
    /// Seats, when the operation takes them
    pub seats: Vec<SeatLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SeatMark {
    Held(String),
    Booked,
}

#[derive(Debug, Default)]
struct AuthorityState {
    charts: HashSet<String>,
    seats: HashMap<(String, SeatLabel), SeatMark>,
    holds: HashMap<String, DateTime<Utc>>,
    next_token: u64,
    failures: HashMap<AuthorityOp, VecDeque<AuthorityError>>,
    calls: Vec<AuthorityCall>,
}

impl AuthorityState {
    fn take_failure(&mut self, op: AuthorityOp) -> Option<AuthorityError> {
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    /// Hold token of a seat, if the hold is still live.
    fn live_hold(&self, chart_key: &str, seat: &SeatLabel, now: DateTime<Utc>) -> Option<&str> {
        match self.seats.get(&(chart_key.to_string(), seat.clone())) {
            Some(SeatMark::Held(token))
                if self.holds.get(token).is_some_and(|expires_at| *expires_at > now) =>
            {
                Some(token.as_str())
            },
            _ => None,
        }
    }

    fn is_booked(&self, chart_key: &str, seat: &SeatLabel) -> bool {
        matches!(
            self.seats.get(&(chart_key.to_string(), seat.clone())),
            Some(SeatMark::Booked)
        )
    }
}

/// Seat-chart authority double.
///
/// Tracks held and booked seats per chart, expires holds against the clock,
/// records every call, and fails queued operations on demand.
#[derive(Clone)]
pub struct InMemoryAuthority {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<AuthorityState>>,
}

impl InMemoryAuthority {
    /// Create an authority with no charts.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(AuthorityState::default())),
        }
    }

    /// Register a chart session.
    pub fn add_chart(&self, chart_key: impl Into<String>) {
        lock(&self.state).charts.insert(chart_key.into());
    }

    /// Fail the next call of `op` with `error`. Calls queue up.
    pub fn fail_next(&self, op: AuthorityOp, error: AuthorityError) {
        lock(&self.state)
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Whether the seat is booked.
    #[must_use]
    pub fn is_booked(&self, chart_key: &str, seat: &str) -> bool {
        lock(&self.state).is_booked(chart_key, &SeatLabel::new(seat))
    }

    /// Whether the seat is under a live hold.
    #[must_use]
    pub fn is_held(&self, chart_key: &str, seat: &str) -> bool {
        let now = self.clock.now();
        lock(&self.state)
            .live_hold(chart_key, &SeatLabel::new(seat), now)
            .is_some()
    }

    /// Every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<AuthorityCall> {
        lock(&self.state).calls.clone()
    }

    /// Number of calls of `op`.
    #[must_use]
    pub fn call_count(&self, op: AuthorityOp) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| call.op == op)
            .count()
    }

    fn begin(
        state: &mut AuthorityState,
        op: AuthorityOp,
        chart_key: Option<&str>,
        seats: &[SeatLabel],
    ) -> Result<(), AuthorityError> {
        state.calls.push(AuthorityCall {
            op,
            chart_key: chart_key.map(str::to_string),
            seats: seats.to_vec(),
        });
        if let Some(error) = state.take_failure(op) {
            return Err(error);
        }
        if let Some(chart_key) = chart_key {
            if !state.charts.contains(chart_key) {
                return Err(AuthorityError::Rejected(format!("unknown chart {chart_key}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SeatChartAuthority for InMemoryAuthority {
    async fn retrieve_session(&self, chart_key: &str) -> Result<bool, AuthorityError> {
        let mut state = lock(&self.state);
        Self::begin(&mut state, AuthorityOp::RetrieveSession, None, &[])?;
        Ok(state.charts.contains(chart_key))
    }

    async fn create_hold(&self, ttl: Duration) -> Result<HoldToken, AuthorityError> {
        let expires_at = self.clock.now() + to_chrono(ttl);
        let mut state = lock(&self.state);
        Self::begin(&mut state, AuthorityOp::CreateHold, None, &[])?;
        state.next_token += 1;
        let token = format!("hold-{}", state.next_token);
        state.holds.insert(token.clone(), expires_at);
        Ok(HoldToken { token, expires_at })
    }

    async fn hold(
        &self,
        chart_key: &str,
        seats: &[SeatLabel],
        hold_token: &str,
    ) -> Result<(), AuthorityError> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        Self::begin(&mut state, AuthorityOp::Hold, Some(chart_key), seats)?;

        if !state.holds.get(hold_token).is_some_and(|expires_at| *expires_at > now) {
            return Err(AuthorityError::Rejected(format!("hold {hold_token} expired")));
        }
        for seat in seats {
            let other_hold = state
                .live_hold(chart_key, seat, now)
                .is_some_and(|token| token != hold_token);
            if other_hold || state.is_booked(chart_key, seat) {
                return Err(AuthorityError::Rejected(format!("seat {seat} not available")));
            }
        }
        for seat in seats {
            state.seats.insert(
                (chart_key.to_string(), seat.clone()),
                SeatMark::Held(hold_token.to_string()),
            );
        }
        Ok(())
    }

    async fn book(
        &self,
        chart_key: &str,
        seats: &[SeatLabel],
        hold_token: Option<&str>,
    ) -> Result<(), AuthorityError> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        Self::begin(&mut state, AuthorityOp::Book, Some(chart_key), seats)?;

        for seat in seats {
            if state.is_booked(chart_key, seat) {
                return Err(AuthorityError::Rejected(format!("seat {seat} already booked")));
            }
            if let Some(token) = state.live_hold(chart_key, seat, now) {
                if Some(token) != hold_token {
                    return Err(AuthorityError::Rejected(format!(
                        "seat {seat} held by another token"
                    )));
                }
            }
        }
        for seat in seats {
            state
                .seats
                .insert((chart_key.to_string(), seat.clone()), SeatMark::Booked);
        }
        Ok(())
    }

    async fn release(&self, chart_key: &str, seats: &[SeatLabel]) -> Result<(), AuthorityError> {
        let mut state = lock(&self.state);
        Self::begin(&mut state, AuthorityOp::Release, Some(chart_key), seats)?;
        for seat in seats {
            let key = (chart_key.to_string(), seat.clone());
            if matches!(state.seats.get(&key), Some(SeatMark::Held(_))) {
                state.seats.remove(&key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use boxoffice_core::ids::seat_labels;

    #[tokio::test]
    async fn booked_seats_cannot_be_held_again() {
        let clock = ManualClock::default();
        let authority = InMemoryAuthority::new(Arc::new(clock));
        authority.add_chart("S1");
        let seats = seat_labels(&["A1"]);

        let hold = authority.create_hold(Duration::from_secs(900)).await.unwrap();
        authority.hold("S1", &seats, &hold.token).await.unwrap();
        authority.book("S1", &seats, Some(&hold.token)).await.unwrap();
        assert!(authority.is_booked("S1", "A1"));

        let other = authority.create_hold(Duration::from_secs(900)).await.unwrap();
        assert!(authority.hold("S1", &seats, &other.token).await.is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_once() {
        let authority = InMemoryAuthority::new(Arc::new(ManualClock::default()));
        authority.add_chart("S1");
        authority.fail_next(
            AuthorityOp::RetrieveSession,
            AuthorityError::Unavailable("timeout".into()),
        );

        assert!(authority.retrieve_session("S1").await.is_err());
        assert!(authority.retrieve_session("S1").await.unwrap());
        assert_eq!(authority.call_count(AuthorityOp::RetrieveSession), 2);
    }

    #[tokio::test]
    async fn lapsed_holds_free_the_seat() {
        let clock = ManualClock::default();
        let authority = InMemoryAuthority::new(Arc::new(clock.clone()));
        authority.add_chart("S1");
        let seats = seat_labels(&["A1"]);

        let hold = authority.create_hold(Duration::from_secs(60)).await.unwrap();
        authority.hold("S1", &seats, &hold.token).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));

        assert!(!authority.is_held("S1", "A1"));
        let other = authority.create_hold(Duration::from_secs(60)).await.unwrap();
        authority.hold("S1", &seats, &other.token).await.unwrap();
    }
}
