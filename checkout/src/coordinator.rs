//! Reservation coordinator: create, confirm, cancel and read checkouts.
//!
//! A checkout spans three stores that can disagree: the seat lock store, the
//! durable ledger and the seat-chart authority. Every step is recorded in the
//! saga log; a failure before the authority books the seats is compensated
//! on the spot, a failure after it is flagged and left to recovery.

use crate::config::ReservationConfig;
use crate::environment::CheckoutEnvironment;
use crate::finalize::{FinalizeFailure, Finalizer};
use crate::saga::SagaCursor;
use crate::teardown::tear_down;
use boxoffice_core::error::ReservationError;
use boxoffice_core::ids::{CheckoutId, SeatLabel, SessionId, TicketId, UserId};
use boxoffice_core::model::{
    Checkout, CheckoutStatus, CheckoutSummary, CheckoutView, PaymentStatus,
};
use boxoffice_core::reconciliation::IssueKind;
use boxoffice_core::saga::{CancelReason, FinalizeVia, SagaLogError, SagaStep};
use std::collections::HashSet;

/// A confirmed checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedCheckout {
    /// The checkout after confirmation
    pub checkout: CheckoutView,
    /// Tickets covering its seats
    pub tickets: Vec<TicketId>,
    /// Seats with no resolvable ticket class
    pub skipped: Vec<SeatLabel>,
}

/// Creates, confirms and cancels checkouts.
#[derive(Clone)]
pub struct ReservationCoordinator {
    env: CheckoutEnvironment,
    config: ReservationConfig,
}

impl ReservationCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub const fn new(env: CheckoutEnvironment, config: ReservationConfig) -> Self {
        Self { env, config }
    }

    /// Lock `seats` for `user_id`, hold them with the authority and open an
    /// `Init` checkout.
    ///
    /// Duplicate labels are collapsed, keeping the first occurrence.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: no seats, or more than the configured maximum
    /// - `NotFound` / `SeatsNotFound`: unknown or unsellable session, unknown seats
    /// - `Conflict`: a seat is locked by another checkout
    /// - `UpstreamFailure`: the authority failed or refused the hold
    /// - `Storage`: a store failed
    ///
    /// No seat lock is left held on error.
    pub async fn create_checkout(
        &self,
        user_id: UserId,
        session_id: SessionId,
        seats: &[SeatLabel],
    ) -> Result<CheckoutView, ReservationError> {
        let env = &self.env;
        let seats = dedupe(seats);
        if seats.is_empty() {
            return Err(ReservationError::InvalidRequest(
                "at least one seat is required".to_string(),
            ));
        }
        if seats.len() > self.config.max_seats_per_checkout {
            return Err(ReservationError::InvalidRequest(format!(
                "at most {} seats per checkout, got {}",
                self.config.max_seats_per_checkout,
                seats.len()
            )));
        }

        let session = env
            .catalog
            .find_session(session_id)
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("session {session_id}")))?;
        let chart_key = session.chart_key.ok_or_else(|| {
            ReservationError::NotFound(format!("seat chart for session {session_id}"))
        })?;
        if !env.authority.retrieve_session(&chart_key).await? {
            return Err(ReservationError::NotFound(format!(
                "seat chart {chart_key} on authority"
            )));
        }

        let known = env.catalog.find_seats(session_id, &seats).await?;
        if known.len() != seats.len() {
            let missing: Vec<SeatLabel> = seats
                .iter()
                .filter(|label| !known.iter().any(|seat| &seat.label == *label))
                .cloned()
                .collect();
            return Err(ReservationError::SeatsNotFound {
                expected: seats.len(),
                found: known.len(),
                missing,
            });
        }

        let checkout_id = CheckoutId::new();
        let acquired = env
            .locks
            .acquire_all(session_id, &seats, checkout_id, self.config.lock_ttl())
            .await?;
        if !acquired {
            crate::metrics::record_lock_conflict();
            tracing::info!(
                session_id = %session_id,
                seat_count = seats.len(),
                "Seat lock conflict"
            );
            return Err(ReservationError::Conflict("seat already locked".to_string()));
        }

        let mut checkout =
            Checkout::open(checkout_id, user_id, session_id, chart_key, seats, env.now());
        if let Err(e) = env.checkouts.insert(&checkout).await {
            self.release_locks(&checkout).await;
            return Err(e.into());
        }

        let mut saga = SagaCursor::fresh(checkout_id);
        if let Err(e) = saga
            .append(
                env.saga.as_ref(),
                vec![
                    SagaStep::LocksAcquired {
                        seats: checkout.seats.clone(),
                    },
                    SagaStep::CheckoutOpened,
                ],
                env.now(),
            )
            .await
        {
            self.release_locks(&checkout).await;
            return Err(e.into());
        }

        if let Err(e) = self.hold_seats(&mut checkout, &mut saga).await {
            self.compensate_create(&checkout, &mut saga, &e).await;
            return Err(e);
        }

        crate::metrics::record_checkout_created(checkout.seats.len());
        tracing::info!(
            checkout_id = %checkout.id,
            session_id = %session_id,
            seat_count = checkout.seats.len(),
            "Checkout created"
        );
        Ok(checkout.view())
    }

    /// Hold the seats with the authority and cache the checkout summary.
    async fn hold_seats(
        &self,
        checkout: &mut Checkout,
        saga: &mut SagaCursor,
    ) -> Result<(), ReservationError> {
        let env = &self.env;
        let hold = env.authority.create_hold(self.config.hold_ttl()).await?;
        let now = env.now();
        checkout.version = env
            .checkouts
            .attach_hold(checkout.id, &hold, checkout.version, now)
            .await?;
        checkout.updated_at = now;
        checkout.hold = Some(hold.clone());

        env.authority
            .hold(&checkout.chart_key, &checkout.seats, &hold.token)
            .await?;
        saga.append(
            env.saga.as_ref(),
            vec![
                SagaStep::HoldCreated {
                    token: hold.token,
                    expires_at: hold.expires_at,
                },
                SagaStep::SeatsHeld,
            ],
            env.now(),
        )
        .await?;

        env.cache
            .put(&CheckoutSummary::from(&*checkout), self.config.hold_ttl())
            .await?;
        Ok(())
    }

    /// Undo a partially created checkout. The row stays `Init` for the hold
    /// reaper.
    async fn compensate_create(
        &self,
        checkout: &Checkout,
        saga: &mut SagaCursor,
        error: &ReservationError,
    ) {
        let env = &self.env;
        tracing::warn!(
            checkout_id = %checkout.id,
            error = %error,
            "Checkout creation failed; releasing seat locks"
        );

        let mut steps = vec![SagaStep::HoldFailed {
            reason: error.to_string(),
        }];
        if saga.progress().seats_held {
            match env.authority.release(&checkout.chart_key, &checkout.seats).await {
                Ok(()) => steps.push(SagaStep::AuthorityReleased),
                Err(e) => {
                    tracing::warn!(
                        checkout_id = %checkout.id,
                        error = %e,
                        "Authority release failed"
                    );
                    steps.push(SagaStep::AuthorityReleaseFailed {
                        reason: e.to_string(),
                    });
                },
            }
        }
        if self.release_locks(checkout).await {
            steps.push(SagaStep::LocksReleased);
        }
        saga.append_or_warn(env.saga.as_ref(), steps, env.now()).await;
    }

    async fn release_locks(&self, checkout: &Checkout) -> bool {
        match self
            .env
            .locks
            .release_all(checkout.session_id, &checkout.seats, checkout.id)
            .await
        {
            Ok(released) => {
                tracing::debug!(checkout_id = %checkout.id, released, "Seat locks released");
                true
            },
            Err(e) => {
                tracing::warn!(
                    checkout_id = %checkout.id,
                    error = %e,
                    "Failed to release seat locks; they will lapse"
                );
                false
            },
        }
    }

    /// Book the checkout's seats without a gateway payment.
    ///
    /// # Errors
    ///
    /// - `NotFound`, `Unauthorized`
    /// - `InvalidState`: the checkout is not `Init`, or a gateway payment is
    ///   open or settled for it
    /// - `Expired`: the checkout cache lapsed
    /// - `Conflict`: a seat lock lapsed or changed owner, or a concurrent
    ///   finalize or cancel won
    /// - `UpstreamFailure`: the authority refused the booking (nothing changed)
    /// - any error after booking; the checkout is then flagged for recovery
    pub async fn confirm_checkout(
        &self,
        checkout_id: CheckoutId,
        user_id: UserId,
    ) -> Result<ConfirmedCheckout, ReservationError> {
        let env = &self.env;
        let checkout = self.owned_checkout(checkout_id, user_id).await?;
        if checkout.status != CheckoutStatus::Init {
            return Err(ReservationError::invalid_state(
                CheckoutStatus::Init,
                checkout.status,
            ));
        }
        if env.cache.get(checkout_id).await?.is_none() {
            return Err(ReservationError::Expired);
        }
        for seat in &checkout.seats {
            if env.locks.lock_owner(checkout.session_id, seat).await? != Some(checkout_id) {
                return Err(ReservationError::Conflict(format!(
                    "seat {seat} is no longer locked by checkout {checkout_id}"
                )));
            }
        }

        let mut saga = SagaCursor::load(env.saga.as_ref(), checkout_id).await?;
        if saga.progress().cancel_requested || saga.progress().is_closed() {
            return Err(ReservationError::Conflict(format!(
                "checkout {checkout_id} is being canceled"
            )));
        }
        // A checkout with money in flight is finished by its callback.
        if let Some(payment) = env.payments.find_by_checkout(checkout_id).await? {
            if payment.status != PaymentStatus::Failed {
                return Err(ReservationError::invalid_state(
                    "no open payment",
                    format!("payment {}", payment.status),
                ));
            }
        }

        let finalizer = Finalizer::new(env, self.config.ticket_class_policy);
        match finalizer
            .run(&checkout, &mut saga, FinalizeVia::Confirm, None)
            .await
        {
            Ok(report) => Ok(ConfirmedCheckout {
                checkout: CheckoutView {
                    status: report.status,
                    ..checkout.view()
                },
                tickets: report.tickets,
                skipped: report.skipped,
            }),
            Err(FinalizeFailure::BeforeBooking(e)) => Err(e),
            Err(FinalizeFailure::AfterBooking(e)) => {
                tracing::error!(
                    checkout_id = %checkout_id,
                    error = %e,
                    "Seats booked but checkout not finalized"
                );
                env.raise_issue(
                    IssueKind::FinalizeIncomplete,
                    checkout_id,
                    None,
                    e.to_string(),
                )
                .await;
                saga.append_or_warn(
                    env.saga.as_ref(),
                    vec![SagaStep::ReconciliationRequired {
                        reason: e.to_string(),
                    }],
                    env.now(),
                )
                .await;
                Err(e)
            },
        }
    }

    /// Cancel an `Init` checkout.
    ///
    /// Returns `false` without changing anything if the checkout is no longer
    /// `Init` or a booking for it is in flight.
    ///
    /// # Errors
    ///
    /// - `NotFound`, `Unauthorized`
    /// - `Storage` if the checkout could not be moved to `Canceled`
    pub async fn cancel_checkout(
        &self,
        checkout_id: CheckoutId,
        user_id: UserId,
    ) -> Result<bool, ReservationError> {
        let env = &self.env;
        let checkout = self.owned_checkout(checkout_id, user_id).await?;
        if checkout.status != CheckoutStatus::Init {
            tracing::debug!(
                checkout_id = %checkout_id,
                status = %checkout.status,
                "Cancel ignored"
            );
            return Ok(false);
        }

        let mut saga = SagaCursor::load(env.saga.as_ref(), checkout_id).await?;
        if saga.progress().is_closed() || saga.progress().booking_in_flight() {
            tracing::info!(checkout_id = %checkout_id, "Cancel refused; booking in flight");
            return Ok(false);
        }

        if !saga.progress().cancel_requested {
            let claimed = saga
                .append(
                    env.saga.as_ref(),
                    vec![SagaStep::CancelRequested {
                        reason: CancelReason::Requested,
                    }],
                    env.now(),
                )
                .await;
            match claimed {
                Ok(()) => {},
                Err(SagaLogError::ConcurrencyConflict { .. }) => {
                    tracing::info!(checkout_id = %checkout_id, "Cancel lost race");
                    return Ok(false);
                },
                Err(e) => return Err(e.into()),
            }
        }

        tear_down(env, &checkout, &mut saga, CancelReason::Requested).await?;
        Ok(true)
    }

    /// The caller's own checkout.
    ///
    /// # Errors
    ///
    /// - `NotFound`, `Unauthorized`
    pub async fn get_checkout(
        &self,
        checkout_id: CheckoutId,
        user_id: UserId,
    ) -> Result<CheckoutView, ReservationError> {
        self.owned_checkout(checkout_id, user_id)
            .await
            .map(|checkout| checkout.view())
    }

    async fn owned_checkout(
        &self,
        checkout_id: CheckoutId,
        user_id: UserId,
    ) -> Result<Checkout, ReservationError> {
        let checkout = self
            .env
            .checkouts
            .find(checkout_id)
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("checkout {checkout_id}")))?;
        if !checkout.is_owned_by(user_id) {
            return Err(ReservationError::Unauthorized);
        }
        Ok(checkout)
    }
}

/// Drop repeated labels, keeping first-occurrence order.
fn dedupe(seats: &[SeatLabel]) -> Vec<SeatLabel> {
    let mut seen = HashSet::with_capacity(seats.len());
    seats
        .iter()
        .filter(|seat| seen.insert(*seat))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_core::ids::seat_labels;

    #[test]
    fn dedupe_keeps_first_occurrence_order() {
        assert_eq!(
            dedupe(&seat_labels(&["B2", "A1", "B2", "C3", "A1"])),
            seat_labels(&["B2", "A1", "C3"])
        );
    }
}
