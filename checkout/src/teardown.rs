//! Cancellation of an `Init` checkout.
//!
//! Used by buyer cancel and by the hold reaper once either has claimed the
//! saga with a `CancelRequested` step.

use crate::environment::CheckoutEnvironment;
use crate::saga::SagaCursor;
use boxoffice_core::error::ReservationError;
use boxoffice_core::ids::SeatLabel;
use boxoffice_core::model::{Checkout, CheckoutStatus};
use boxoffice_core::saga::{CancelReason, SagaStep};

/// Release the authority hold (best effort) and the seat locks, then move
/// the checkout to `Canceled`.
pub(crate) async fn tear_down(
    env: &CheckoutEnvironment,
    checkout: &Checkout,
    saga: &mut SagaCursor,
    reason: CancelReason,
) -> Result<(), ReservationError> {
    let mut steps = Vec::new();

    if saga.progress().seats_held {
        let seats = releasable_seats(env, checkout).await;
        if !seats.is_empty() {
            match env.authority.release(&checkout.chart_key, &seats).await {
                Ok(()) => steps.push(SagaStep::AuthorityReleased),
                Err(e) => {
                    tracing::warn!(
                        checkout_id = %checkout.id,
                        error = %e,
                        "Authority release failed; continuing with local release"
                    );
                    steps.push(SagaStep::AuthorityReleaseFailed {
                        reason: e.to_string(),
                    });
                },
            }
        }
    }

    if !saga.progress().locks_released {
        match env
            .locks
            .release_all(checkout.session_id, &checkout.seats, checkout.id)
            .await
        {
            Ok(released) => {
                tracing::debug!(checkout_id = %checkout.id, released, "Seat locks released");
                steps.push(SagaStep::LocksReleased);
            },
            Err(e) => {
                tracing::warn!(
                    checkout_id = %checkout.id,
                    error = %e,
                    "Failed to release seat locks; they will lapse"
                );
            },
        }
    }

    env.checkouts
        .transition(
            checkout.id,
            CheckoutStatus::Init,
            CheckoutStatus::Canceled,
            checkout.version,
            env.now(),
        )
        .await?;

    if let Err(e) = env.cache.delete(checkout.id).await {
        tracing::warn!(checkout_id = %checkout.id, error = %e, "Failed to delete checkout cache");
    }

    let expired = reason == CancelReason::HoldLapsed;
    steps.push(if expired {
        SagaStep::Expired
    } else {
        SagaStep::Canceled
    });
    saga.append_or_warn(env.saga.as_ref(), steps, env.now()).await;

    crate::metrics::record_checkout_closed(CheckoutStatus::Canceled, expired);
    tracing::info!(
        checkout_id = %checkout.id,
        reason = ?reason,
        seat_count = checkout.seats.len(),
        "Checkout canceled"
    );
    Ok(())
}

/// Seats whose authority hold may be ours to release.
///
/// The authority releases by chart and label, not by hold token, so a seat
/// now locked by another checkout may carry that checkout's hold and is left
/// alone.
async fn releasable_seats(env: &CheckoutEnvironment, checkout: &Checkout) -> Vec<SeatLabel> {
    let mut seats = Vec::with_capacity(checkout.seats.len());
    for seat in &checkout.seats {
        match env.locks.lock_owner(checkout.session_id, seat).await {
            Ok(Some(owner)) if owner != checkout.id => {
                tracing::debug!(
                    checkout_id = %checkout.id,
                    seat = %seat,
                    owner = %owner,
                    "Seat relocked by another checkout; not releasing upstream"
                );
            },
            Ok(_) => seats.push(seat.clone()),
            Err(e) => {
                tracing::warn!(
                    checkout_id = %checkout.id,
                    seat = %seat,
                    error = %e,
                    "Cannot read seat lock; not releasing upstream"
                );
            },
        }
    }
    seats
}
