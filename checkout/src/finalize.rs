//! Booking and local finalization of a checkout.
//!
//! Shared by direct confirm, payment reconciliation and saga recovery. Each
//! step is skipped when the saga already records it, so running the same
//! finalization again after a crash completes it without repeating effects.

use crate::environment::CheckoutEnvironment;
use crate::policy::{SeatPricing, TicketClassPolicy};
use crate::saga::SagaCursor;
use boxoffice_core::error::ReservationError;
use boxoffice_core::ids::{SeatLabel, TicketId};
use boxoffice_core::model::{
    Checkout, CheckoutStatus, Finalization, GatewayMetadata, Payment, PaymentStatus,
    PayoutAccrual, Ticket,
};
use boxoffice_core::saga::{BookingStage, FinalizeVia, SagaStep};
use std::time::Instant;

/// What a finished finalization produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FinalizeReport {
    /// Final checkout status
    pub status: CheckoutStatus,
    /// Tickets covering the checkout's seats
    pub tickets: Vec<TicketId>,
    /// Seats left without a ticket
    pub skipped: Vec<SeatLabel>,
}

/// Where a finalization stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FinalizeFailure {
    /// Nothing irreversible happened; the checkout is unchanged upstream.
    BeforeBooking(ReservationError),
    /// The authority booked the seats; the local ledger is behind.
    AfterBooking(ReservationError),
}

impl FinalizeFailure {
    pub(crate) fn into_error(self) -> ReservationError {
        match self {
            Self::BeforeBooking(e) | Self::AfterBooking(e) => e,
        }
    }
}

pub(crate) struct Finalizer<'a> {
    env: &'a CheckoutEnvironment,
    policy: TicketClassPolicy,
}

impl<'a> Finalizer<'a> {
    pub(crate) const fn new(env: &'a CheckoutEnvironment, policy: TicketClassPolicy) -> Self {
        Self { env, policy }
    }

    /// Book `checkout` with the authority (unless the saga shows it booked)
    /// and finish the local side.
    ///
    /// `gateway` overrides the metadata stored on the payment when settling.
    pub(crate) async fn run(
        &self,
        checkout: &Checkout,
        saga: &mut SagaCursor,
        via: FinalizeVia,
        gateway: Option<&GatewayMetadata>,
    ) -> Result<FinalizeReport, FinalizeFailure> {
        let started = Instant::now();
        let via = self.book(checkout, saga, via).await?;

        let report = self
            .complete(checkout, saga, via, gateway)
            .await
            .map_err(FinalizeFailure::AfterBooking)?;

        crate::metrics::record_finalized(report.tickets.len(), started.elapsed().as_secs_f64());
        crate::metrics::record_checkout_closed(report.status, false);
        tracing::info!(
            checkout_id = %checkout.id,
            status = %report.status,
            tickets = report.tickets.len(),
            skipped = report.skipped.len(),
            "Checkout finalized"
        );
        Ok(report)
    }

    /// Irreversible half. Returns what drives the booking, which for a
    /// resumed saga is the recorded driver.
    async fn book(
        &self,
        checkout: &Checkout,
        saga: &mut SagaCursor,
        via: FinalizeVia,
    ) -> Result<FinalizeVia, FinalizeFailure> {
        match saga.progress().booking {
            BookingStage::Confirmed(recorded) => return Ok(recorded),
            BookingStage::Requested(_) => {
                return Err(FinalizeFailure::BeforeBooking(ReservationError::Conflict(
                    format!("booking of checkout {} already in flight", checkout.id),
                )));
            },
            BookingStage::NotRequested => {},
        }

        let env = self.env;
        saga.append(
            env.saga.as_ref(),
            vec![SagaStep::BookingRequested { via }],
            env.now(),
        )
        .await
        .map_err(|e| FinalizeFailure::BeforeBooking(e.into()))?;

        let hold_token = checkout.hold.as_ref().map(|hold| hold.token.as_str());
        if let Err(e) = env
            .authority
            .book(&checkout.chart_key, &checkout.seats, hold_token)
            .await
        {
            tracing::warn!(
                checkout_id = %checkout.id,
                error = %e,
                "Authority refused booking"
            );
            saga.append_or_warn(
                env.saga.as_ref(),
                vec![SagaStep::BookingFailed {
                    reason: e.to_string(),
                }],
                env.now(),
            )
            .await;
            return Err(FinalizeFailure::BeforeBooking(e.into()));
        }

        tracing::info!(
            checkout_id = %checkout.id,
            seat_count = checkout.seats.len(),
            "Seats booked with authority"
        );
        saga.append(env.saga.as_ref(), vec![SagaStep::BookingConfirmed], env.now())
            .await
            .map_err(|e| FinalizeFailure::AfterBooking(e.into()))?;
        Ok(via)
    }

    /// Local half: tickets and checkout status, payment, locks, payout.
    async fn complete(
        &self,
        checkout: &Checkout,
        saga: &mut SagaCursor,
        via: FinalizeVia,
        gateway: Option<&GatewayMetadata>,
    ) -> Result<FinalizeReport, ReservationError> {
        let env = self.env;
        let target = via.target_status();

        let (tickets, skipped) = if let Some(tickets) = saga.progress().tickets.clone() {
            (tickets, Vec::new())
        } else {
            self.issue_tickets(checkout, saga, target).await?
        };

        let payment = match via {
            FinalizeVia::Confirm => None,
            FinalizeVia::Payment { .. } => {
                Some(self.settle_payment(checkout, saga, gateway).await?)
            },
        };

        if !saga.progress().locks_released {
            self.release_locks(checkout, saga).await?;
        }

        if let Some(payment) = &payment {
            if !saga.progress().payout_accrued {
                let accrued = env
                    .ledger
                    .accrue_payout(&PayoutAccrual::for_payment(payment, env.now()))
                    .await?;
                if accrued {
                    crate::metrics::record_revenue(payment.gross.minor());
                } else {
                    tracing::debug!(payment_id = %payment.id, "Payout already accrued");
                }
                saga.append(
                    env.saga.as_ref(),
                    vec![SagaStep::PayoutAccrued {
                        payment_id: payment.id,
                    }],
                    env.now(),
                )
                .await?;
            }
        }

        saga.append(
            env.saga.as_ref(),
            vec![SagaStep::Completed { status: target }],
            env.now(),
        )
        .await?;

        Ok(FinalizeReport {
            status: target,
            tickets,
            skipped,
        })
    }

    async fn issue_tickets(
        &self,
        checkout: &Checkout,
        saga: &mut SagaCursor,
        target: CheckoutStatus,
    ) -> Result<(Vec<TicketId>, Vec<SeatLabel>), ReservationError> {
        let env = self.env;
        let seats = env
            .catalog
            .find_seats(checkout.session_id, &checkout.seats)
            .await?;
        let classes = env.catalog.ticket_classes(checkout.session_id).await?;
        let pricing = SeatPricing::resolve(self.policy, &checkout.seats, &seats, &classes);

        if !pricing.unresolved.is_empty() {
            tracing::warn!(
                checkout_id = %checkout.id,
                policy = %self.policy,
                seats = ?pricing.unresolved,
                "No ticket class for seats; skipping ticket issuance for them"
            );
        }

        let now = env.now();
        let tickets = pricing
            .priced
            .iter()
            .map(|priced| Ticket {
                id: TicketId::new(),
                checkout_id: checkout.id,
                session_id: checkout.session_id,
                user_id: checkout.user_id,
                seat: priced.seat.clone(),
                ticket_class_id: priced.class.id,
                price: priced.class.price,
                issued_at: now,
            })
            .collect();

        // The checkout row may be at the target already if a previous run
        // committed but failed to record it.
        let current = env
            .checkouts
            .find(checkout.id)
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("checkout {}", checkout.id)))?;

        let outcome = env
            .ledger
            .finalize(&Finalization {
                checkout_id: checkout.id,
                session_id: checkout.session_id,
                expected_version: current.version,
                target,
                tickets,
                at: now,
            })
            .await?;

        let taken = outcome.taken_elsewhere(checkout.id);
        if !taken.is_empty() {
            tracing::error!(
                checkout_id = %checkout.id,
                seats = ?taken,
                "Seats already ticketed to another checkout; not reporting them"
            );
        }

        let ticket_ids = outcome.ticket_ids(checkout.id);
        let mut skipped = pricing.unresolved;
        skipped.extend(taken);
        saga.append(
            env.saga.as_ref(),
            vec![SagaStep::TicketsIssued {
                tickets: ticket_ids.clone(),
                skipped: skipped.clone(),
            }],
            now,
        )
        .await?;
        Ok((ticket_ids, skipped))
    }

    async fn settle_payment(
        &self,
        checkout: &Checkout,
        saga: &mut SagaCursor,
        gateway: Option<&GatewayMetadata>,
    ) -> Result<Payment, ReservationError> {
        let env = self.env;
        let payment = env
            .payments
            .find_by_checkout(checkout.id)
            .await?
            .ok_or_else(|| {
                ReservationError::NotFound(format!("payment for checkout {}", checkout.id))
            })?;

        if payment.status == PaymentStatus::Success {
            if !saga.progress().payment_settled {
                saga.append(
                    env.saga.as_ref(),
                    vec![SagaStep::PaymentSettled {
                        payment_id: payment.id,
                    }],
                    env.now(),
                )
                .await?;
            }
            return Ok(payment);
        }

        // A payment marked failed by an earlier post-booking failure is
        // settled again here: the saga log proves the booking.
        if payment.status == PaymentStatus::Failed {
            tracing::info!(
                payment_id = %payment.id,
                "Settling payment marked failed after booking"
            );
        }
        let metadata = gateway.cloned().unwrap_or_else(|| payment.gateway.clone());
        let settled = env
            .payments
            .settle(payment.id, payment.version, &metadata, env.now())
            .await?;
        if !saga.progress().payment_settled {
            saga.append(
                env.saga.as_ref(),
                vec![SagaStep::PaymentSettled {
                    payment_id: settled.id,
                }],
                env.now(),
            )
            .await?;
        }
        Ok(settled)
    }

    async fn release_locks(
        &self,
        checkout: &Checkout,
        saga: &mut SagaCursor,
    ) -> Result<(), ReservationError> {
        let env = self.env;
        match env
            .locks
            .release_all(checkout.session_id, &checkout.seats, checkout.id)
            .await
        {
            Ok(released) => {
                tracing::debug!(checkout_id = %checkout.id, released, "Seat locks released");
            },
            Err(e) => {
                // Locks lapse on their own; the booking stands either way.
                tracing::warn!(
                    checkout_id = %checkout.id,
                    error = %e,
                    "Failed to release seat locks"
                );
            },
        }
        if let Err(e) = env.cache.delete(checkout.id).await {
            tracing::warn!(
                checkout_id = %checkout.id,
                error = %e,
                "Failed to delete checkout cache"
            );
        }
        saga.append(env.saga.as_ref(), vec![SagaStep::LocksReleased], env.now())
            .await?;
        Ok(())
    }
}
