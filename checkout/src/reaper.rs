//! Hold reaper.
//!
//! Cancels `Init` checkouts whose hold lapsed without a settled payment. Lock
//! TTLs free the seats locally on their own; the reaper closes the ledger row
//! and releases the authority hold, which would otherwise outlive the lock.

use crate::config::CheckoutConfig;
use crate::environment::CheckoutEnvironment;
use crate::saga::SagaCursor;
use crate::teardown::tear_down;
use boxoffice_core::error::ReservationError;
use boxoffice_core::model::{Checkout, CheckoutStatus, PaymentStatus};
use boxoffice_core::saga::{CancelReason, SagaLogError, SagaStep};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

/// Checkouts expired concurrently within one sweep.
const EXPIRE_CONCURRENCY: usize = 8;

/// Result of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperReport {
    /// Checkouts moved to `Canceled`
    pub expired: usize,
    /// Checkouts left alone (paid, being finalized, or claimed elsewhere)
    pub skipped: usize,
    /// Checkouts that could not be canceled
    pub failed: usize,
}

/// Sweeps abandoned checkouts.
#[derive(Clone)]
pub struct HoldReaper {
    env: CheckoutEnvironment,
    config: CheckoutConfig,
}

impl HoldReaper {
    /// Create a reaper.
    #[must_use]
    pub const fn new(env: CheckoutEnvironment, config: CheckoutConfig) -> Self {
        Self { env, config }
    }

    /// Expire up to `limit` checkouts abandoned as of `now`.
    ///
    /// A checkout is abandoned when its hold expired, or when it never got a
    /// hold and is older than the hold TTL. An open payment window postpones
    /// abandonment until the window closes.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if abandoned checkouts cannot be listed. Failures of
    /// individual checkouts are counted in the report.
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<ReaperReport, ReservationError> {
        let hold_ttl = chrono::Duration::from_std(self.config.reservation.hold_ttl())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let created_before = now - hold_ttl;
        let abandoned = self
            .env
            .checkouts
            .list_abandoned(now, created_before, limit)
            .await?;

        // Checkouts are independent; expire a few at a time.
        let outcomes: Vec<_> = stream::iter(abandoned)
            .map(|checkout| async move {
                let outcome = self.expire(&checkout, now, hold_ttl).await;
                (checkout.id, outcome)
            })
            .buffer_unordered(EXPIRE_CONCURRENCY)
            .collect()
            .await;

        let mut report = ReaperReport::default();
        for (checkout_id, outcome) in outcomes {
            match outcome {
                Ok(true) => report.expired += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        checkout_id = %checkout_id,
                        error = %e,
                        "Failed to expire checkout"
                    );
                    report.failed += 1;
                },
            }
        }

        if report != ReaperReport::default() {
            tracing::info!(
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "Hold reaper sweep finished"
            );
        }
        Ok(report)
    }

    async fn expire(
        &self,
        listed: &Checkout,
        now: DateTime<Utc>,
        hold_ttl: chrono::Duration,
    ) -> Result<bool, ReservationError> {
        let env = &self.env;
        let mut saga = SagaCursor::load(env.saga.as_ref(), listed.id).await?;
        if saga.progress().is_closed() || saga.progress().booking_in_flight() {
            tracing::debug!(checkout_id = %listed.id, "Saga busy or closed; not expiring");
            return Ok(false);
        }

        // The listing may predate a payment intent; decide on the current row.
        let Some(checkout) = env.checkouts.find(listed.id).await? else {
            return Ok(false);
        };
        if checkout.status != CheckoutStatus::Init || checkout.abandoned_after(hold_ttl) >= now {
            tracing::debug!(checkout_id = %checkout.id, "Checkout still live; not expiring");
            return Ok(false);
        }

        let payment = env.payments.find_by_checkout(checkout.id).await?;
        if let Some(payment) = payment.as_ref().filter(|p| p.status == PaymentStatus::Success) {
            tracing::warn!(
                checkout_id = %checkout.id,
                payment_id = %payment.id,
                "Abandoned checkout has a settled payment; leaving it for recovery"
            );
            return Ok(false);
        }

        if !saga.progress().cancel_requested {
            let claimed = saga
                .append(
                    env.saga.as_ref(),
                    vec![SagaStep::CancelRequested {
                        reason: CancelReason::HoldLapsed,
                    }],
                    env.now(),
                )
                .await;
            match claimed {
                Ok(()) => {},
                Err(SagaLogError::ConcurrencyConflict { .. }) => {
                    tracing::debug!(checkout_id = %checkout.id, "Expiry lost race");
                    return Ok(false);
                },
                Err(e) => return Err(e.into()),
            }
        }

        // Claimed: a callback settling from here on is routed to a refund.
        if let Some(payment) = payment.filter(|p| p.status == PaymentStatus::Pending) {
            if let Err(e) = env
                .payments
                .mark_failed(payment.id, payment.version, "checkout expired", None, env.now())
                .await
            {
                tracing::warn!(
                    checkout_id = %checkout.id,
                    payment_id = %payment.id,
                    error = %e,
                    "Failed to mark payment of expired checkout failed"
                );
            }
        }

        tear_down(env, &checkout, &mut saga, CancelReason::HoldLapsed).await?;
        Ok(true)
    }
}
