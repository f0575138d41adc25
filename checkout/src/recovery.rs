//! Saga recovery.
//!
//! Finishes checkouts whose seats were booked with the authority but whose
//! local finalization never completed. Every finalize step is idempotent
//! (tickets are unique per seat, the checkout update accepts the already
//! finalized state, payouts are keyed by payment), so replaying from the saga
//! log cannot apply an effect twice.
//!
//! A booking that was requested but never confirmed is not retried: the
//! authority cannot tell us whether it went through, so the checkout goes to
//! an operator instead.

use crate::config::CheckoutConfig;
use crate::environment::CheckoutEnvironment;
use crate::finalize::Finalizer;
use crate::saga::SagaCursor;
use boxoffice_core::error::ReservationError;
use boxoffice_core::ids::CheckoutId;
use boxoffice_core::reconciliation::{IssueKind, IssueStatus};
use boxoffice_core::saga::{BookingStage, FinalizeVia, SagaStep};

/// Who closes issues that recovery resolved.
const RESOLVED_BY: &str = "saga-recovery";

/// Result of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sagas driven to completion
    pub resumed: usize,
    /// Sagas handed to an operator
    pub escalated: usize,
    /// Sagas that failed again
    pub failed: usize,
}

/// What happened to one saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resumption {
    /// Finalization completed
    Resumed,
    /// Booking outcome unknown; escalated
    Escalated,
    /// Nothing to do (closed, or no booking requested)
    Skipped,
}

/// Resumes stalled checkout sagas.
#[derive(Clone)]
pub struct SagaRecovery {
    env: CheckoutEnvironment,
    config: CheckoutConfig,
}

impl SagaRecovery {
    /// Create a recovery worker.
    #[must_use]
    pub const fn new(env: CheckoutEnvironment, config: CheckoutConfig) -> Self {
        Self { env, config }
    }

    /// Resume up to `limit` sagas that requested a booking, never closed, and
    /// have been idle for the configured recovery delay.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the stalled sagas cannot be listed. Failures of
    /// individual sagas are counted in the report.
    pub async fn resume_pending(&self, limit: usize) -> Result<RecoveryReport, ReservationError> {
        let env = &self.env;
        let idle = chrono::Duration::from_std(self.config.sweeps.recovery_idle())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let idle_since = env.now() - idle;
        let stalled = env.saga.stalled(idle_since, limit).await?;

        let mut report = RecoveryReport::default();
        for checkout_id in stalled {
            match self.resume_checkout(checkout_id).await {
                Ok(Resumption::Resumed) => report.resumed += 1,
                Ok(Resumption::Escalated) => report.escalated += 1,
                Ok(Resumption::Skipped) => {},
                Err(e) => {
                    tracing::error!(
                        checkout_id = %checkout_id,
                        error = %e,
                        "Saga recovery failed"
                    );
                    env.raise_issue(
                        IssueKind::FinalizeIncomplete,
                        checkout_id,
                        None,
                        format!("recovery failed: {e}"),
                    )
                    .await;
                    report.failed += 1;
                },
            }
        }

        if report != RecoveryReport::default() {
            tracing::info!(
                resumed = report.resumed,
                escalated = report.escalated,
                failed = report.failed,
                "Saga recovery pass finished"
            );
        }
        Ok(report)
    }

    /// Resume one checkout's saga.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped finalization again.
    pub async fn resume_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Resumption, ReservationError> {
        let env = &self.env;
        let mut saga = SagaCursor::load(env.saga.as_ref(), checkout_id).await?;
        if saga.progress().is_closed() {
            return Ok(Resumption::Skipped);
        }

        let via = match saga.progress().booking {
            BookingStage::NotRequested => return Ok(Resumption::Skipped),
            BookingStage::Requested(via) => {
                self.escalate(checkout_id, &mut saga, via).await?;
                return Ok(Resumption::Escalated);
            },
            BookingStage::Confirmed(via) => via,
        };

        let checkout = env
            .checkouts
            .find(checkout_id)
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("checkout {checkout_id}")))?;

        let finalizer = Finalizer::new(env, self.config.reservation.ticket_class_policy);
        let report = finalizer
            .run(&checkout, &mut saga, via, None)
            .await
            .map_err(crate::finalize::FinalizeFailure::into_error)?;

        tracing::info!(
            checkout_id = %checkout_id,
            status = %report.status,
            tickets = report.tickets.len(),
            "Stalled checkout finalized by recovery"
        );
        self.resolve_issues(checkout_id).await;
        Ok(Resumption::Resumed)
    }

    async fn escalate(
        &self,
        checkout_id: CheckoutId,
        saga: &mut SagaCursor,
        via: FinalizeVia,
    ) -> Result<(), ReservationError> {
        let env = &self.env;
        let payment_id = match via {
            FinalizeVia::Confirm => None,
            FinalizeVia::Payment { payment_id } => Some(payment_id),
        };
        let reason = "booking requested but its outcome was never recorded".to_string();
        env.raise_issue(
            IssueKind::BookingOutcomeUnknown,
            checkout_id,
            payment_id,
            reason.clone(),
        )
        .await;
        saga.append(
            env.saga.as_ref(),
            vec![SagaStep::Escalated { reason }],
            env.now(),
        )
        .await?;
        Ok(())
    }

    /// Close the open finalize issues of a checkout that is now complete.
    async fn resolve_issues(&self, checkout_id: CheckoutId) {
        let env = &self.env;
        let issues = match env.issues.list_for_checkout(checkout_id).await {
            Ok(issues) => issues,
            Err(e) => {
                tracing::warn!(checkout_id = %checkout_id, error = %e, "Failed to list issues");
                return;
            },
        };
        for issue in issues.iter().filter(|issue| {
            issue.status == IssueStatus::Open && issue.kind == IssueKind::FinalizeIncomplete
        }) {
            if let Err(e) = env
                .issues
                .close(
                    issue.id,
                    IssueStatus::Resolved,
                    RESOLVED_BY,
                    Some("finalization completed"),
                    env.now(),
                )
                .await
            {
                tracing::warn!(issue_id = issue.id, error = %e, "Failed to close issue");
            }
        }
    }
}
