//! Payment intents and gateway callbacks.
//!
//! A callback may arrive late, twice, concurrently, or for a checkout that
//! was canceled meanwhile. It is applied at most once: a settled payment
//! short-circuits, concurrent finalizations are serialized by the saga log,
//! and ticket issuance and payout accrual are keyed so a replay is a no-op.

use crate::config::CheckoutConfig;
use crate::environment::CheckoutEnvironment;
use crate::finalize::{FinalizeFailure, Finalizer};
use crate::gateway::{GatewayError, PaymentGateway, RedirectRequest};
use crate::policy::{FeeSplit, SeatPricing};
use crate::saga::SagaCursor;
use boxoffice_core::error::ReservationError;
use boxoffice_core::ids::{CheckoutId, PaymentId, UserId};
use boxoffice_core::model::{
    CheckoutStatus, GatewayMetadata, Payment, PaymentDraft, PaymentStatus,
};
use boxoffice_core::money::Money;
use boxoffice_core::reconciliation::IssueKind;
use boxoffice_core::saga::{BookingStage, FinalizeVia, SagaStep};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// A payment the buyer can be redirected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    /// Payment
    pub payment_id: PaymentId,
    /// Reference the gateway echoes back
    pub reference: String,
    /// Amount to pay
    pub gross: Money,
    /// Signed gateway URL
    pub redirect_url: String,
    /// End of the payment window
    pub expires_at: DateTime<Utc>,
}

/// What a callback did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Signature missing or wrong; nothing touched
    InvalidSignature,
    /// No payment with that reference
    UnknownPayment,
    /// Replay of a callback already applied
    AlreadySettled,
    /// Echoed amount differs from the recorded gross; payment left `Pending`
    AmountMismatch,
    /// Gateway reports failure; payment `Failed`
    Declined,
    /// Payment settled and checkout finalized
    Settled,
    /// Checkout was already confirmed or paid
    AlreadyFinalized,
    /// Money taken for a canceled checkout; refund issue raised
    PaidAfterCancel,
    /// Money taken for a checkout confirmed without payment; refund issue
    /// raised, callback acknowledged since the checkout is finalized
    PaidAfterConfirm,
    /// Another finalization or cancel holds the checkout; retry later
    InFlight,
    /// Authority refused the booking; payment left `Pending`
    BookingRefused,
    /// Booked but not finalized locally; payment `Failed`, issue raised
    FinalizeFailed,
}

impl CallbackOutcome {
    /// Whether the callback is acknowledged as applied.
    #[must_use]
    pub const fn accepted(&self) -> bool {
        matches!(
            self,
            Self::AlreadySettled | Self::Settled | Self::AlreadyFinalized | Self::PaidAfterConfirm
        )
    }

    /// Metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::UnknownPayment => "unknown_payment",
            Self::AlreadySettled => "already_settled",
            Self::AmountMismatch => "amount_mismatch",
            Self::Declined => "declined",
            Self::Settled => "settled",
            Self::AlreadyFinalized => "already_finalized",
            Self::PaidAfterCancel => "paid_after_cancel",
            Self::PaidAfterConfirm => "paid_after_confirm",
            Self::InFlight => "in_flight",
            Self::BookingRefused => "booking_refused",
            Self::FinalizeFailed => "finalize_failed",
        }
    }
}

impl fmt::Display for CallbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Issues payment intents and applies gateway callbacks.
#[derive(Clone)]
pub struct PaymentReconciler {
    env: CheckoutEnvironment,
    config: CheckoutConfig,
    gateway: PaymentGateway,
}

impl PaymentReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(env: CheckoutEnvironment, config: CheckoutConfig) -> Self {
        let gateway = PaymentGateway::new(config.gateway.clone());
        Self {
            env,
            config,
            gateway,
        }
    }

    /// The gateway codec in use.
    #[must_use]
    pub const fn gateway(&self) -> &PaymentGateway {
        &self.gateway
    }

    /// Price the checkout, create or refresh its payment, extend its seat
    /// locks and cache to the payment window, and sign a redirect.
    ///
    /// Requesting an intent again reuses the payment and its reference.
    ///
    /// # Errors
    ///
    /// - `NotFound`, `Unauthorized`
    /// - `InvalidState`: checkout not `Init`, being finalized or canceled, or
    ///   its payment already succeeded
    /// - `NotFound`: a seat has no ticket class under the configured policy
    /// - `Conflict`: a seat lock lapsed
    /// - `Expired`: the checkout cache lapsed
    pub async fn create_payment_intent(
        &self,
        checkout_id: CheckoutId,
        user_id: UserId,
        return_url: &str,
        notify_url: &str,
    ) -> Result<PaymentIntent, ReservationError> {
        let env = &self.env;
        let reservation = &self.config.reservation;
        let checkout = env
            .checkouts
            .find(checkout_id)
            .await?
            .ok_or_else(|| ReservationError::NotFound(format!("checkout {checkout_id}")))?;
        if !checkout.is_owned_by(user_id) {
            return Err(ReservationError::Unauthorized);
        }
        if checkout.status != CheckoutStatus::Init {
            return Err(ReservationError::invalid_state(
                CheckoutStatus::Init,
                checkout.status,
            ));
        }

        let mut saga = SagaCursor::load(env.saga.as_ref(), checkout_id).await?;
        if saga.progress().cancel_requested || saga.progress().is_closed() {
            return Err(ReservationError::invalid_state(CheckoutStatus::Init, "canceling"));
        }
        if saga.progress().booking_in_flight() {
            return Err(ReservationError::invalid_state(CheckoutStatus::Init, "finalizing"));
        }

        let existing = env.payments.find_by_checkout(checkout_id).await?;
        if let Some(payment) = &existing {
            if payment.status == PaymentStatus::Success {
                return Err(ReservationError::invalid_state(
                    PaymentStatus::Pending,
                    PaymentStatus::Success,
                ));
            }
        }

        let seats = env
            .catalog
            .find_seats(checkout.session_id, &checkout.seats)
            .await?;
        let classes = env.catalog.ticket_classes(checkout.session_id).await?;
        let pricing = SeatPricing::resolve(
            reservation.ticket_class_policy,
            &checkout.seats,
            &seats,
            &classes,
        );
        if !pricing.unresolved.is_empty() {
            return Err(ReservationError::NotFound(format!(
                "ticket class for seats {:?} under policy {}",
                pricing
                    .unresolved
                    .iter()
                    .map(|seat| seat.as_str())
                    .collect::<Vec<_>>(),
                reservation.ticket_class_policy
            )));
        }
        let gross = pricing.gross().ok_or_else(|| {
            ReservationError::InvalidRequest("checkout total overflows".to_string())
        })?;

        let window = reservation.payment_window();
        if !env
            .locks
            .extend_all(checkout.session_id, &checkout.seats, checkout_id, window)
            .await?
        {
            return Err(ReservationError::Conflict(format!(
                "seat locks of checkout {checkout_id} lapsed"
            )));
        }
        if !env.cache.extend(checkout_id, window).await? {
            return Err(ReservationError::Expired);
        }

        let now = env.now();
        let expires_at =
            now + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        // Recorded before the saga step so a reaper that sees the intent also
        // sees the window.
        if !env
            .checkouts
            .extend_payment_deadline(checkout_id, expires_at, now)
            .await?
        {
            return Err(ReservationError::invalid_state(CheckoutStatus::Init, "closed"));
        }

        let split = FeeSplit::of(gross);
        let draft_id = PaymentId::new();
        let payment = env
            .payments
            .upsert_intent(&PaymentDraft {
                id: draft_id,
                checkout_id,
                user_id,
                session_id: checkout.session_id,
                reference: draft_id.as_uuid().simple().to_string(),
                gross: split.gross,
                platform_fee: split.platform_fee,
                organizer_amount: split.organizer_amount,
                at: now,
            })
            .await?;

        saga.append(
            env.saga.as_ref(),
            vec![SagaStep::PaymentIntentIssued {
                payment_id: payment.id,
                reference: payment.reference.clone(),
                gross: payment.gross,
            }],
            now,
        )
        .await?;

        let redirect_url = self
            .gateway
            .redirect_url(&RedirectRequest {
                reference: payment.reference.clone(),
                gross: payment.gross,
                order_info: format!("Checkout {checkout_id} ({} seats)", checkout.seats.len()),
                return_url: return_url.to_string(),
                notify_url: notify_url.to_string(),
                created_at: now,
                expires_at,
            })
            .map_err(|e| ReservationError::InvalidRequest(e.to_string()))?;

        tracing::info!(
            checkout_id = %checkout_id,
            payment_id = %payment.id,
            gross = %payment.gross,
            reused = existing.is_some(),
            "Payment intent issued"
        );
        Ok(PaymentIntent {
            payment_id: payment.id,
            reference: payment.reference,
            gross: payment.gross,
            redirect_url,
            expires_at,
        })
    }

    /// Apply a gateway callback. Returns `true` when the payment is settled
    /// and the checkout finalized (now or by an earlier delivery).
    ///
    /// Safe to call any number of times with the same payload.
    pub async fn handle_callback(&self, fields: &BTreeMap<String, String>) -> bool {
        match self.reconcile(fields).await {
            Ok(outcome) => {
                crate::metrics::record_callback(outcome.as_str());
                tracing::info!(outcome = %outcome, "Payment callback handled");
                outcome.accepted()
            },
            Err(e) => {
                crate::metrics::record_callback("error");
                tracing::error!(error = %e, "Payment callback failed");
                false
            },
        }
    }

    /// Apply a gateway callback and report what happened.
    ///
    /// # Errors
    ///
    /// Returns store errors met before the outcome was decided.
    pub async fn reconcile(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<CallbackOutcome, ReservationError> {
        let env = &self.env;
        let callback = match self.gateway.verify(fields) {
            Ok(callback) => callback,
            Err(e @ (GatewayError::InvalidSignature | GatewayError::MissingField(_))) => {
                tracing::warn!(error = %e, "Rejected unsigned or tampered callback");
                return Ok(CallbackOutcome::InvalidSignature);
            },
            Err(e) => return Err(ReservationError::IntegrityFailure(e.to_string())),
        };

        let Some(payment) = env.payments.find_by_reference(&callback.reference).await? else {
            tracing::warn!(reference = %callback.reference, "Callback for unknown payment");
            return Ok(CallbackOutcome::UnknownPayment);
        };
        if payment.status == PaymentStatus::Success && payment.verified {
            return Ok(CallbackOutcome::AlreadySettled);
        }

        let expected = self
            .gateway
            .gateway_amount(payment.gross)
            .map_err(|e| ReservationError::IntegrityFailure(e.to_string()))?;
        if callback.amount != expected {
            tracing::warn!(
                payment_id = %payment.id,
                expected,
                received = callback.amount,
                "Callback amount mismatch"
            );
            return Ok(CallbackOutcome::AmountMismatch);
        }

        if !callback.success {
            if payment.status == PaymentStatus::Pending {
                let code = callback.metadata.response_code.clone().unwrap_or_default();
                env.payments
                    .mark_failed(
                        payment.id,
                        payment.version,
                        &format!("declined by gateway (response code {code})"),
                        Some(&callback.metadata),
                        env.now(),
                    )
                    .await?;
            }
            tracing::info!(payment_id = %payment.id, "Payment declined");
            return Ok(CallbackOutcome::Declined);
        }

        self.finalize_paid(payment, &callback.metadata).await
    }

    async fn finalize_paid(
        &self,
        payment: Payment,
        metadata: &GatewayMetadata,
    ) -> Result<CallbackOutcome, ReservationError> {
        let env = &self.env;
        let checkout = env
            .checkouts
            .find(payment.checkout_id)
            .await?
            .ok_or_else(|| {
                ReservationError::NotFound(format!("checkout {}", payment.checkout_id))
            })?;
        if checkout.status == CheckoutStatus::Confirmed {
            // Booked without this payment; the money has nothing to pay for.
            self.refund_required(
                &payment,
                metadata,
                IssueKind::PaidAfterConfirm,
                "paid after checkout was confirmed without payment",
            )
            .await?;
            return Ok(CallbackOutcome::PaidAfterConfirm);
        }
        if checkout.status.is_finalized() {
            return Ok(CallbackOutcome::AlreadyFinalized);
        }

        let mut saga = SagaCursor::load(env.saga.as_ref(), checkout.id).await?;
        let canceled = checkout.status == CheckoutStatus::Canceled
            || saga.progress().cancel_requested;
        if canceled {
            self.refund_required(
                &payment,
                metadata,
                IssueKind::PaidAfterCancel,
                "paid after checkout was canceled",
            )
            .await?;
            return Ok(CallbackOutcome::PaidAfterCancel);
        }

        let via = FinalizeVia::Payment {
            payment_id: payment.id,
        };
        match saga.progress().booking {
            BookingStage::NotRequested => {},
            BookingStage::Confirmed(recorded) if recorded == via => {},
            BookingStage::Requested(_) | BookingStage::Confirmed(_) => {
                return Ok(CallbackOutcome::InFlight);
            },
        }

        let finalizer = Finalizer::new(env, self.config.reservation.ticket_class_policy);
        match finalizer.run(&checkout, &mut saga, via, Some(metadata)).await {
            Ok(_) => Ok(CallbackOutcome::Settled),
            Err(FinalizeFailure::BeforeBooking(ReservationError::Conflict(reason))) => {
                tracing::info!(checkout_id = %checkout.id, reason = %reason, "Finalization raced");
                Ok(CallbackOutcome::InFlight)
            },
            Err(FinalizeFailure::BeforeBooking(e)) => {
                tracing::error!(
                    checkout_id = %checkout.id,
                    payment_id = %payment.id,
                    error = %e,
                    "Paid checkout could not be booked"
                );
                Ok(CallbackOutcome::BookingRefused)
            },
            Err(failure @ FinalizeFailure::AfterBooking(_)) => {
                let e = failure.into_error();
                tracing::error!(
                    checkout_id = %checkout.id,
                    payment_id = %payment.id,
                    error = %e,
                    "Seats booked but paid checkout not finalized"
                );
                self.mark_failed_latest(
                    &payment,
                    &format!("finalization failed: {e}"),
                    Some(metadata),
                )
                .await;
                env.raise_issue(
                    IssueKind::FinalizeIncomplete,
                    checkout.id,
                    Some(payment.id),
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
                Ok(CallbackOutcome::FinalizeFailed)
            },
        }
    }

    /// The gateway took money the checkout no longer needs: fail the payment
    /// and ask an operator for a refund.
    async fn refund_required(
        &self,
        payment: &Payment,
        metadata: &GatewayMetadata,
        kind: IssueKind,
        reason: &str,
    ) -> Result<(), ReservationError> {
        tracing::error!(
            checkout_id = %payment.checkout_id,
            payment_id = %payment.id,
            gross = %payment.gross,
            kind = kind.as_str(),
            "Payment succeeded for a closed checkout; refund required"
        );
        if payment.status == PaymentStatus::Pending {
            self.env
                .payments
                .mark_failed(payment.id, payment.version, reason, Some(metadata), self.env.now())
                .await?;
        }
        self.env
            .raise_issue(
                kind,
                payment.checkout_id,
                Some(payment.id),
                format!("gateway settled {}: {reason}", payment.gross),
            )
            .await;
        Ok(())
    }

    /// Mark the payment `Failed` at whatever version it is now. A payment the
    /// finalization already settled stays `Success`; the raised issue and
    /// recovery finish the rest.
    async fn mark_failed_latest(
        &self,
        payment: &Payment,
        reason: &str,
        metadata: Option<&GatewayMetadata>,
    ) {
        let env = &self.env;
        let current = match env.payments.find_by_checkout(payment.checkout_id).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(payment_id = %payment.id, error = %e, "Failed to reload payment");
                return;
            },
        };
        if current.status == PaymentStatus::Success {
            tracing::debug!(payment_id = %current.id, "Payment already settled; leaving it");
            return;
        }
        if let Err(e) = env
            .payments
            .mark_failed(current.id, current.version, reason, metadata, env.now())
            .await
        {
            tracing::warn!(payment_id = %payment.id, error = %e, "Failed to mark payment failed");
        }
    }
}
