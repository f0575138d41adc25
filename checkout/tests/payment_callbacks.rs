//! Integration tests for payment intents and gateway callbacks.

mod common;

use boxoffice_checkout::CallbackOutcome;
use boxoffice_core::error::{AuthorityError, ReservationError};
use boxoffice_core::environment::Clock;
use boxoffice_core::ids::{PaymentId, UserId, seat_labels};
use boxoffice_core::model::{
    CheckoutStatus, CheckoutView, PaymentDraft, PaymentStatus, SellableSession,
};
use boxoffice_core::money::Money;
use boxoffice_core::reconciliation::{IssueKind, IssueStatus};
use boxoffice_core::repository::{LedgerRepository, PaymentRepository};
use boxoffice_core::saga::{FinalizeVia, SagaLog, SagaStep};
use boxoffice_testing::AuthorityOp;
use chrono::Duration;
use common::{Harness, NOTIFY_URL, RETURN_URL};

/// A checkout for A1 and A2 (gross 100 000) with a payment intent.
async fn checkout_with_intent(h: &Harness) -> (SellableSession, UserId, CheckoutView, String) {
    let session = h.seed_s1();
    let user = UserId::new();
    let view = h
        .coordinator()
        .create_checkout(user, session.id, &seat_labels(&["A1", "A2"]))
        .await
        .unwrap();
    let intent = h
        .reconciler()
        .create_payment_intent(view.id, user, RETURN_URL, NOTIFY_URL)
        .await
        .unwrap();
    assert_eq!(intent.gross, Money::from_minor(100_000));
    (session, user, view, intent.reference)
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_successful_callback_finalizes_checkout() {
    let h = Harness::new();
    let (session, _, view, reference) = checkout_with_intent(&h).await;

    let fields = h.callback(&reference, h.gateway_amount(100_000), "00");
    assert!(h.reconciler().handle_callback(&fields).await);

    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Paid);
    let payment = h.payment(view.id).await;
    assert_eq!(payment.status, PaymentStatus::Success);
    assert!(payment.verified);
    assert_eq!(payment.gateway.transaction_no.as_deref(), Some("14123456"));
    assert_eq!(
        payment.gateway.extra.get("bank_code").map(String::as_str),
        Some("NCB")
    );

    assert_eq!(h.store.tickets_for_session(session.id).len(), 2);
    assert!(h.authority.is_booked("S1", "A1"));
    assert!(h.authority.is_booked("S1", "A2"));
    assert_eq!(h.held_locks(session.id), 0);

    let payout = h.store.payout(session.id).await.unwrap().unwrap();
    assert_eq!(payout.gross, Money::from_minor(100_000));
    assert_eq!(payout.platform_fee, Money::from_minor(20_000));
    assert_eq!(payout.organizer_amount, Money::from_minor(80_000));
    assert_eq!(payout.payments, 1);

    assert_eq!(h.saga.step_types(view.id).last(), Some(&"Completed.v1"));
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_duplicate_callback_applies_once() {
    let h = Harness::new();
    let (session, _, view, reference) = checkout_with_intent(&h).await;
    let reconciler = h.reconciler();
    let fields = h.callback(&reference, h.gateway_amount(100_000), "00");

    assert!(reconciler.handle_callback(&fields).await);
    assert!(reconciler.handle_callback(&fields).await);
    assert_eq!(
        reconciler.reconcile(&fields).await.unwrap(),
        CallbackOutcome::AlreadySettled
    );

    assert_eq!(h.store.payment_count(), 1);
    assert_eq!(h.payment(view.id).await.status, PaymentStatus::Success);
    assert_eq!(h.store.tickets_for_session(session.id).len(), 2);
    assert_eq!(h.store.payout(session.id).await.unwrap().unwrap().payments, 1);
    assert_eq!(h.authority.call_count(AuthorityOp::Book), 1);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_amount_mismatch_is_rejected() {
    let h = Harness::new();
    let (session, _, view, reference) = checkout_with_intent(&h).await;

    let fields = h.callback(&reference, h.gateway_amount(90_000), "00");
    assert!(!h.reconciler().handle_callback(&fields).await);
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::AmountMismatch
    );

    assert_eq!(h.payment(view.id).await.status, PaymentStatus::Pending);
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Init);
    assert!(h.store.tickets_for_session(session.id).is_empty());
    assert_eq!(h.authority.call_count(AuthorityOp::Book), 0);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_tampered_callback_is_rejected() {
    let h = Harness::new();
    let (_, _, view, reference) = checkout_with_intent(&h).await;

    let mut fields = h.callback(&reference, h.gateway_amount(100_000), "24");
    fields.insert("response_code".to_string(), "00".to_string());

    assert!(!h.reconciler().handle_callback(&fields).await);
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::InvalidSignature
    );
    assert_eq!(h.payment(view.id).await.status, PaymentStatus::Pending);

    fields.remove("secure_hash");
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::InvalidSignature
    );
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_declined_callback_fails_payment_only() {
    let h = Harness::new();
    let (session, _, view, reference) = checkout_with_intent(&h).await;

    let fields = h.callback(&reference, h.gateway_amount(100_000), "24");
    assert!(!h.reconciler().handle_callback(&fields).await);

    let payment = h.payment(view.id).await;
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.gateway.response_code.as_deref(), Some("24"));
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Init);
    assert_eq!(h.held_locks(session.id), 2);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_unknown_reference_is_ignored() {
    let h = Harness::new();
    let _ = checkout_with_intent(&h).await;

    let fields = h.callback("no-such-payment", h.gateway_amount(100_000), "00");
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::UnknownPayment
    );
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_intent_is_reused_on_request_again() {
    let h = Harness::new();
    let session = h.seed_s1();
    let user = UserId::new();
    let view = h
        .coordinator()
        .create_checkout(user, session.id, &seat_labels(&["A1"]))
        .await
        .unwrap();
    let reconciler = h.reconciler();

    let first = reconciler
        .create_payment_intent(view.id, user, RETURN_URL, NOTIFY_URL)
        .await
        .unwrap();
    let second = reconciler
        .create_payment_intent(view.id, user, RETURN_URL, NOTIFY_URL)
        .await
        .unwrap();

    assert_eq!(first.payment_id, second.payment_id);
    assert_eq!(first.reference, second.reference);
    assert_eq!(h.store.payment_count(), 1);
    assert!(first.redirect_url.starts_with(&h.config.gateway.pay_url));
    assert!(first.redirect_url.contains("amount=5000000"));
    assert!(first.redirect_url.contains("secure_hash="));
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_intent_extends_locks_to_payment_window() {
    let h = Harness::new();
    let session = h.seed_s1();
    let user = UserId::new();
    let view = h
        .coordinator()
        .create_checkout(user, session.id, &seat_labels(&["A1", "A2"]))
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(200));
    let intent = h
        .reconciler()
        .create_payment_intent(view.id, user, RETURN_URL, NOTIFY_URL)
        .await
        .unwrap();

    // Past the original lock TTL, inside the payment window.
    h.clock.advance(Duration::seconds(200));
    assert_eq!(h.held_locks(session.id), 2);

    let fields = h.callback(&intent.reference, h.gateway_amount(100_000), "00");
    assert!(h.reconciler().handle_callback(&fields).await);
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Paid);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_intent_after_lock_lapse_is_conflict() {
    let h = Harness::new();
    let session = h.seed_s1();
    let user = UserId::new();
    let view = h
        .coordinator()
        .create_checkout(user, session.id, &seat_labels(&["A1"]))
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(301));
    let result = h
        .reconciler()
        .create_payment_intent(view.id, user, RETURN_URL, NOTIFY_URL)
        .await;
    assert!(matches!(result, Err(ReservationError::Conflict(_))));
    assert_eq!(h.store.payment_count(), 0);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_payment_after_cancel_raises_refund_issue() {
    let h = Harness::new();
    let (session, user, view, reference) = checkout_with_intent(&h).await;
    assert!(h.coordinator().cancel_checkout(view.id, user).await.unwrap());

    let fields = h.callback(&reference, h.gateway_amount(100_000), "00");
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::PaidAfterCancel
    );
    assert!(!h.reconciler().handle_callback(&fields).await);

    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Canceled);
    assert_eq!(h.payment(view.id).await.status, PaymentStatus::Failed);
    assert!(h.store.tickets_for_session(session.id).is_empty());

    let issues = h.issues.all();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, IssueKind::PaidAfterCancel);
    assert_eq!(issues[0].status, IssueStatus::Open);
    assert_eq!(issues[0].occurrences, 2);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_refused_booking_can_be_retried() {
    let h = Harness::new();
    let (session, _, view, reference) = checkout_with_intent(&h).await;
    let fields = h.callback(&reference, h.gateway_amount(100_000), "00");

    h.authority.fail_next(
        AuthorityOp::Book,
        AuthorityError::Unavailable("gateway timeout".to_string()),
    );
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::BookingRefused
    );
    assert_eq!(h.payment(view.id).await.status, PaymentStatus::Pending);
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Init);
    assert!(h.saga.step_types(view.id).contains(&"BookingFailed.v1"));

    // The gateway redelivers.
    assert!(h.reconciler().handle_callback(&fields).await);
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Paid);
    assert_eq!(h.store.tickets_for_session(session.id).len(), 2);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_intent_refused_for_other_user_and_after_payment() {
    let h = Harness::new();
    let (_, user, view, reference) = checkout_with_intent(&h).await;
    let reconciler = h.reconciler();

    let stranger = reconciler
        .create_payment_intent(view.id, UserId::new(), RETURN_URL, NOTIFY_URL)
        .await;
    assert_eq!(stranger.unwrap_err(), ReservationError::Unauthorized);

    let fields = h.callback(&reference, h.gateway_amount(100_000), "00");
    assert!(reconciler.handle_callback(&fields).await);

    let paid = reconciler
        .create_payment_intent(view.id, user, RETURN_URL, NOTIFY_URL)
        .await;
    assert!(matches!(paid, Err(ReservationError::InvalidState { .. })));
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_callback_during_open_booking_is_in_flight() {
    let h = Harness::new();
    let (session, _, view, reference) = checkout_with_intent(&h).await;

    // Another driver requested the booking and has not recorded its outcome.
    let version = u64::try_from(h.saga.steps(view.id).len()).unwrap();
    h.saga
        .append(
            view.id,
            version,
            vec![SagaStep::BookingRequested {
                via: FinalizeVia::Confirm,
            }],
            h.env.clock.now(),
        )
        .await
        .unwrap();

    let fields = h.callback(&reference, h.gateway_amount(100_000), "00");
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::InFlight
    );
    assert!(!h.reconciler().handle_callback(&fields).await);

    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Init);
    assert_eq!(h.payment(view.id).await.status, PaymentStatus::Pending);
    assert!(h.store.tickets_for_session(session.id).is_empty());
    assert!(h.store.payout(session.id).await.unwrap().is_none());
    assert_eq!(h.authority.call_count(AuthorityOp::Book), 0);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_settled_payment_stays_settled_when_finalize_fails_late() {
    let h = Harness::new();
    let (session, _, view, reference) = checkout_with_intent(&h).await;
    let fields = h.callback(&reference, h.gateway_amount(100_000), "00");

    // Tickets issued and payment settled; the step after that is lost.
    h.saga.fail_append_of("LocksReleased.v1");
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::FinalizeFailed
    );

    let payment = h.payment(view.id).await;
    assert_eq!(payment.status, PaymentStatus::Success);
    assert!(payment.verified);
    assert!(payment.failure_reason.is_none());
    assert_eq!(h.store.tickets_for_session(session.id).len(), 2);
    assert!(h.store.payout(session.id).await.unwrap().is_none());

    let issues = h.issues.all();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, IssueKind::FinalizeIncomplete);
    assert!(h.saga.step_types(view.id).contains(&"ReconciliationRequired.v1"));

    // Recovery finishes the rest without touching the settled payment.
    h.clock.advance(Duration::seconds(61));
    assert_eq!(h.recovery().resume_pending(10).await.unwrap().resumed, 1);
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Paid);
    assert_eq!(h.payment(view.id).await.status, PaymentStatus::Success);
    assert_eq!(h.store.payout(session.id).await.unwrap().unwrap().payments, 1);
    assert_eq!(h.held_locks(session.id), 0);
    assert!(h.reconciler().handle_callback(&fields).await);
    assert_eq!(h.authority.call_count(AuthorityOp::Book), 1);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_confirm_is_refused_while_payment_is_open() {
    let h = Harness::new();
    let (session, user, view, reference) = checkout_with_intent(&h).await;

    let confirmed = h.coordinator().confirm_checkout(view.id, user).await;
    assert!(matches!(confirmed, Err(ReservationError::InvalidState { .. })));
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Init);
    assert_eq!(h.authority.call_count(AuthorityOp::Book), 0);

    // The callback still owns the checkout.
    let fields = h.callback(&reference, h.gateway_amount(100_000), "00");
    assert!(h.reconciler().handle_callback(&fields).await);
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Paid);
    assert_eq!(h.store.payout(session.id).await.unwrap().unwrap().payments, 1);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_payment_after_direct_confirm_raises_refund_issue() {
    let h = Harness::new();
    let session = h.seed_s1();
    let user = UserId::new();
    let view = h
        .coordinator()
        .create_checkout(user, session.id, &seat_labels(&["A1"]))
        .await
        .unwrap();
    h.coordinator().confirm_checkout(view.id, user).await.unwrap();

    // An intent that slipped in while the confirm was booking.
    let draft_id = PaymentId::new();
    let payment = h
        .store
        .upsert_intent(&PaymentDraft {
            id: draft_id,
            checkout_id: view.id,
            user_id: user,
            session_id: session.id,
            reference: draft_id.as_uuid().simple().to_string(),
            gross: Money::from_minor(50_000),
            platform_fee: Money::from_minor(10_000),
            organizer_amount: Money::from_minor(40_000),
            at: h.env.clock.now(),
        })
        .await
        .unwrap();

    let fields = h.callback(&payment.reference, h.gateway_amount(50_000), "00");
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::PaidAfterConfirm
    );
    assert!(h.reconciler().handle_callback(&fields).await);

    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Confirmed);
    let payment = h.payment(view.id).await;
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert!(payment.failure_reason.unwrap().contains("confirmed"));
    assert!(h.store.payout(session.id).await.unwrap().is_none());
    assert_eq!(h.store.tickets_for_session(session.id).len(), 1);

    let issues = h.issues.all();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, IssueKind::PaidAfterConfirm);
    assert_eq!(issues[0].occurrences, 2);
}
