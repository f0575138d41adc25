//! Integration tests for saga recovery and the hold reaper.

mod common;

use boxoffice_checkout::{CallbackOutcome, ReaperReport, RecoveryReport, Resumption};
use boxoffice_core::environment::Clock;
use boxoffice_core::ids::{CheckoutId, UserId, seat_labels};
use boxoffice_core::model::{CheckoutStatus, PaymentStatus};
use boxoffice_core::reconciliation::{IssueKind, IssueStatus};
use boxoffice_core::repository::LedgerRepository;
use boxoffice_core::saga::{FinalizeVia, SagaLog, SagaStep};
use boxoffice_testing::AuthorityOp;
use chrono::Duration;
use common::{Harness, NOTIFY_URL, RETURN_URL};
use std::collections::BTreeMap;

/// A paid callback whose local finalization failed after the authority
/// booked the seats.
async fn booked_but_not_finalized(h: &Harness) -> (CheckoutId, BTreeMap<String, String>) {
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
    let fields = h.callback(&intent.reference, h.gateway_amount(100_000), "00");

    h.store.fail_next_finalize(1);
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::FinalizeFailed
    );
    (view.id, fields)
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_failed_finalize_is_flagged() {
    let h = Harness::new();
    let (checkout_id, _) = booked_but_not_finalized(&h).await;

    let checkout = h.checkout(checkout_id).await;
    assert_eq!(checkout.status, CheckoutStatus::Init);
    assert!(h.authority.is_booked("S1", "A1"));
    assert_eq!(h.payment(checkout_id).await.status, PaymentStatus::Failed);
    assert!(h.store.tickets_for_session(checkout.session_id).is_empty());

    let issues = h.issues.all();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, IssueKind::FinalizeIncomplete);
    assert!(h.saga.step_types(checkout_id).contains(&"ReconciliationRequired.v1"));
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_recovery_completes_booked_checkout() {
    let h = Harness::new();
    let (checkout_id, fields) = booked_but_not_finalized(&h).await;
    let recovery = h.recovery();

    // Not idle long enough yet.
    assert_eq!(recovery.resume_pending(10).await.unwrap(), RecoveryReport::default());

    h.clock.advance(Duration::seconds(61));
    let report = recovery.resume_pending(10).await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            resumed: 1,
            escalated: 0,
            failed: 0,
        }
    );

    let checkout = h.checkout(checkout_id).await;
    assert_eq!(checkout.status, CheckoutStatus::Paid);
    let payment = h.payment(checkout_id).await;
    assert_eq!(payment.status, PaymentStatus::Success);
    assert!(payment.verified);
    assert_eq!(h.store.tickets_for_session(checkout.session_id).len(), 2);
    assert_eq!(h.held_locks(checkout.session_id), 0);
    let payout = h.store.payout(checkout.session_id).await.unwrap().unwrap();
    assert_eq!(payout.payments, 1);
    assert_eq!(h.authority.call_count(AuthorityOp::Book), 1);

    let issues = h.issues.all();
    assert_eq!(issues[0].status, IssueStatus::Resolved);
    assert_eq!(issues[0].resolved_by.as_deref(), Some("saga-recovery"));

    // Closed sagas are not picked up again, and a late redelivery is a no-op.
    h.clock.advance(Duration::seconds(61));
    assert_eq!(recovery.resume_pending(10).await.unwrap(), RecoveryReport::default());
    assert!(h.reconciler().handle_callback(&fields).await);
    assert_eq!(h.store.payout(checkout.session_id).await.unwrap().unwrap().payments, 1);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_recovery_failure_is_counted_and_retried() {
    let h = Harness::new();
    let (checkout_id, _) = booked_but_not_finalized(&h).await;
    let recovery = h.recovery();

    h.clock.advance(Duration::seconds(61));
    h.store.fail_next_finalize(1);
    let failed = recovery.resume_pending(10).await.unwrap();
    assert_eq!(failed.failed, 1);
    assert_eq!(h.issues.all()[0].occurrences, 2);

    h.clock.advance(Duration::seconds(61));
    assert_eq!(recovery.resume_pending(10).await.unwrap().resumed, 1);
    assert_eq!(h.checkout(checkout_id).await.status, CheckoutStatus::Paid);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_unconfirmed_booking_is_escalated() {
    let h = Harness::new();
    let session = h.seed_s1();
    let user = UserId::new();
    let coordinator = h.coordinator();
    let view = coordinator
        .create_checkout(user, session.id, &seat_labels(&["A1"]))
        .await
        .unwrap();

    // A process died between requesting the booking and recording its result.
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

    h.clock.advance(Duration::seconds(61));
    let report = h.recovery().resume_pending(10).await.unwrap();
    assert_eq!(report.escalated, 1);
    assert_eq!(h.authority.call_count(AuthorityOp::Book), 0);
    assert_eq!(h.saga.step_types(view.id).last(), Some(&"Escalated.v1"));
    assert_eq!(h.issues.all()[0].kind, IssueKind::BookingOutcomeUnknown);

    // Escalated sagas belong to the operator.
    assert_eq!(
        h.recovery().resume_checkout(view.id).await.unwrap(),
        Resumption::Skipped
    );
    assert!(!coordinator.cancel_checkout(view.id, user).await.unwrap());
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_reaper_expires_abandoned_checkout() {
    let h = Harness::new();
    let session = h.seed_s1();
    let view = h
        .coordinator()
        .create_checkout(UserId::new(), session.id, &seat_labels(&["A1", "A2"]))
        .await
        .unwrap();
    let reaper = h.reaper();

    h.clock.advance(Duration::seconds(100));
    assert_eq!(
        reaper.sweep(h.env.clock.now(), 100).await.unwrap(),
        ReaperReport::default()
    );

    h.clock.advance(Duration::seconds(801));
    let report = reaper.sweep(h.env.clock.now(), 100).await.unwrap();
    assert_eq!(
        report,
        ReaperReport {
            expired: 1,
            skipped: 0,
            failed: 0,
        }
    );

    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Canceled);
    assert_eq!(h.authority.call_count(AuthorityOp::Release), 1);
    assert_eq!(h.held_locks(session.id), 0);
    let steps = h.saga.step_types(view.id);
    assert!(steps.contains(&"AuthorityReleased.v1"));
    assert_eq!(steps.last(), Some(&"Expired.v1"));

    // Nothing left to reap.
    assert_eq!(
        reaper.sweep(h.env.clock.now(), 100).await.unwrap(),
        ReaperReport::default()
    );
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_reaper_fails_pending_payment_and_late_payment_is_flagged() {
    let h = Harness::new();
    let session = h.seed_s1();
    let user = UserId::new();
    let view = h
        .coordinator()
        .create_checkout(user, session.id, &seat_labels(&["A1"]))
        .await
        .unwrap();
    let intent = h
        .reconciler()
        .create_payment_intent(view.id, user, RETURN_URL, NOTIFY_URL)
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(901));
    assert_eq!(h.reaper().sweep(h.env.clock.now(), 100).await.unwrap().expired, 1);

    let payment = h.payment(view.id).await;
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_reason.as_deref(), Some("checkout expired"));

    let fields = h.callback(&intent.reference, h.gateway_amount(50_000), "00");
    assert_eq!(
        h.reconciler().reconcile(&fields).await.unwrap(),
        CallbackOutcome::PaidAfterCancel
    );
    assert_eq!(h.issues.all()[0].kind, IssueKind::PaidAfterCancel);
    assert!(h.store.tickets_for_session(session.id).is_empty());
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_reaper_leaves_booked_checkout_for_recovery() {
    let h = Harness::new();
    let (checkout_id, _) = booked_but_not_finalized(&h).await;

    h.clock.advance(Duration::seconds(901));
    let report = h.reaper().sweep(h.env.clock.now(), 100).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.expired, 0);
    assert_eq!(h.checkout(checkout_id).await.status, CheckoutStatus::Init);
    assert_eq!(h.authority.call_count(AuthorityOp::Release), 0);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_reaper_waits_out_payment_window() {
    let h = Harness::new();
    let session = h.seed_s1();
    let user = UserId::new();
    let view = h
        .coordinator()
        .create_checkout(user, session.id, &seat_labels(&["A1"]))
        .await
        .unwrap();
    let reaper = h.reaper();

    // Intent four minutes in: the window runs to minute 19.
    h.clock.advance(Duration::minutes(4));
    let intent = h
        .reconciler()
        .create_payment_intent(view.id, user, RETURN_URL, NOTIFY_URL)
        .await
        .unwrap();
    assert_eq!(h.checkout(view.id).await.payment_deadline, Some(intent.expires_at));

    // Past the hold TTL, inside the payment window.
    h.clock.advance(Duration::minutes(12));
    assert_eq!(
        reaper.sweep(h.env.clock.now(), 100).await.unwrap(),
        ReaperReport::default()
    );
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Init);
    assert_eq!(h.payment(view.id).await.status, PaymentStatus::Pending);
    assert_eq!(h.held_locks(session.id), 1);
    assert_eq!(h.authority.call_count(AuthorityOp::Release), 0);

    // A payment inside the window still lands.
    let fields = h.callback(&intent.reference, h.gateway_amount(50_000), "00");
    assert!(h.reconciler().handle_callback(&fields).await);
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Paid);
}

#[tokio::test]
#[allow(clippy::unwrap_used)]
async fn test_reaper_expires_once_payment_window_closes() {
    let h = Harness::new();
    let session = h.seed_s1();
    let user = UserId::new();
    let view = h
        .coordinator()
        .create_checkout(user, session.id, &seat_labels(&["A1"]))
        .await
        .unwrap();
    let reaper = h.reaper();

    h.clock.advance(Duration::minutes(4));
    h.reconciler()
        .create_payment_intent(view.id, user, RETURN_URL, NOTIFY_URL)
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(15));
    assert_eq!(reaper.sweep(h.env.clock.now(), 100).await.unwrap().expired, 0);

    h.clock.advance(Duration::seconds(1));
    assert_eq!(reaper.sweep(h.env.clock.now(), 100).await.unwrap().expired, 1);
    assert_eq!(h.checkout(view.id).await.status, CheckoutStatus::Canceled);
    let payment = h.payment(view.id).await;
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_reason.as_deref(), Some("checkout expired"));

    // Claimed before the payment was failed.
    let steps = h.saga.step_types(view.id);
    assert!(steps.contains(&"CancelRequested.v1"));
    assert_eq!(steps.last(), Some(&"Expired.v1"));
}
