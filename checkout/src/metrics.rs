//! Checkout metrics.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `boxoffice_checkouts_total{status}` - Checkouts by outcome (created, confirmed,
//!   paid, canceled, expired)
//! - `boxoffice_lock_conflicts_total` - Checkout requests refused because a seat was locked
//! - `boxoffice_callbacks_total{outcome}` - Gateway callbacks by outcome
//! - `boxoffice_tickets_issued_total` - Tickets issued
//! - `boxoffice_payment_revenue_minor_total` - Settled gross amount in minor units
//! - `boxoffice_reconciliation_issues_total{kind}` - Issues raised for operators
//!
//! ## Histograms
//! - `boxoffice_checkout_finalize_seconds` - Time spent finalizing a checkout

use boxoffice_core::model::CheckoutStatus;
use boxoffice_core::reconciliation::IssueKind;
use metrics::{describe_counter, describe_histogram};

/// Register all checkout metric descriptions.
///
/// Call once at startup, before any metric is recorded.
pub fn register_checkout_metrics() {
    describe_counter!(
        "boxoffice_checkouts_total",
        "Total number of checkouts by status (created, confirmed, paid, canceled, expired)"
    );
    describe_counter!(
        "boxoffice_lock_conflicts_total",
        "Checkout requests refused because a requested seat was already locked"
    );
    describe_counter!(
        "boxoffice_callbacks_total",
        "Payment gateway callbacks by outcome"
    );
    describe_counter!("boxoffice_tickets_issued_total", "Total number of tickets issued");
    describe_counter!(
        "boxoffice_payment_revenue_minor_total",
        "Gross amount of settled payments in minor currency units"
    );
    describe_counter!(
        "boxoffice_reconciliation_issues_total",
        "Reconciliation issues raised by kind"
    );
    describe_histogram!(
        "boxoffice_checkout_finalize_seconds",
        "Time taken to book seats and issue tickets for a checkout"
    );

    tracing::info!("Checkout metrics registered");
}

/// Record a checkout created.
pub fn record_checkout_created(seat_count: usize) {
    metrics::counter!("boxoffice_checkouts_total", "status" => "created").increment(1);
    tracing::debug!(seat_count, "Recorded checkout_created metric");
}

/// Record a checkout leaving `Init`.
///
/// `expired` distinguishes reaper cancellations from buyer cancellations.
pub fn record_checkout_closed(status: CheckoutStatus, expired: bool) {
    let label = if expired { "expired" } else { status.as_str() };
    metrics::counter!("boxoffice_checkouts_total", "status" => label).increment(1);
    tracing::debug!(status = label, "Recorded checkout_closed metric");
}

/// Record a lock conflict.
pub fn record_lock_conflict() {
    metrics::counter!("boxoffice_lock_conflicts_total").increment(1);
}

/// Record a handled callback.
pub fn record_callback(outcome: &'static str) {
    metrics::counter!("boxoffice_callbacks_total", "outcome" => outcome).increment(1);
    tracing::debug!(outcome, "Recorded callback metric");
}

/// Record a finished finalization.
///
/// # Arguments
///
/// * `tickets` - Tickets inserted by this finalization
/// * `duration_secs` - Time from booking request to completion
pub fn record_finalized(tickets: usize, duration_secs: f64) {
    metrics::counter!("boxoffice_tickets_issued_total")
        .increment(u64::try_from(tickets).unwrap_or(u64::MAX));
    metrics::histogram!("boxoffice_checkout_finalize_seconds").record(duration_secs);
    tracing::debug!(tickets, duration_secs, "Recorded finalized metric");
}

/// Record settled revenue.
pub fn record_revenue(gross_minor: u64) {
    metrics::counter!("boxoffice_payment_revenue_minor_total").increment(gross_minor);
}

/// Record a reconciliation issue.
pub fn record_issue(kind: IssueKind) {
    metrics::counter!("boxoffice_reconciliation_issues_total", "kind" => kind.as_str())
        .increment(1);
    tracing::debug!(kind = kind.as_str(), "Recorded reconciliation_issue metric");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        register_checkout_metrics();
        record_checkout_created(2);
        record_checkout_closed(CheckoutStatus::Canceled, true);
        record_lock_conflict();
        record_callback("settled");
        record_finalized(2, 0.01);
        record_revenue(50_000);
        record_issue(IssueKind::PaidAfterCancel);
    }
}
