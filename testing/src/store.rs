//! In-memory repositories.
//!
//! One mutex guards every table, so a [`Finalization`] is applied atomically
//! the way the `PostgreSQL` transaction applies it.

use crate::lock;
use async_trait::async_trait;
use boxoffice_core::error::StoreError;
use boxoffice_core::ids::{CheckoutId, PaymentId, SeatLabel, SessionId, TicketId};
use boxoffice_core::model::{
    Checkout, CheckoutStatus, Finalization, FinalizeOutcome, GatewayMetadata, HoldToken, Payment,
    PaymentDraft, PaymentStatus, Payout, PayoutAccrual, Seat, SeatState, SeatStatus,
    SellableSession, Ticket, TicketClass,
};
use boxoffice_core::money::Money;
use boxoffice_core::repository::{
    CatalogRepository, CheckoutRepository, LedgerRepository, PaymentRepository,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<SessionId, SellableSession>,
    seats: Vec<Seat>,
    ticket_classes: Vec<TicketClass>,
    checkouts: HashMap<CheckoutId, Checkout>,
    payments: HashMap<PaymentId, Payment>,
    seat_states: HashMap<(SessionId, SeatLabel), SeatState>,
    tickets: HashMap<(SessionId, SeatLabel), Ticket>,
    payouts: HashMap<SessionId, Payout>,
    accrued: HashSet<PaymentId>,
}

impl Tables {
    fn payment_for_checkout(&self, checkout_id: CheckoutId) -> Option<&Payment> {
        self.payments
            .values()
            .find(|payment| payment.checkout_id == checkout_id)
    }
}

/// Catalog, checkout, payment and ledger repositories over shared tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    finalize_failures: Arc<AtomicUsize>,
    insert_failures: Arc<AtomicUsize>,
}

impl InMemoryStore {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the catalog.
    pub fn add_session(&self, session: SellableSession) {
        lock(&self.tables).sessions.insert(session.id, session);
    }

    /// Add a seat to the catalog.
    pub fn add_seat(&self, seat: Seat) {
        lock(&self.tables).seats.push(seat);
    }

    /// Add a ticket class to the catalog.
    pub fn add_ticket_class(&self, class: TicketClass) {
        lock(&self.tables).ticket_classes.push(class);
    }

    /// Fail the next `count` calls to [`LedgerRepository::finalize`].
    pub fn fail_next_finalize(&self, count: usize) {
        self.finalize_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to [`CheckoutRepository::insert`].
    pub fn fail_next_insert(&self, count: usize) {
        self.insert_failures.store(count, Ordering::SeqCst);
    }

    /// Every ticket of a session (for assertions).
    #[must_use]
    pub fn tickets_for_session(&self, session_id: SessionId) -> Vec<Ticket> {
        let mut tickets: Vec<_> = lock(&self.tables)
            .tickets
            .values()
            .filter(|ticket| ticket.session_id == session_id)
            .cloned()
            .collect();
        tickets.sort_by(|a, b| a.seat.cmp(&b.seat));
        tickets
    }

    /// Number of payments stored (for assertions).
    #[must_use]
    pub fn payment_count(&self) -> usize {
        lock(&self.tables).payments.len()
    }

    fn consume(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn version_conflict(entity: &'static str, id: impl ToString, expected: i64) -> StoreError {
    StoreError::VersionConflict {
        entity,
        id: id.to_string(),
        expected,
    }
}

#[async_trait]
impl CatalogRepository for InMemoryStore {
    async fn find_session(&self, id: SessionId) -> Result<Option<SellableSession>, StoreError> {
        Ok(lock(&self.tables).sessions.get(&id).cloned())
    }

    async fn find_seats(
        &self,
        session_id: SessionId,
        labels: &[SeatLabel],
    ) -> Result<Vec<Seat>, StoreError> {
        Ok(lock(&self.tables)
            .seats
            .iter()
            .filter(|seat| seat.session_id == session_id && labels.contains(&seat.label))
            .cloned()
            .collect())
    }

    async fn ticket_classes(&self, session_id: SessionId) -> Result<Vec<TicketClass>, StoreError> {
        let mut classes: Vec<_> = lock(&self.tables)
            .ticket_classes
            .iter()
            .filter(|class| class.session_id == session_id)
            .cloned()
            .collect();
        classes.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
        Ok(classes)
    }
}

#[async_trait]
impl CheckoutRepository for InMemoryStore {
    async fn insert(&self, checkout: &Checkout) -> Result<(), StoreError> {
        if Self::consume(&self.insert_failures) {
            return Err(StoreError::Database("injected insert failure".to_string()));
        }
        let mut tables = lock(&self.tables);
        if tables.checkouts.contains_key(&checkout.id) {
            return Err(StoreError::Database(format!(
                "duplicate checkout {}",
                checkout.id
            )));
        }
        tables.checkouts.insert(checkout.id, checkout.clone());
        Ok(())
    }

    async fn find(&self, id: CheckoutId) -> Result<Option<Checkout>, StoreError> {
        Ok(lock(&self.tables).checkouts.get(&id).cloned())
    }

    async fn attach_hold(
        &self,
        id: CheckoutId,
        hold: &HoldToken,
        expected_version: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut tables = lock(&self.tables);
        match tables.checkouts.get_mut(&id) {
            Some(checkout)
                if checkout.status == CheckoutStatus::Init
                    && checkout.version == expected_version =>
            {
                checkout.hold = Some(hold.clone());
                checkout.updated_at = at;
                checkout.version += 1;
                Ok(checkout.version)
            },
            _ => Err(version_conflict("checkout", id, expected_version)),
        }
    }

    async fn transition(
        &self,
        id: CheckoutId,
        from: CheckoutStatus,
        to: CheckoutStatus,
        expected_version: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut tables = lock(&self.tables);
        match tables.checkouts.get_mut(&id) {
            Some(checkout) if checkout.status == from && checkout.version == expected_version => {
                checkout.status = to;
                checkout.updated_at = at;
                checkout.version += 1;
                Ok(checkout.version)
            },
            _ => Err(version_conflict("checkout", id, expected_version)),
        }
    }

    async fn extend_payment_deadline(
        &self,
        id: CheckoutId,
        deadline: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = lock(&self.tables);
        let checkout = tables
            .checkouts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "checkout",
                id: id.to_string(),
            })?;
        if checkout.status != CheckoutStatus::Init {
            return Ok(false);
        }
        checkout.payment_deadline = Some(
            checkout
                .payment_deadline
                .map_or(deadline, |current| current.max(deadline)),
        );
        checkout.updated_at = at;
        Ok(true)
    }

    async fn list_abandoned(
        &self,
        now: DateTime<Utc>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Checkout>, StoreError> {
        let mut abandoned: Vec<_> = lock(&self.tables)
            .checkouts
            .values()
            .filter(|checkout| checkout.status == CheckoutStatus::Init)
            .filter(|checkout| match &checkout.hold {
                Some(hold) => hold.expires_at < now,
                None => checkout.created_at < created_before,
            })
            .filter(|checkout| checkout.payment_deadline.is_none_or(|deadline| deadline < now))
            .cloned()
            .collect();
        abandoned.sort_by_key(|checkout| checkout.created_at);
        abandoned.truncate(limit);
        Ok(abandoned)
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn upsert_intent(&self, draft: &PaymentDraft) -> Result<Payment, StoreError> {
        let mut tables = lock(&self.tables);
        let existing = tables.payment_for_checkout(draft.checkout_id).map(|p| p.id);

        if let Some(payment) = existing.and_then(|id| tables.payments.get_mut(&id)) {
            payment.gross = draft.gross;
            payment.platform_fee = draft.platform_fee;
            payment.organizer_amount = draft.organizer_amount;
            if payment.status != PaymentStatus::Success {
                payment.status = PaymentStatus::Pending;
                payment.failure_reason = None;
            }
            payment.updated_at = draft.at;
            payment.version += 1;
            return Ok(payment.clone());
        }

        let payment = Payment {
            id: draft.id,
            checkout_id: draft.checkout_id,
            user_id: draft.user_id,
            session_id: draft.session_id,
            reference: draft.reference.clone(),
            gross: draft.gross,
            platform_fee: draft.platform_fee,
            organizer_amount: draft.organizer_amount,
            status: PaymentStatus::Pending,
            verified: false,
            gateway: GatewayMetadata::default(),
            failure_reason: None,
            paid_at: None,
            created_at: draft.at,
            updated_at: draft.at,
            version: 1,
        };
        tables.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Payment>, StoreError> {
        Ok(lock(&self.tables)
            .payments
            .values()
            .find(|payment| payment.reference == reference)
            .cloned())
    }

    async fn find_by_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Option<Payment>, StoreError> {
        Ok(lock(&self.tables).payment_for_checkout(checkout_id).cloned())
    }

    async fn settle(
        &self,
        id: PaymentId,
        expected_version: i64,
        gateway: &GatewayMetadata,
        paid_at: DateTime<Utc>,
    ) -> Result<Payment, StoreError> {
        let mut tables = lock(&self.tables);
        match tables.payments.get_mut(&id) {
            Some(payment) if payment.version == expected_version => {
                payment.status = PaymentStatus::Success;
                payment.verified = true;
                payment.gateway = gateway.clone();
                payment.failure_reason = None;
                payment.paid_at = Some(paid_at);
                payment.updated_at = paid_at;
                payment.version += 1;
                Ok(payment.clone())
            },
            _ => Err(version_conflict("payment", id, expected_version)),
        }
    }

    async fn mark_failed(
        &self,
        id: PaymentId,
        expected_version: i64,
        reason: &str,
        gateway: Option<&GatewayMetadata>,
        at: DateTime<Utc>,
    ) -> Result<Payment, StoreError> {
        let mut tables = lock(&self.tables);
        match tables.payments.get_mut(&id) {
            Some(payment)
                if payment.version == expected_version
                    && payment.status != PaymentStatus::Success =>
            {
                payment.status = PaymentStatus::Failed;
                payment.failure_reason = Some(reason.to_string());
                if let Some(gateway) = gateway {
                    payment.gateway = gateway.clone();
                }
                payment.updated_at = at;
                payment.version += 1;
                Ok(payment.clone())
            },
            _ => Err(version_conflict("payment", id, expected_version)),
        }
    }
}

#[async_trait]
impl LedgerRepository for InMemoryStore {
    async fn finalize(&self, finalization: &Finalization) -> Result<FinalizeOutcome, StoreError> {
        if Self::consume(&self.finalize_failures) {
            return Err(StoreError::Database("injected finalize failure".to_string()));
        }
        let mut tables = lock(&self.tables);

        // Check the checkout first so a lost race applies nothing.
        let checkout = tables
            .checkouts
            .get(&finalization.checkout_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "checkout",
                id: finalization.checkout_id.to_string(),
            })?;
        let at_expected = checkout.status == CheckoutStatus::Init
            && checkout.version == finalization.expected_version;
        if !at_expected && checkout.status != finalization.target {
            return Err(version_conflict(
                "checkout",
                finalization.checkout_id,
                finalization.expected_version,
            ));
        }

        let mut outcome = FinalizeOutcome::default();
        for ticket in &finalization.tickets {
            let key = (ticket.session_id, ticket.seat.clone());
            if let Some(existing) = tables.tickets.get(&key) {
                outcome.existing.push(existing.clone());
                continue;
            }
            tables.tickets.insert(key.clone(), ticket.clone());
            outcome.issued.push(ticket.clone());
        }

        let covered: Vec<(SeatLabel, TicketId)> = outcome
            .issued
            .iter()
            .chain(&outcome.existing)
            .map(|ticket| (ticket.seat.clone(), ticket.id))
            .collect();
        for (seat, ticket_id) in covered {
            let key = (finalization.session_id, seat.clone());
            let already_paid = tables
                .seat_states
                .get(&key)
                .is_some_and(|state| state.status == SeatStatus::Paid);
            if !already_paid {
                tables.seat_states.insert(
                    key,
                    SeatState {
                        session_id: finalization.session_id,
                        seat,
                        status: SeatStatus::Paid,
                        ticket_id: Some(ticket_id),
                        updated_at: finalization.at,
                    },
                );
            }
        }

        let checkout = tables
            .checkouts
            .get_mut(&finalization.checkout_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "checkout",
                id: finalization.checkout_id.to_string(),
            })?;
        if at_expected {
            checkout.status = finalization.target;
            checkout.updated_at = finalization.at;
            checkout.version += 1;
        }
        outcome.checkout_version = checkout.version;
        Ok(outcome)
    }

    async fn accrue_payout(&self, accrual: &PayoutAccrual) -> Result<bool, StoreError> {
        let mut tables = lock(&self.tables);
        if !tables.accrued.insert(accrual.payment_id) {
            return Ok(false);
        }
        let payout = tables
            .payouts
            .entry(accrual.session_id)
            .or_insert_with(|| Payout {
                session_id: accrual.session_id,
                gross: Money::ZERO,
                platform_fee: Money::ZERO,
                organizer_amount: Money::ZERO,
                payments: 0,
                updated_at: accrual.at,
            });
        let overflow = || StoreError::Database("payout overflow".to_string());
        payout.gross = payout.gross.checked_add(accrual.gross).ok_or_else(overflow)?;
        payout.platform_fee = payout
            .platform_fee
            .checked_add(accrual.platform_fee)
            .ok_or_else(overflow)?;
        payout.organizer_amount = payout
            .organizer_amount
            .checked_add(accrual.organizer_amount)
            .ok_or_else(overflow)?;
        payout.payments += 1;
        payout.updated_at = accrual.at;
        Ok(true)
    }

    async fn seat_state(
        &self,
        session_id: SessionId,
        seat: &SeatLabel,
    ) -> Result<Option<SeatState>, StoreError> {
        Ok(lock(&self.tables)
            .seat_states
            .get(&(session_id, seat.clone()))
            .cloned())
    }

    async fn seat_states(&self, session_id: SessionId) -> Result<Vec<SeatState>, StoreError> {
        let mut states: Vec<_> = lock(&self.tables)
            .seat_states
            .values()
            .filter(|state| state.session_id == session_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.seat.cmp(&b.seat));
        Ok(states)
    }

    async fn tickets_for_checkout(
        &self,
        checkout_id: CheckoutId,
    ) -> Result<Vec<Ticket>, StoreError> {
        let mut tickets: Vec<_> = lock(&self.tables)
            .tickets
            .values()
            .filter(|ticket| ticket.checkout_id == checkout_id)
            .cloned()
            .collect();
        tickets.sort_by(|a, b| a.seat.cmp(&b.seat));
        Ok(tickets)
    }

    async fn payout(&self, session_id: SessionId) -> Result<Option<Payout>, StoreError> {
        Ok(lock(&self.tables).payouts.get(&session_id).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_clock;
    use boxoffice_core::ids::{TicketClassId, UserId};

    fn open_checkout(store_session: SessionId) -> Checkout {
        Checkout::open(
            CheckoutId::new(),
            UserId::new(),
            store_session,
            "S1".to_string(),
            vec![SeatLabel::new("A1")],
            test_clock(),
        )
    }

    fn ticket(checkout: &Checkout) -> Ticket {
        Ticket {
            id: TicketId::new(),
            checkout_id: checkout.id,
            session_id: checkout.session_id,
            user_id: checkout.user_id,
            seat: SeatLabel::new("A1"),
            ticket_class_id: TicketClassId::new(),
            price: Money::from_minor(100),
            issued_at: test_clock(),
        }
    }

    #[tokio::test]
    async fn finalize_is_idempotent_once_at_target() {
        let store = InMemoryStore::new();
        let checkout = open_checkout(SessionId::new());
        store.insert(&checkout).await.unwrap();

        let finalization = Finalization {
            checkout_id: checkout.id,
            session_id: checkout.session_id,
            expected_version: checkout.version,
            target: CheckoutStatus::Paid,
            tickets: vec![ticket(&checkout)],
            at: test_clock(),
        };
        let first = store.finalize(&finalization).await.unwrap();
        assert_eq!(first.issued.len(), 1);

        let replay = Finalization {
            tickets: vec![ticket(&checkout)],
            ..finalization
        };
        let second = store.finalize(&replay).await.unwrap();
        assert!(second.issued.is_empty());
        assert_eq!(second.existing, first.issued);
        assert_eq!(store.tickets_for_session(checkout.session_id).len(), 1);
    }

    #[tokio::test]
    async fn finalize_of_canceled_checkout_applies_nothing() {
        let store = InMemoryStore::new();
        let checkout = open_checkout(SessionId::new());
        store.insert(&checkout).await.unwrap();
        store
            .transition(checkout.id, CheckoutStatus::Init, CheckoutStatus::Canceled, 1, test_clock())
            .await
            .unwrap();

        let result = store
            .finalize(&Finalization {
                checkout_id: checkout.id,
                session_id: checkout.session_id,
                expected_version: 1,
                target: CheckoutStatus::Paid,
                tickets: vec![ticket(&checkout)],
                at: test_clock(),
            })
            .await;

        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
        assert!(store.tickets_for_session(checkout.session_id).is_empty());
    }

    #[tokio::test]
    async fn payout_accrues_once_per_payment() {
        let store = InMemoryStore::new();
        let accrual = PayoutAccrual {
            payment_id: PaymentId::new(),
            session_id: SessionId::new(),
            gross: Money::from_minor(1000),
            platform_fee: Money::from_minor(200),
            organizer_amount: Money::from_minor(800),
            at: test_clock(),
        };

        assert!(store.accrue_payout(&accrual).await.unwrap());
        assert!(!store.accrue_payout(&accrual).await.unwrap());
        let payout = store.payout(accrual.session_id).await.unwrap().unwrap();
        assert_eq!(payout.gross, Money::from_minor(1000));
        assert_eq!(payout.payments, 1);
    }

    #[tokio::test]
    async fn settled_payment_cannot_be_marked_failed() {
        let store = InMemoryStore::new();
        let checkout = open_checkout(SessionId::new());
        let draft_id = PaymentId::new();
        let payment = store
            .upsert_intent(&PaymentDraft {
                id: draft_id,
                checkout_id: checkout.id,
                user_id: checkout.user_id,
                session_id: checkout.session_id,
                reference: draft_id.to_string(),
                gross: Money::from_minor(1000),
                platform_fee: Money::from_minor(200),
                organizer_amount: Money::from_minor(800),
                at: test_clock(),
            })
            .await
            .unwrap();
        let settled = store
            .settle(payment.id, payment.version, &GatewayMetadata::default(), test_clock())
            .await
            .unwrap();

        let result = store
            .mark_failed(settled.id, settled.version, "late failure", None, test_clock())
            .await;

        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
        let stored = store.find_by_checkout(checkout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Success);
        assert!(stored.verified);
    }

    #[tokio::test]
    async fn payment_deadline_only_moves_forward_and_gates_abandonment() {
        let store = InMemoryStore::new();
        let checkout = open_checkout(SessionId::new());
        store.insert(&checkout).await.unwrap();
        let minutes = chrono::Duration::minutes;
        let start = test_clock();

        assert!(
            store
                .extend_payment_deadline(checkout.id, start + minutes(19), start)
                .await
                .unwrap()
        );
        assert!(
            store
                .extend_payment_deadline(checkout.id, start + minutes(10), start)
                .await
                .unwrap()
        );
        let stored = store.find(checkout.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_deadline, Some(start + minutes(19)));
        assert_eq!(stored.version, checkout.version);

        let created_before = start + minutes(1);
        let inside = store
            .list_abandoned(start + minutes(16), created_before, 10)
            .await
            .unwrap();
        assert!(inside.is_empty());
        let after = store
            .list_abandoned(start + minutes(20), created_before, 10)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
    }

    #[tokio::test]
    async fn payment_deadline_is_not_extended_after_init() {
        let store = InMemoryStore::new();
        let checkout = open_checkout(SessionId::new());
        store.insert(&checkout).await.unwrap();
        store
            .transition(checkout.id, CheckoutStatus::Init, CheckoutStatus::Canceled, 1, test_clock())
            .await
            .unwrap();

        let extended = store
            .extend_payment_deadline(checkout.id, test_clock(), test_clock())
            .await
            .unwrap();

        assert!(!extended);
    }
}
