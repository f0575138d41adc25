//! Shared harness for checkout integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use boxoffice_checkout::gateway::SECURE_HASH;
use boxoffice_checkout::{
    CheckoutConfig, CheckoutEnvironment, HoldReaper, PaymentReconciler, ReservationCoordinator,
    SagaRecovery, TicketClassPolicy,
};
use boxoffice_core::ids::{CheckoutId, SessionId};
use boxoffice_core::model::{Checkout, Payment, SellableSession};
use boxoffice_core::repository::{CheckoutRepository, PaymentRepository};
use boxoffice_testing::{
    InMemoryAuthority, InMemoryReconciliationQueue, InMemorySagaLog, InMemorySeatLockStore,
    InMemoryStore, ManualClock, VenueBuilder,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SECRET: &str = "test-hash-secret";
pub const RETURN_URL: &str = "https://shop.example/return";
pub const NOTIFY_URL: &str = "https://api.example/payments/callback";

/// Log to the test writer; `RUST_LOG=boxoffice_checkout=debug` shows the saga.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Every in-memory collaborator plus the services built on them.
pub struct Harness {
    pub clock: ManualClock,
    pub store: InMemoryStore,
    pub locks: InMemorySeatLockStore,
    pub authority: InMemoryAuthority,
    pub saga: InMemorySagaLog,
    pub issues: InMemoryReconciliationQueue,
    pub config: CheckoutConfig,
    pub env: CheckoutEnvironment,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(TicketClassPolicy::default())
    }

    pub fn with_policy(policy: TicketClassPolicy) -> Self {
        init_tracing();
        let clock = ManualClock::default();
        let shared_clock: Arc<ManualClock> = Arc::new(clock.clone());
        let store = InMemoryStore::new();
        let locks = InMemorySeatLockStore::new(shared_clock.clone());
        let authority = InMemoryAuthority::new(shared_clock.clone());
        let saga = InMemorySagaLog::new();
        let issues = InMemoryReconciliationQueue::new();

        let mut config = CheckoutConfig::default();
        config.gateway.merchant_code = "BOXOFFICE".to_string();
        config.gateway.hash_secret = SECRET.to_string();
        config.reservation.ticket_class_policy = policy;

        let env = CheckoutEnvironment {
            locks: Arc::new(locks.clone()),
            cache: Arc::new(locks.clone()),
            authority: Arc::new(authority.clone()),
            catalog: Arc::new(store.clone()),
            checkouts: Arc::new(store.clone()),
            payments: Arc::new(store.clone()),
            ledger: Arc::new(store.clone()),
            saga: Arc::new(saga.clone()),
            issues: Arc::new(issues.clone()),
            clock: shared_clock,
        };

        Self {
            clock,
            store,
            locks,
            authority,
            saga,
            issues,
            config,
            env,
        }
    }

    /// Seed a session and register its chart with the authority.
    pub fn seed(&self, venue: VenueBuilder) -> SellableSession {
        let session = venue.seed(&self.store);
        if let Some(chart_key) = &session.chart_key {
            self.authority.add_chart(chart_key.clone());
        }
        session
    }

    /// Session "S1" with standard seats A1..A3 at 50 000 each.
    pub fn seed_s1(&self) -> SellableSession {
        self.seed(
            VenueBuilder::new("S1")
                .seats(&["A1", "A2", "A3"], Some("STANDARD"))
                .ticket_class("Standard", Some("STANDARD"), 50_000),
        )
    }

    pub fn coordinator(&self) -> ReservationCoordinator {
        ReservationCoordinator::new(self.env.clone(), self.config.reservation.clone())
    }

    pub fn reconciler(&self) -> PaymentReconciler {
        PaymentReconciler::new(self.env.clone(), self.config.clone())
    }

    pub fn recovery(&self) -> SagaRecovery {
        SagaRecovery::new(self.env.clone(), self.config.clone())
    }

    pub fn reaper(&self) -> HoldReaper {
        HoldReaper::new(self.env.clone(), self.config.clone())
    }

    pub async fn checkout(&self, id: CheckoutId) -> Checkout {
        self.store.find(id).await.unwrap().unwrap()
    }

    pub async fn payment(&self, id: CheckoutId) -> Payment {
        self.store.find_by_checkout(id).await.unwrap().unwrap()
    }

    pub fn held_locks(&self, session_id: SessionId) -> usize {
        self.locks.held_locks(session_id).len()
    }

    /// A signed gateway callback.
    pub fn callback(
        &self,
        reference: &str,
        amount: u64,
        response_code: &str,
    ) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("txn_ref".to_string(), reference.to_string());
        fields.insert("amount".to_string(), amount.to_string());
        fields.insert("response_code".to_string(), response_code.to_string());
        fields.insert("transaction_no".to_string(), "14123456".to_string());
        fields.insert("bank_code".to_string(), "NCB".to_string());
        let signature = self.reconciler().gateway().sign(&fields).unwrap();
        fields.insert(SECURE_HASH.to_string(), signature);
        fields
    }

    /// Gateway amount for a gross amount in minor units.
    pub fn gateway_amount(&self, gross_minor: u64) -> u64 {
        gross_minor * self.config.gateway.amount_scale
    }
}
