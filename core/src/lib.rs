//! # Boxoffice Core
//!
//! Domain types and collaborator traits for seat reservation and checkout
//! reconciliation.
//!
//! A checkout coordinates three stores that can disagree with each other:
//!
//! - a transient lock store holding one exclusive, expiring lock per seat
//!   ([`locks::SeatLockStore`])
//! - the durable ledger of checkouts, payments, tickets and seat states
//!   ([`repository`])
//! - the external seat-chart authority that owns the canonical hold/book state
//!   of every seat ([`authority::SeatChartAuthority`])
//!
//! Every step taken against those stores is recorded in a per-checkout
//! [`saga::SagaLog`], so an interrupted checkout can be resumed or escalated
//! to an operator through the [`reconciliation::ReconciliationQueue`].
//!
//! This crate holds no I/O. Redis and `PostgreSQL` implementations live in
//! `boxoffice-redis` and `boxoffice-postgres`; in-memory doubles live in
//! `boxoffice-testing`.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod authority;
pub mod error;
pub mod ids;
pub mod locks;
pub mod model;
pub mod money;
pub mod reconciliation;
pub mod repository;
pub mod saga;

pub use error::{AuthorityError, ErrorKind, ReservationError, StoreError};
pub use ids::{CheckoutId, PaymentId, SeatLabel, SessionId, TicketClassId, TicketId, UserId};
pub use money::Money;

/// Environment module - injected dependencies shared by the services.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time so TTL and expiry logic can be tested
    /// deterministically.
    ///
    /// # Example
    ///
    /// ```
    /// use boxoffice_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
