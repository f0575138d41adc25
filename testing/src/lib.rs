//! # Boxoffice Testing
//!
//! In-memory implementations of every collaborator a checkout touches, driven
//! by a [`ManualClock`] so lock and hold TTLs can be expired on demand.
//!
//! - [`InMemorySeatLockStore`]: seat locks and checkout cache
//! - [`InMemoryAuthority`]: seat-chart authority with failure injection
//! - [`InMemoryStore`]: catalog, checkout, payment and ledger repositories
//! - [`InMemorySagaLog`] and [`InMemoryReconciliationQueue`]
//!
//! ## Example
//!
//! ```
//! use boxoffice_testing::{InMemoryStore, ManualClock, VenueBuilder};
//! use boxoffice_core::environment::Clock;
//! use chrono::Duration;
//!
//! let clock = ManualClock::default();
//! let store = InMemoryStore::new();
//! let session = VenueBuilder::new("S1")
//!     .seat("A1", Some("VIP"))
//!     .ticket_class("VIP", Some("VIP"), 50_000)
//!     .seed(&store);
//! assert_eq!(session.chart_key.as_deref(), Some("S1"));
//!
//! let before = clock.now();
//! clock.advance(Duration::minutes(5));
//! assert_eq!(clock.now() - before, Duration::minutes(5));
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod authority;
pub mod clock;
pub mod fixtures;
pub mod locks;
pub mod reconciliation;
pub mod saga;
pub mod store;

pub use authority::{AuthorityCall, AuthorityOp, InMemoryAuthority};
pub use clock::{ManualClock, test_clock};
pub use fixtures::VenueBuilder;
pub use locks::InMemorySeatLockStore;
pub use reconciliation::InMemoryReconciliationQueue;
pub use saga::InMemorySagaLog;
pub use store::InMemoryStore;

/// Lock a mutex, recovering the data if a panicking test poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `std` duration to `chrono` duration, saturating at ten years.
pub(crate) fn to_chrono(ttl: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650))
}
