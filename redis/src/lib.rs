//! # Boxoffice Redis
//!
//! Redis implementation of [`SeatLockStore`] and [`CheckoutCache`].
//!
//! # Keys
//!
//! - `seatlock:{<session_id>}:<label>` → owning checkout id, with `PX` TTL.
//!   The braces are a cluster hash tag, so every lock of a session lives in
//!   one slot and a multi-key script can touch them together.
//! - `checkout:<checkout_id>:summary` → bincode-encoded `CheckoutSummary`,
//!   with `PX` TTL.
//!
//! Multi-seat operations run as Lua scripts: Redis executes a script
//! atomically, so a set of seats is locked, extended or released as a unit.
//!
//! # Example
//!
//! ```no_run
//! use boxoffice_redis::RedisSeatLockStore;
//!
//! # async fn example() -> Result<(), boxoffice_core::StoreError> {
//! let store = RedisSeatLockStore::connect("redis://127.0.0.1:6379").await?;
//! # let _ = store;
//! # Ok(())
//! # }
//! ```
//!
//! [`SeatLockStore`]: boxoffice_core::locks::SeatLockStore
//! [`CheckoutCache`]: boxoffice_core::locks::CheckoutCache

mod cache;
mod locks;
mod scripts;

pub use locks::RedisSeatLockStore;

use boxoffice_core::error::StoreError;
use std::time::Duration;

/// Map a Redis failure to a cache error.
fn cache_error(context: &str, error: &redis::RedisError) -> StoreError {
    StoreError::Cache(format!("{context}: {error}"))
}

/// TTL in whole milliseconds, at least 1 (`PX 0` is rejected by Redis).
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
