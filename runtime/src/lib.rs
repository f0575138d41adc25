//! # Boxoffice Runtime
//!
//! Execution helpers shared by the checkout services. Currently this is the
//! backoff policy used around seat-chart authority calls; see [`retry`].

pub mod retry;

pub use retry::{BackoffPolicy, retry_if};
