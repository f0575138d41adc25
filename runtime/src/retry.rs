//! Retry with exponential backoff for transient upstream failures.
//!
//! Only idempotent calls go through here (retrieve session, create hold, hold,
//! release). The caller decides which errors are transient.
//!
//! # Example
//!
//! ```rust
//! use boxoffice_runtime::retry::{BackoffPolicy, retry_if};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = BackoffPolicy::builder()
//!     .max_retries(2)
//!     .initial_delay(Duration::from_millis(50))
//!     .build();
//!
//! let held = retry_if(&policy, "authority.hold", || async { Ok::<_, String>(true) }, |_| true)
//!     .await?;
//! assert!(held);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Backoff configuration.
///
/// # Default Values
///
/// - `max_retries`: 2
/// - `initial_delay`: 100ms
/// - `max_delay`: 2 seconds
/// - `multiplier`: 2.0
/// - `jitter`: 0.2 (each delay is randomly shortened by up to 20%)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Cap on any single delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Growth factor between retries
    pub multiplier: f64,
    /// Fraction of each delay that may be randomly removed, `0.0..=1.0`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Create a new policy builder starting from the defaults.
    #[must_use]
    pub fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), before jitter:
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap_ms = self.max_delay.as_millis() as f64;
        if !delay_ms.is_finite() || delay_ms >= cap_ms {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let cut = rand::thread_rng().gen_range(0.0..=jitter);
        Duration::from_millis((delay.as_millis() as f64 * (1.0 - cut)) as u64)
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    policy: BackoffPolicy,
}

impl BackoffPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction.
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        self.policy
    }
}

/// Run `operation`, retrying while `is_transient` says the error may go away.
///
/// `name` labels the log events. A non-transient error is returned at once;
/// once retries are exhausted the last error is returned.
///
/// # Errors
///
/// Returns the operation's error when it is not transient or retries run out.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: &BackoffPolicy,
    name: &'static str,
    mut operation: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(operation = name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(error) if !is_transient(&error) => {
                tracing::debug!(operation = name, error = %error, "Error is not transient");
                return Err(error);
            },
            Err(error) if attempt >= policy.max_retries => {
                tracing::warn!(
                    operation = name,
                    attempt,
                    error = %error,
                    "Operation failed after max retries"
                );
                return Err(error);
            },
            Err(error) => {
                let delay = policy.jittered(policy.delay_for_attempt(attempt));
                tracing::warn!(
                    operation = name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
