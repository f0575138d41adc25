//! # Boxoffice Checkout
//!
//! Seat reservation and checkout reconciliation services.
//!
//! - [`ReservationCoordinator`]: create, confirm, cancel and read checkouts
//! - [`PaymentReconciler`]: issue payment intents and apply gateway callbacks
//! - [`SagaRecovery`]: finish checkouts booked upstream but not locally
//! - [`HoldReaper`]: cancel checkouts whose hold lapsed
//!
//! All of them share one [`CheckoutEnvironment`] of collaborators and keep no
//! state of their own, so they are cheap to clone into request handlers and
//! background tasks.
//!
//! ## Example
//!
//! ```no_run
//! use boxoffice_checkout::{CheckoutConfig, CheckoutEnvironment, ReservationCoordinator};
//!
//! # fn build(env: CheckoutEnvironment) -> Result<(), boxoffice_checkout::ConfigError> {
//! let config = CheckoutConfig::from_env();
//! config.validate()?;
//! boxoffice_checkout::metrics::register_checkout_metrics();
//!
//! let env = env.with_retrying_authority(config.authority.retry.clone());
//! let coordinator = ReservationCoordinator::new(env, config.reservation.clone());
//! # let _ = coordinator;
//! # Ok(())
//! # }
//! ```

pub mod authority;
pub mod config;
pub mod coordinator;
pub mod environment;
pub mod gateway;
pub mod metrics;
pub mod policy;
pub mod reaper;
pub mod reconciler;
pub mod recovery;

mod finalize;
mod saga;
mod teardown;

pub use authority::RetryingAuthority;
pub use config::{CheckoutConfig, ConfigError, ReservationConfig};
pub use coordinator::{ConfirmedCheckout, ReservationCoordinator};
pub use environment::CheckoutEnvironment;
pub use gateway::{GatewayCallback, GatewayError, PaymentGateway, RedirectRequest};
pub use policy::{FeeSplit, TicketClassPolicy};
pub use reaper::{HoldReaper, ReaperReport};
pub use reconciler::{CallbackOutcome, PaymentIntent, PaymentReconciler};
pub use recovery::{RecoveryReport, Resumption, SagaRecovery};
