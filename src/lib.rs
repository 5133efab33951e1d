#![forbid(unsafe_code)]

//! # cellwatch-orchestrator
//!
//! Event orchestration core for a cell-site fleet control plane.
//!
//! A [`crate::tower_bridge::TowerBridge`] turns a flaky external device API into a
//! stream of normalized [`crate::model::BusEvent`]s via the [`crate::delta`] diff engine.
//! Those events fan out on the [`crate::bus::IncidentBus`] to a [`crate::supervisor::Supervisor`],
//! which drives three agents — correlation, troubleshooting, and root-cause recording —
//! under a policy read from an [`crate::policy::PolicyStore`].
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cellwatch_orchestrator::{Backoff, Jitter, ResilienceError, RetryPolicy};
//!
//! async fn flaky_call(attempts: Arc<AtomicUsize>) -> Result<(), ResilienceError<std::io::Error>> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(ResilienceError::Inner(std::io::Error::new(
//!             std::io::ErrorKind::Other,
//!             "transient failure",
//!         )))
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .map_err(|_| ResilienceError::Inner(std::io::Error::new(std::io::ErrorKind::Other, "bad config")))?
//!         .backoff(Backoff::constant(Duration::from_secs(1)))
//!         .with_jitter(Jitter::full())
//!         .build();
//!     retry.execute(|| flaky_call(attempts.clone())).await?;
//!     Ok(())
//! }
//! ```

mod adaptive;
mod backoff;
mod error;
mod jitter;
mod retry;
mod sleeper;
mod timeout;

pub mod agents;
pub mod bus;
pub mod config;
pub mod delta;
pub mod model;
pub mod policy;
pub mod supervisor;
pub mod tower_bridge;
pub mod tower_client;
pub mod tower_stream;

pub use adaptive::Adaptive;
pub use backoff::Backoff;
pub use error::{ResilienceError, MAX_RETRY_FAILURES};
pub use jitter::Jitter;
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};

pub mod prelude;
