//! # Adaptive Poller
//!
//! Turns a non-blocking "is there work?" call into either a one-shot wait or
//! a push-style subscription, backing off between empty polls to keep the
//! cost of idle polling bounded.
//!
//! ## Features
//!
//! - **Two consumption modes**: `wait_for_payload` for a single result, `subscribe` for a stream of callbacks
//! - **Adaptive backoff**: exponential or linear growth while idle, instant reset on every payload
//! - **Backpressure**: the next poll waits for the subscriber callback to finish
//! - **Graceful shutdown**: local stop, shared [`ShutdownSignal`], or drop; sleeps wake immediately
//! - **Poll lock**: optional lock shared between pollers of one non-thread-safe resource
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      AdaptivePoller                          │
//! │  (lifecycle, waiter / subscriber registration, counters)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ spawns
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        poll loop                             │
//! │  PollLock ─► PollSource ─► BackoffSchedule ─► sleep/select   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ payload
//!                              ▼
//!                 waiter (oneshot) or subscriber callback
//! ```
//!
//! ## Example
//!
//! ```
//! use everruns_poller::{poll_fn, AdaptivePoller, PollResult, PollerConfig};
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), everruns_poller::PollerError> {
//! let attempts = AtomicU32::new(0);
//! let poller = AdaptivePoller::new(
//!     poll_fn(move || {
//!         // Work shows up on the third check
//!         let n = attempts.fetch_add(1, Ordering::SeqCst);
//!         Ok(if n < 2 { PollResult::Empty } else { PollResult::Payload("job-1") })
//!     }),
//!     PollerConfig::new(Duration::from_millis(50)),
//! )?;
//!
//! assert_eq!(poller.wait_for_payload().await?, Some("job-1"));
//! assert_eq!(poller.empty_poll_count(), 2);
//!
//! poller.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod poller;
pub mod shutdown;
pub mod source;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{BackoffStrategy, PollerConfig};
    pub use crate::error::{BoxError, PollerError};
    pub use crate::poller::{AdaptivePoller, CallbackResult, PollerState, SubscriptionHandle};
    pub use crate::shutdown::ShutdownSignal;
    pub use crate::source::{poll_fn, PollLock, PollResult, PollSource};
}

// Re-export key types at crate root
pub use backoff::BackoffSchedule;
pub use config::{BackoffStrategy, PollerConfig};
pub use error::{BoxError, PollerError};
pub use poller::{
    AdaptivePoller, CallbackResult, PollerBuilder, PollerState, PollerStats, SubscriptionHandle,
};
pub use shutdown::ShutdownSignal;
pub use source::{poll_fn, PollFn, PollLock, PollResult, PollSource};
