//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to the configuration backend:
//!     → timeouts.rs (enforce the per-operation deadline)
//!
//! Dropped watch subscription:
//!     → backoff.rs (exponential delay with jitter before reconnecting)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every store call has a deadline
//! - Reconnect delays are capped so a recovered backend is picked up quickly

pub mod backoff;
pub mod timeouts;

pub use backoff::{calculate_backoff, BackoffConfig};
pub use timeouts::with_deadline;
