//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ServiceSettings.bind_address
//!     → listener.rs (resolve, bind, listen)
//!     → shared with the replacement instance when the address is unchanged
//!     → axum accept loop
//!     → inflight.rs (per-request guard, read during drain)
//! ```
//!
//! # Design Decisions
//! - Binding happens before an instance is considered started
//! - Each request tracked so a drain can report what it cut off

pub mod inflight;
pub mod listener;

pub use inflight::{InflightGuard, InflightTracker};
pub use listener::{BoundListener, ListenerError};
