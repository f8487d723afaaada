//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (supervisor.rs):
//!     Read namespace → refuse if empty → resolve settings → bind → serve
//!
//! Reload (supervisor.rs, instance.rs):
//!     Watch delta → merge → new instance accepting → old instance drains
//!
//! Shutdown (signals.rs):
//!     SIGTERM/SIGINT → cancel → stop accepting → drain (bounded) → exit
//! ```
//!
//! # Design Decisions
//! - At most one reload or stop runs at a time; a started handover always
//!   finishes before shutdown begins
//! - Drains have a timeout: forced abort after the deadline

pub mod instance;
pub mod signals;
pub mod supervisor;

pub use instance::{InstanceError, ServiceInstance};
pub use signals::shutdown_signal;
pub use supervisor::{Supervisor, SupervisorError, SupervisorState, SupervisorStatus};
