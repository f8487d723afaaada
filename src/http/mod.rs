//! HTTP response pipeline.
//!
//! # Data Flow
//! ```text
//! request
//!     → request.rs (request id)
//!     → cors.rs (preflight, CORS headers)
//!     → dispatch.rs ─┐
//!     → recovery.rs  │ (panic → Failure::Panic)
//!     → handler      │ returns Reply / AppError, binds input via binding.rs
//!                    ↓
//!     dispatch.rs renders the Outcome: envelope, status, correlation code
//! ```

pub mod binding;
pub mod cors;
pub mod dispatch;
pub mod error;
pub mod recovery;
pub mod request;
pub mod response;
pub mod server;

pub use binding::{bind_json, Bind, Constraint, FieldRules, RequestSchema, Schema, Violation};
pub use error::{AppError, ClassifiedError, ErrorClassifier, ErrorRegistry, RegistryError, Severity};
pub use request::X_REQUEST_ID;
pub use response::{Outcome, PanicReport, Reply, ResponseEnvelope};
pub use server::{build_router, AppState};
