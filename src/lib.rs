//! servekit: configuration-driven HTTP services with hot reload.
//!
//! # Architecture Overview
//!
//! ```text
//!      ┌──────────────┐  get_prefix / watch   ┌──────────────────────────────────────┐
//!      │ config store │──────────────────────▶│            lifecycle                 │
//!      │ etcd / file  │                       │  Supervisor ──▶ ServiceInstance (n)  │
//!      │ / memory     │                       │       │   handover ──▶ instance (n+1)│
//!      └──────────────┘                       └───────┼──────────────────────────────┘
//!                                                     │ router per instance
//!                                                     ▼
//!     Client Request   ┌─────────┐   ┌──────────────────────────────────────────────┐
//!     ────────────────▶│   net   │──▶│ http: request id → cors → dispatch → panic   │
//!                      │listener │   │       guard → routing → handler              │
//!     Client Response  └─────────┘   │ Reply / AppError → envelope + status         │
//!     ◀──────────────────────────────┴──────────────────────────────────────────────┘
//!
//!     Cross-cutting: observability (tracing, metrics), resilience (backoff, deadlines)
//! ```

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod routing;

pub use config::{ConfigSnapshot, ConfigStore};
pub use http::{AppError, Bind, ErrorRegistry, Reply};
pub use lifecycle::Supervisor;
pub use routing::{Application, RouteContext, RouteSet};
