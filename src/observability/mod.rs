//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (logging.rs installs the subscriber)
//!     → metrics.rs (counters, histograms)
//!
//! Consumers:
//!     → stdout or a log file, pretty or JSON
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through the trace span of every request
//! - Correlation codes of internal errors appear in the error log line

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LoggingError};
pub use metrics::init_metrics;
