//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! bootstrap file / CLI
//!     → args.rs (flag and environment overrides)
//!     → loader.rs (parse & deserialize BootstrapConfig)
//!     → store.rs::connect (etcd | file | memory backend)
//!
//! INIT:
//!     store.get_prefix("<namespace>/")
//!     → snapshot.rs (ConfigSnapshot, published through SharedSnapshot)
//!     → validation.rs (ServiceSettings, all errors at once)
//!
//! On change:
//!     watch.rs receives a batch (reconnecting with backoff if dropped)
//!     → SharedSnapshot::apply (copy-on-write, atomic swap)
//!     → validation.rs re-derives ServiceSettings
//!     → lifecycle supervisor performs the handover
//! ```
//!
//! # Design Decisions
//! - A snapshot is immutable once published; changes produce a new one
//! - All bootstrap fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod args;
pub mod etcd;
pub mod file;
pub mod loader;
pub mod memory;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod validation;
pub mod watch;

pub use etcd::EtcdStore;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use args::BootstrapArgs;
pub use loader::{load_bootstrap, ConfigError};
pub use schema::{
    BootstrapConfig, Env, LogFormat, LoggingConfig, MetricsConfig, ServiceSettings, StoreBackend, StoreConfig,
    WatchConfig,
};
pub use snapshot::{ConfigSnapshot, SharedSnapshot};
pub use store::{connect, ConfigStore, StoreError, Subscription, WatchBatch, WatchEvent, WatchTarget};
pub use validation::{resolve_settings, SettingsError};
pub use watch::{WatchError, Watcher};
