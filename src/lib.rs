//! fleetward - control plane for a reverse-proxy/WAF fleet
//!
//! Observes a container backend (Docker, Swarm, Kubernetes or a static
//! variables file), merges what it sees into one validated
//! configuration snapshot, and broadcasts snapshot changes to every
//! managed instance over a small HTTP control protocol.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`watcher`] - Backend observation (Docker, Swarm, Kubernetes, static)
//! - [`merger`] - Deterministic configuration merge
//! - [`schema`] - Setting catalog and validation
//! - [`fanout`] - Best-effort HTTP broadcast to instances
//! - [`reconcile`] - The reconciliation loop tying it together
//! - [`jobs`] - Scheduled artifact jobs with content-hash caching
//! - [`lock`] - Shared lock service on a Unix socket
//! - [`directory`] - In-memory instance registry
//! - [`store`] - SQLite persistence
//!
//! # Example
//!
//! ```no_run
//! use fleetward::config::Config;
//! use fleetward::directory::InstanceDirectory;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     config.validate()?;
//!     let directory = InstanceDirectory::new();
//!     let _ = (config, directory);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod jobs;
pub mod lock;
pub mod merger;
pub mod metrics;
pub mod models;
pub mod reconcile;
pub mod schema;
pub mod store;
pub mod utils;
pub mod watcher;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::directory::InstanceDirectory;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::fanout::{ApiFanout, FanoutReport};
    pub use crate::merger::{merge, ConfigSnapshot, MergeOutcome};
    pub use crate::models::{CustomConfig, Instance, ManagedService, RegistrationMethod};
    pub use crate::reconcile::Reconciler;
    pub use crate::schema::SettingCatalog;
    pub use crate::store::{SqliteStore, Store};
    pub use crate::watcher::{Backend, Observation};
}

// Direct re-exports for convenience
pub use models::{CustomConfig, Instance, ManagedService, RegistrationMethod};
