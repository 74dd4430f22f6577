//! Unified error handling for the fleetward crate
//!
//! This module provides the crate-wide error taxonomy. Every transient
//! failure class is recovered at its component boundary; only
//! [`Error::StartupFatal`] is allowed to terminate the process.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fleetward::error::Error;
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!("retrying: {}", err);
//!     } else {
//!         tracing::error!("fatal: {}", err);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Result type for fleetward operations
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy
#[derive(Debug, Error)]
pub enum Error {
    /// The infrastructure backend could not be reached; the watcher
    /// retries on its next tick.
    #[error("backend unreachable ({backend}): {reason}")]
    BackendUnreachable { backend: String, reason: String },

    /// A declared key/value pair failed its schema validation pattern.
    /// The pair is dropped; the merge continues.
    #[error("validation rejected for '{key}': {reason}")]
    ValidationRejected { key: String, reason: String },

    /// One fanout target failed. Recorded per instance, never escalated.
    #[error("instance '{hostname}' unreachable: {reason}")]
    InstanceUnreachable { hostname: String, reason: String },

    /// One job's producer failed. Prior cache entry stays untouched.
    #[error("job '{job}' failed: {reason}")]
    JobFailed { job: String, reason: String },

    /// The persistent store is not initialized yet; the caller backs
    /// off and retries, blocking only the current pass.
    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// Unrecoverable startup condition (missing socket, stale process,
    /// malformed schema catalog). Terminates the process.
    #[error("startup fatal: {reason}")]
    StartupFatal { reason: String },

    /// Lock coordination protocol error
    #[error("lock protocol error: {reason}")]
    LockProtocol { reason: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error during '{operation}': {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Backend discovery errors (docker/swarm/kubernetes/static)
    Backend,
    /// Schema validation errors
    Validation,
    /// Control protocol errors (per-instance fanout)
    Fanout,
    /// Scheduled job errors
    Job,
    /// Persistent store errors
    Store,
    /// Startup errors
    Startup,
    /// Other/unknown errors
    Other,
}

impl Error {
    /// Check if this error is recoverable (retried on a later cycle)
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::StartupFatal { .. })
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BackendUnreachable { .. } => ErrorCategory::Backend,
            Self::ValidationRejected { .. } => ErrorCategory::Validation,
            Self::InstanceUnreachable { .. } => ErrorCategory::Fanout,
            Self::JobFailed { .. } => ErrorCategory::Job,
            Self::StoreUnavailable { .. } => ErrorCategory::Store,
            Self::StartupFatal { .. } => ErrorCategory::Startup,
            Self::LockProtocol { .. } | Self::Serialization(_) | Self::Io { .. } => {
                ErrorCategory::Other
            }
        }
    }

    /// Convenience constructor for IO errors with an operation label
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Convenience constructor for startup failures
    pub fn startup(reason: impl Into<String>) -> Self {
        Self::StartupFatal {
            reason: reason.into(),
        }
    }
}
