//! Common utilities and helper functions

pub mod pidfile;
pub mod retry;

pub use pidfile::PidFile;
pub use retry::{with_retry, RetryConfig};
