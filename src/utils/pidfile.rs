//! Single-instance guard via PID file
//!
//! Two control planes fighting over one fleet is a misconfiguration,
//! not a runtime condition, so a live PID file is startup-fatal. A
//! stale file left by a crashed process is removed silently.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A held PID file; removed on drop
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim the PID file at `path`
    ///
    /// Fails with a startup-fatal error when another live process owns
    /// the file.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(existing) = read_pid(&path) {
            if process_alive(existing) {
                return Err(Error::startup(format!(
                    "already running with pid {existing} ({})",
                    path.display()
                )));
            }
            debug!(pid = existing, "removing stale pid file");
            fs::remove_file(&path).map_err(|e| Error::io("remove stale pid file", e))?;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io("create pid dir", e))?;
        }
        fs::write(&path, std::process::id().to_string())
            .map_err(|e| Error::io("write pid file", e))?;

        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "cannot remove pid file");
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
