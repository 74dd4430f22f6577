//! Job artifact cache sidecars
//!
//! Each job artifact is accompanied by a `<artifact>.md` sidecar file
//! holding `{last_success, checksum}` as JSON. The sidecar is the
//! persisted form of the cache entry: its timestamp gates freshness,
//! its checksum gates change detection. Artifact and sidecar are
//! replaced atomically (write to a temp path, then rename).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Persisted cache entry for one job artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCacheEntry {
    /// When the producing job last succeeded
    pub last_success: DateTime<Utc>,

    /// SHA-256 of the artifact contents
    pub checksum: String,
}

impl JobCacheEntry {
    /// Build an entry for freshly produced content
    pub fn fresh(checksum: String) -> Self {
        Self {
            last_success: Utc::now(),
            checksum,
        }
    }

    /// Load the sidecar for an artifact, if present and well-formed
    pub fn load(artifact: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(sidecar_path(artifact)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Whether the entry is younger than the TTL
    ///
    /// A timestamp in the future counts as stale, matching the
    /// clock-skew handling of the sidecar's original consumers.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        let age = Utc::now() - self.last_success;
        match age.to_std() {
            Ok(age) => age < ttl,
            Err(_) => false,
        }
    }

    /// Persist the sidecar next to its artifact
    pub fn save(&self, artifact: &Path) -> Result<()> {
        let path = sidecar_path(artifact);
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(&path, &json)
    }
}

/// Sidecar path for an artifact (`blacklist.list` -> `blacklist.list.md`)
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".md");
    PathBuf::from(name)
}

/// SHA-256 hex digest of artifact contents
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Atomically replace an artifact and its sidecar with new content
pub fn store_artifact(artifact: &Path, data: &[u8], entry: &JobCacheEntry) -> Result<()> {
    if let Some(parent) = artifact.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io("create cache dir", e))?;
    }
    atomic_write(artifact, data)?;
    entry.save(artifact)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).map_err(|e| Error::io("write temp artifact", e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::io("rename artifact", e))
}
