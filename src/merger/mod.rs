//! Configuration merger
//!
//! Turns the observed instance and service lists into one normalized
//! settings snapshot. The merge is pure and deterministic: inputs are
//! stable-sorted before application, so identical observations always
//! produce identical snapshots regardless of map iteration order.
//!
//! Precedence, lowest to highest: schema defaults, instance-declared
//! pairs, service-declared pairs. A multisite-scoped key also receives
//! a name-prefixed copy per declared service name, reproducing
//! "inherit the instance-level default unless a site overrides it".
//!
//! Rejected pairs are collected into the [`MergeReport`]; they are
//! never raised past the merge loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::models::{Instance, ManagedService};
use crate::schema::{RejectReason, SettingCatalog, SettingScope};

// ============================================================================
// Snapshot
// ============================================================================

/// The complete merged configuration for one reconciliation pass
///
/// Immutable once computed; a new snapshot always fully replaces the
/// old one, never a partial merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Fully merged key/value map
    pub entries: BTreeMap<String, String>,

    /// When the snapshot was computed
    pub computed_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    /// An empty snapshot (used as the previous state on first apply)
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            computed_at: Utc::now(),
        }
    }

    /// Look up one merged value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of merged entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Merge Report
// ============================================================================

/// One rejected key/value pair
#[derive(Debug, Clone)]
pub struct RejectedPair {
    /// Where the pair was declared (instance hostname or service name)
    pub origin: String,

    /// The raw key as declared
    pub key: String,

    /// Why it was dropped
    pub reason: RejectReason,
}

/// Outcome report of one merge pass
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Pairs accepted into the snapshot
    pub applied: usize,

    /// Pairs dropped with their reasons
    pub rejected: Vec<RejectedPair>,
}

/// Full result of [`merge`]
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The computed snapshot
    pub snapshot: ConfigSnapshot,

    /// Whether the snapshot differs from the previous one
    pub changed: bool,

    /// Accept/reject accounting
    pub report: MergeReport,
}

// ============================================================================
// Merge
// ============================================================================

/// Merge observed instances and services into a configuration snapshot
///
/// `previous` is the last published snapshot; `changed` is the result
/// of a key-by-key comparison against it. Persisting the snapshot is
/// the caller's concern; the merger's contract ends here.
pub fn merge(
    catalog: &SettingCatalog,
    instances: &[Instance],
    services: &[ManagedService],
    previous: &ConfigSnapshot,
) -> MergeOutcome {
    let mut entries: BTreeMap<String, String> = BTreeMap::new();
    let mut report = MergeReport::default();

    // Schema defaults come first; everything else overrides them.
    for setting in catalog.iter() {
        entries.insert(setting.key.clone(), setting.default.clone());
    }

    // Deterministic iteration order so last-write-wins is stable.
    let mut instances: Vec<&Instance> = instances.iter().collect();
    instances.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    let mut services: Vec<&ManagedService> = services.iter().collect();
    services.sort_by(|a, b| a.primary_name.cmp(&b.primary_name));

    // The fleet-wide server name list is the ordered union of
    // instance-declared names and service primary names.
    let mut all_names: Vec<String> = Vec::new();
    for instance in &instances {
        for name in &instance.server_names {
            if !all_names.contains(name) {
                all_names.push(name.clone());
            }
        }
    }
    for service in &services {
        if !service.primary_name.is_empty() && !all_names.contains(&service.primary_name) {
            all_names.push(service.primary_name.clone());
        }
    }

    // Instance-level pairs, prefixed per declared name when multisite.
    for instance in &instances {
        for (key, value) in &instance.env {
            match catalog.validate(key, value) {
                Ok(resolved) => {
                    entries.insert(key.clone(), value.clone());
                    if resolved.setting.scope == SettingScope::Multisite {
                        for name in &all_names {
                            entries.insert(format!("{}_{}", name, key), value.clone());
                        }
                    }
                    report.applied += 1;
                }
                Err(reason) => {
                    warn!(
                        origin = %instance.hostname,
                        key = %key,
                        %reason,
                        "dropping rejected instance setting"
                    );
                    report.rejected.push(RejectedPair {
                        origin: instance.hostname.clone(),
                        key: key.clone(),
                        reason,
                    });
                }
            }
        }
    }

    // Service-level pairs win last; a multisite pair writes both the
    // plain key and the service-prefixed copy.
    for service in &services {
        for (key, value) in &service.settings {
            match catalog.validate(key, value) {
                Ok(resolved) => {
                    entries.insert(key.clone(), value.clone());
                    if resolved.setting.scope == SettingScope::Multisite
                        && !service.primary_name.is_empty()
                    {
                        entries.insert(
                            format!("{}_{}", service.primary_name, key),
                            value.clone(),
                        );
                    }
                    report.applied += 1;
                }
                Err(reason) => {
                    warn!(
                        origin = %service.primary_name,
                        key = %key,
                        %reason,
                        "dropping rejected service setting"
                    );
                    report.rejected.push(RejectedPair {
                        origin: service.primary_name.clone(),
                        key: key.clone(),
                        reason,
                    });
                }
            }
        }
    }

    // SERVER_NAME carries the fleet-wide name list.
    entries.insert("SERVER_NAME".to_string(), all_names.join(" "));

    let changed = entries != previous.entries;
    debug!(
        entries = entries.len(),
        applied = report.applied,
        rejected = report.rejected.len(),
        changed,
        "merge pass completed"
    );

    MergeOutcome {
        snapshot: ConfigSnapshot {
            entries,
            computed_at: Utc::now(),
        },
        changed,
        report,
    }
}

// ============================================================================
// Tests
// ============================================================================
