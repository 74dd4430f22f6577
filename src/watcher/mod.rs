//! Backend watchers
//!
//! A watcher observes one infrastructure backend and yields the current
//! set of instances and managed services with their declared settings.
//! Four interchangeable variants exist: container runtime, swarm,
//! kubernetes inferred over their REST APIs, and a static variables
//! file for fixed topologies.
//!
//! Failure semantics: a watcher that cannot reach its backend logs and
//! retries on the next tick. A failed observation means "no change this
//! cycle", never a crash; nothing here propagates past the
//! reconciliation loop boundary.

pub mod docker;
pub mod kubernetes;
pub mod static_file;
pub mod swarm;

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{ConfigType, CustomConfig, Instance, ManagedService};

// ============================================================================
// Observation
// ============================================================================

/// One full observation of the backend
///
/// Always a complete snapshot; watchers never emit incremental patches.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub instances: Vec<Instance>,
    pub services: Vec<ManagedService>,
    pub custom_configs: Vec<CustomConfig>,
}

/// A backend the control plane can observe
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for logging
    fn name(&self) -> &'static str;

    /// Produce the current full observation
    async fn observe(&self) -> Result<Observation>;
}

// ============================================================================
// Watch Loop
// ============================================================================

/// Spawn the background watch loop
///
/// Observes on every poll tick and pushes the result onto a bounded
/// channel the reconciliation loop selects on. Backend errors are
/// logged and swallowed; the loop keeps ticking until `shutdown` fires.
pub fn spawn_watch(
    backend: Arc<dyn Backend>,
    poll_interval: Duration,
    tx: mpsc::Sender<Observation>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match backend.observe().await {
                        Ok(observation) => {
                            debug!(
                                backend = backend.name(),
                                instances = observation.instances.len(),
                                services = observation.services.len(),
                                "backend observed"
                            );
                            if tx.send(observation).await.is_err() {
                                // Receiver gone, the loop has shut down.
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(
                                backend = backend.name(),
                                error = %e,
                                "backend unreachable, retrying next tick"
                            );
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(backend = backend.name(), "watch loop stopping");
                        return;
                    }
                }
            }
        }
    })
}

// ============================================================================
// Label Helpers
// ============================================================================

/// Shared label/annotation extraction used by the discovery variants
pub(crate) struct LabelRules {
    prefix: String,
    namespaces: Vec<String>,
    custom_conf_rx: Regex,
}

impl LabelRules {
    pub fn new(prefix: &str, namespaces: &[String]) -> Self {
        // e.g. fleetward.CUSTOM_CONF_SERVER_HTTP_my-snippet
        let custom_conf_rx = Regex::new(
            r"^CUSTOM_CONF_(SERVER_STREAM|SERVER_HTTP|DEFAULT_SERVER_HTTP|MODSEC_CRS|MODSEC|STREAM|HTTP)_(.+)$",
        )
        .expect("static regex");
        Self {
            prefix: format!("{}.", prefix),
            namespaces: namespaces.to_vec(),
            custom_conf_rx,
        }
    }

    /// Whether a labeled workload passes the namespace filter
    pub fn namespace_allowed(&self, labels: &BTreeMap<String, String>) -> bool {
        if self.namespaces.is_empty() {
            return true;
        }
        let ns = labels
            .get(&format!("{}NAMESPACE", self.prefix))
            .map(String::as_str)
            .unwrap_or("");
        self.namespaces.iter().any(|n| n == ns)
    }

    /// Whether the workload carries the instance marker label
    pub fn is_instance(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.contains_key(&format!("{}INSTANCE", self.prefix))
    }

    /// Whether the workload declares a managed service
    pub fn is_service(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.contains_key(&format!("{}SERVER_NAME", self.prefix))
    }

    /// Strip the prefix from every recognized label, dropping the rest
    pub fn settings_from(&self, labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        labels
            .iter()
            .filter_map(|(key, value)| {
                let stripped = key.strip_prefix(&self.prefix)?;
                if self.custom_conf_rx.is_match(stripped) {
                    return None;
                }
                Some((stripped.to_string(), value.clone()))
            })
            .collect()
    }

    /// Extract custom configuration blobs from a service's labels
    pub fn custom_configs_from(
        &self,
        service_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Vec<CustomConfig> {
        let mut configs = Vec::new();
        for (key, value) in labels {
            let Some(stripped) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let Some(caps) = self.custom_conf_rx.captures(stripped) else {
                continue;
            };
            let Some(config_type) = ConfigType::from_label(&caps[1]) else {
                continue;
            };
            configs.push(CustomConfig {
                service: if service_name.is_empty() {
                    None
                } else {
                    Some(service_name.to_string())
                },
                config_type,
                name: caps[2].trim_end_matches(".conf").to_string(),
                data: value.clone(),
            });
        }
        configs
    }
}

// ============================================================================
// Tests
// ============================================================================
