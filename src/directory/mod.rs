//! Instance directory: registry of known proxy instances
//!
//! The directory is read by every component and written only under the
//! reconcile lock or through single-entry atomic replacement, so readers
//! never observe a half-updated instance.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{Instance, RegistrationMethod};

// ============================================================================
// Instance Directory
// ============================================================================

/// Registry of all known instances, keyed by hostname
#[derive(Clone)]
pub struct InstanceDirectory {
    instances: Arc<RwLock<HashMap<String, Instance>>>,
}

impl InstanceDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register or update an instance (single-entry replace)
    pub async fn register(&self, instance: Instance) {
        let mut instances = self.instances.write().await;
        instances.insert(instance.hostname.clone(), instance);
    }

    /// Remove an instance, returning it if it existed
    pub async fn remove(&self, hostname: &str) -> Option<Instance> {
        self.instances.write().await.remove(hostname)
    }

    /// Get one instance by hostname
    pub async fn get(&self, hostname: &str) -> Option<Instance> {
        self.instances.read().await.get(hostname).cloned()
    }

    /// All known instances, sorted by hostname for deterministic fanout
    pub async fn all(&self) -> Vec<Instance> {
        let instances = self.instances.read().await;
        let mut list: Vec<Instance> = instances.values().cloned().collect();
        list.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        list
    }

    /// Number of instances currently reporting healthy
    pub async fn healthy_count(&self) -> usize {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| i.healthy)
            .count()
    }

    /// Total number of known instances
    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Whether the directory is empty
    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Update the health flag of one instance
    pub async fn mark_health(&self, hostname: &str, healthy: bool) -> bool {
        let mut instances = self.instances.write().await;
        match instances.get_mut(hostname) {
            Some(instance) => {
                instance.observe_health(healthy);
                true
            }
            None => false,
        }
    }

    /// Replace the whole directory with a fresh observation
    ///
    /// The swap is a single write-lock section; instances absent from
    /// the new set are dropped, which is how backend-reported removals
    /// take effect.
    pub async fn replace_all(&self, fresh: Vec<Instance>) {
        let mut instances = self.instances.write().await;
        instances.clear();
        for instance in fresh {
            instances.insert(instance.hostname.clone(), instance);
        }
    }

    /// Directory statistics for logging
    pub async fn stats(&self) -> DirectoryStats {
        let instances = self.instances.read().await;

        let mut healthy = 0;
        let mut discovered = 0;
        let mut declarative = 0;
        let mut manual = 0;

        for instance in instances.values() {
            if instance.healthy {
                healthy += 1;
            }
            match instance.method {
                RegistrationMethod::Discovered => discovered += 1,
                RegistrationMethod::Declarative => declarative += 1,
                RegistrationMethod::Manual => manual += 1,
            }
        }

        DirectoryStats {
            total: instances.len(),
            healthy,
            discovered,
            declarative,
            manual,
        }
    }
}

impl Default for InstanceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory statistics
#[derive(Debug, Clone)]
pub struct DirectoryStats {
    pub total: usize,
    pub healthy: usize,
    pub discovered: usize,
    pub declarative: usize,
    pub manual: usize,
}

// ============================================================================
// Tests
// ============================================================================
