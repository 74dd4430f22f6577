//! Static backend: declared configuration, no discovery
//!
//! Used when the fleet topology is fixed and supplied out-of-band as an
//! env-style variables file:
//!
//! ```text
//! FLEETWARD_INSTANCES=bw-1:5000 bw-2
//! SERVER_NAME=a.test b.test
//! USE_X=no
//! a.test_USE_X=yes
//! ```
//!
//! `FLEETWARD_INSTANCES` declares the instances. `SERVER_NAME` declares
//! the managed services. A `name_KEY` line whose name matches a
//! declared service becomes that service's setting; every other line is
//! instance-level.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::models::{Instance, ManagedService, RegistrationMethod, ServiceSource};

use super::{Backend, Observation};

/// Reserved key declaring the fixed instance list
const INSTANCES_KEY: &str = "FLEETWARD_INSTANCES";

/// Watcher over a static variables file
pub struct StaticWatcher {
    path: PathBuf,
    default_port: u16,
}

impl StaticWatcher {
    pub fn new(path: impl Into<PathBuf>, default_port: u16) -> Self {
        Self {
            path: path.into(),
            default_port,
        }
    }
}

#[async_trait]
impl Backend for StaticWatcher {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn observe(&self) -> Result<Observation> {
        let content =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| Error::BackendUnreachable {
                    backend: "static".to_string(),
                    reason: format!("cannot read {}: {}", self.path.display(), e),
                })?;

        let variables = parse_variables(&content);
        Ok(build_observation(variables, self.default_port))
    }
}

/// Parse `KEY=VALUE` lines; `#` comments and blank lines are skipped
fn parse_variables(content: &str) -> BTreeMap<String, String> {
    let mut variables = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            variables.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    variables
}

fn build_observation(variables: BTreeMap<String, String>, default_port: u16) -> Observation {
    let mut observation = Observation::default();

    let service_names: Vec<String> = variables
        .get("SERVER_NAME")
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    // Split declared pairs into per-service overrides and the shared
    // instance-level remainder.
    let mut instance_env: BTreeMap<String, String> = BTreeMap::new();
    let mut per_service: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (key, value) in &variables {
        if key == INSTANCES_KEY {
            continue;
        }
        if let Some(name) = service_names
            .iter()
            .find(|n| key.starts_with(&format!("{}_", n)))
        {
            let stripped = key[name.len() + 1..].to_string();
            per_service
                .entry(name.clone())
                .or_default()
                .insert(stripped, value.clone());
            continue;
        }
        instance_env.insert(key.clone(), value.clone());
    }

    for entry in variables
        .get(INSTANCES_KEY)
        .map(String::as_str)
        .unwrap_or("")
        .split_whitespace()
    {
        let (hostname, port) = match entry.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (entry.to_string(), default_port),
            },
            None => (entry.to_string(), default_port),
        };
        let mut instance = Instance::new(hostname, port, RegistrationMethod::Declarative)
            .with_env(instance_env.clone());
        // Declared topology: reachability is verified by the ping
        // fanout, not by discovery.
        instance.healthy = true;
        observation.instances.push(instance);
    }

    for name in &service_names {
        let mut settings = per_service.remove(name).unwrap_or_default();
        settings.insert("SERVER_NAME".to_string(), name.clone());
        observation
            .services
            .push(ManagedService::from_settings(settings, ServiceSource::Static));
    }

    observation
}
