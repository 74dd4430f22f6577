//! Swarm backend watcher
//!
//! Same label shape as the container-runtime variant, but queries
//! cluster-wide services from a manager node instead of single
//! containers: every service in the stack is a candidate instance or
//! managed service.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::models::{Instance, ManagedService, RegistrationMethod, ServiceSource};

use super::{Backend, LabelRules, Observation};

#[derive(Debug, Deserialize)]
struct SwarmService {
    #[serde(rename = "Spec")]
    spec: SwarmServiceSpec,
}

#[derive(Debug, Deserialize)]
struct SwarmServiceSpec {
    #[serde(rename = "Name", default)]
    name: String,

    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
}

/// Watcher over a swarm manager
pub struct SwarmWatcher {
    client: reqwest::Client,
    api_url: String,
    rules: LabelRules,
    default_port: u16,
}

impl SwarmWatcher {
    pub fn new(config: &BackendConfig, default_port: u16) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            rules: LabelRules::new(&config.label_prefix, &config.namespaces),
            default_port,
        })
    }

    async fn list_services(&self) -> Result<Vec<SwarmService>> {
        let url = format!("{}/services", self.api_url);

        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| Error::BackendUnreachable {
                    backend: "swarm".to_string(),
                    reason: e.to_string(),
                })?;

        if !response.status().is_success() {
            return Err(Error::BackendUnreachable {
                backend: "swarm".to_string(),
                reason: format!("manager returned status {}", response.status()),
            });
        }

        response
            .json::<Vec<SwarmService>>()
            .await
            .map_err(|e| Error::BackendUnreachable {
                backend: "swarm".to_string(),
                reason: format!("cannot decode service list: {e}"),
            })
    }
}

#[async_trait]
impl Backend for SwarmWatcher {
    fn name(&self) -> &'static str {
        "swarm"
    }

    async fn observe(&self) -> Result<Observation> {
        let mut observation = Observation::default();

        for service in self.list_services().await? {
            let labels = &service.spec.labels;
            if !self.rules.namespace_allowed(labels) {
                continue;
            }

            if self.rules.is_instance(labels) {
                // A swarm service is reachable through its VIP under
                // its service name; health is resolved by the ping
                // fanout, the manager API does not report it here.
                let mut instance = Instance::new(
                    service.spec.name.clone(),
                    self.default_port,
                    RegistrationMethod::Discovered,
                )
                .with_env(self.rules.settings_from(labels));
                instance.healthy = true;
                observation.instances.push(instance);
            }

            if self.rules.is_service(labels) {
                let settings = self.rules.settings_from(labels);
                let managed = ManagedService::from_settings(settings, ServiceSource::Discovered);
                observation
                    .custom_configs
                    .extend(self.rules.custom_configs_from(&managed.primary_name, labels));
                observation.services.push(managed);
            }
        }

        Ok(observation)
    }
}
