//! Container-runtime backend watcher
//!
//! Lists running containers over the engine REST API. A container
//! labeled `<prefix>.INSTANCE` is a proxy instance; one labeled
//! `<prefix>.SERVER_NAME` declares a managed service. The declared
//! settings are the prefixed labels themselves.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::models::{Instance, ManagedService, RegistrationMethod, ServiceSource};

use super::{Backend, LabelRules, Observation};

/// Minimal container summary as returned by `GET /containers/json`
#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Names", default)]
    names: Vec<String>,

    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,

    #[serde(rename = "State", default)]
    state: String,
}

impl ContainerSummary {
    fn hostname(&self) -> String {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default()
    }
}

/// Watcher over a single container runtime
pub struct DockerWatcher {
    client: reqwest::Client,
    api_url: String,
    prefix: String,
    rules: LabelRules,
    default_port: u16,
}

impl DockerWatcher {
    pub fn new(config: &BackendConfig, default_port: u16) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            prefix: config.label_prefix.clone(),
            rules: LabelRules::new(&config.label_prefix, &config.namespaces),
            default_port,
        })
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let filters = serde_json::json!({ "label": [label] }).to_string();
        let url = format!("{}/containers/json", self.api_url);

        let response = self
            .client
            .get(&url)
            .query(&[("filters", filters.as_str()), ("all", "false")])
            .send()
            .await
            .map_err(|e| Error::BackendUnreachable {
                backend: "docker".to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::BackendUnreachable {
                backend: "docker".to_string(),
                reason: format!("engine returned status {}", response.status()),
            });
        }

        response
            .json::<Vec<ContainerSummary>>()
            .await
            .map_err(|e| Error::BackendUnreachable {
                backend: "docker".to_string(),
                reason: format!("cannot decode container list: {e}"),
            })
    }

    fn instance_marker(&self) -> String {
        format!("{}.INSTANCE", self.prefix)
    }

    fn service_marker(&self) -> String {
        format!("{}.SERVER_NAME", self.prefix)
    }
}

#[async_trait]
impl Backend for DockerWatcher {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn observe(&self) -> Result<Observation> {
        let mut observation = Observation::default();

        for container in self.list_labeled(&self.instance_marker()).await? {
            if !self.rules.namespace_allowed(&container.labels) {
                continue;
            }
            let hostname = container.hostname();
            if hostname.is_empty() {
                continue;
            }
            let mut instance =
                Instance::new(hostname, self.default_port, RegistrationMethod::Discovered)
                    .with_env(self.rules.settings_from(&container.labels));
            instance.healthy = container.state == "running";
            observation.instances.push(instance);
        }

        for container in self.list_labeled(&self.service_marker()).await? {
            if !self.rules.namespace_allowed(&container.labels) {
                continue;
            }
            let settings = self.rules.settings_from(&container.labels);
            let service = ManagedService::from_settings(settings, ServiceSource::Discovered);

            observation.custom_configs.extend(
                self.rules
                    .custom_configs_from(&service.primary_name, &container.labels),
            );
            observation.services.push(service);
        }

        Ok(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn watcher_for(server: &MockServer) -> DockerWatcher {
        let mut backend = Config::default().backend;
        backend.api_url = server.uri();
        DockerWatcher::new(&backend, 5000).unwrap()
    }

    #[tokio::test]
    async fn test_observe_extracts_instances_and_services() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "Names": ["/bw-1"],
                    "State": "running",
                    "Labels": {
                        "fleetward.INSTANCE": "",
                        "fleetward.SERVER_NAME": "a.test",
                        "fleetward.USE_X": "yes"
                    }
                }
            ])))
            .mount(&server)
            .await;

        let observation = watcher_for(&server).observe().await.unwrap();

        assert_eq!(observation.instances.len(), 1);
        assert_eq!(observation.instances[0].hostname, "bw-1");
        assert!(observation.instances[0].healthy);
        // The same labeled container also declares a service; both
        // listing calls hit the same mock here.
        assert_eq!(observation.services.len(), 1);
        assert_eq!(observation.services[0].primary_name, "a.test");
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_backend_error() {
        let mut backend = Config::default().backend;
        backend.api_url = "http://127.0.0.1:1".to_string();
        let watcher = DockerWatcher::new(&backend, 5000).unwrap();

        let err = watcher.observe().await.unwrap_err();
        assert!(matches!(err, Error::BackendUnreachable { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_engine_error_status_is_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = watcher_for(&server).observe().await.unwrap_err();
        assert!(matches!(err, Error::BackendUnreachable { .. }));
    }
}
