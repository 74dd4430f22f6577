//! Kubernetes backend watcher
//!
//! Watches pods and ingress resources cluster-wide through the
//! apiserver REST API. Annotations play the role labels play in the
//! container variant; the configured prefix (as `<prefix>.io/`) is
//! stripped to produce the setting key. Ingress host rules supply the
//! server name when no annotation declares one.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::models::{Instance, ManagedService, RegistrationMethod, ServiceSource};

use super::{Backend, LabelRules, Observation};

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: String,

    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: Metadata,

    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: String,

    #[serde(rename = "podIP", default)]
    pod_ip: String,
}

#[derive(Debug, Deserialize)]
struct Ingress {
    metadata: Metadata,

    #[serde(default)]
    spec: IngressSpec,
}

#[derive(Debug, Default, Deserialize)]
struct IngressSpec {
    #[serde(default)]
    rules: Vec<IngressRule>,
}

#[derive(Debug, Deserialize)]
struct IngressRule {
    #[serde(default)]
    host: String,
}

/// Watcher over a kubernetes apiserver
pub struct KubernetesWatcher {
    client: reqwest::Client,
    api_url: String,
    annotation_prefix: String,
    rules: LabelRules,
    default_port: u16,
}

impl KubernetesWatcher {
    pub fn new(config: &BackendConfig, default_port: u16) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        // Annotation form of the label prefix: `fleetward.io/KEY`.
        let annotation_prefix = format!("{}.io", config.label_prefix);
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            rules: LabelRules::new(&annotation_prefix, &config.namespaces),
            annotation_prefix,
            default_port,
        })
    }

    async fn list<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Vec<T>> {
        let url = format!("{}{}", self.api_url, path);

        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| Error::BackendUnreachable {
                    backend: "kubernetes".to_string(),
                    reason: e.to_string(),
                })?;

        if !response.status().is_success() {
            return Err(Error::BackendUnreachable {
                backend: "kubernetes".to_string(),
                reason: format!("apiserver returned status {}", response.status()),
            });
        }

        let list: ObjectList<T> =
            response
                .json()
                .await
                .map_err(|e| Error::BackendUnreachable {
                    backend: "kubernetes".to_string(),
                    reason: format!("cannot decode object list: {e}"),
                })?;
        Ok(list.items)
    }

    fn instance_marker(&self) -> String {
        format!("{}/INSTANCE", self.annotation_prefix)
    }
}

#[async_trait]
impl Backend for KubernetesWatcher {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn observe(&self) -> Result<Observation> {
        let mut observation = Observation::default();

        // Instances are annotated pods; address by pod IP so the
        // control call does not depend on cluster DNS.
        let pods: Vec<Pod> = self.list("/api/v1/pods").await?;
        let marker = self.instance_marker();
        for pod in pods {
            let annotations = normalize(&pod.metadata.annotations);
            if !pod.metadata.annotations.contains_key(&marker)
                || !self.rules.namespace_allowed(&annotations)
            {
                continue;
            }
            let hostname = if pod.status.pod_ip.is_empty() {
                pod.metadata.name.clone()
            } else {
                pod.status.pod_ip.clone()
            };
            let mut instance =
                Instance::new(hostname, self.default_port, RegistrationMethod::Discovered)
                    .with_env(self.rules.settings_from(&annotations));
            instance.healthy = pod.status.phase == "Running";
            observation.instances.push(instance);
        }

        // Managed services are annotated ingresses.
        let ingresses: Vec<Ingress> = self
            .list("/apis/networking.k8s.io/v1/ingresses")
            .await?;
        for ingress in ingresses {
            let annotations = normalize(&ingress.metadata.annotations);
            if !self.rules.namespace_allowed(&annotations) {
                continue;
            }
            let mut settings = self.rules.settings_from(&annotations);
            if settings.is_empty() && ingress.spec.rules.is_empty() {
                continue;
            }
            if !settings.contains_key("SERVER_NAME") {
                let hosts: Vec<String> = ingress
                    .spec
                    .rules
                    .iter()
                    .filter(|r| !r.host.is_empty())
                    .map(|r| r.host.clone())
                    .collect();
                if hosts.is_empty() {
                    continue;
                }
                settings.insert("SERVER_NAME".to_string(), hosts.join(" "));
            }

            let managed = ManagedService::from_settings(settings, ServiceSource::Discovered);
            observation
                .custom_configs
                .extend(self.rules.custom_configs_from(&managed.primary_name, &annotations));
            observation.services.push(managed);
        }

        Ok(observation)
    }
}

/// Rewrite `prefix.io/KEY` annotations to the `prefix.io.KEY` form the
/// shared label rules understand
fn normalize(annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    annotations
        .iter()
        .map(|(k, v)| (k.replacen('/', ".", 1), v.clone()))
        .collect()
}
