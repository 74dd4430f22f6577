//! Control-protocol fanout
//!
//! Broadcasts one control call to every known instance, independently.
//! A failed target is recorded and the fanout continues: every instance
//! is always attempted exactly once per call. This is a best-effort
//! broadcast, not a two-phase commit; the fleet may be momentarily
//! inconsistent and the next reconcile pass retries naturally.
//!
//! Health flags from the directory are deliberately not consulted here:
//! health can lag behind actual recovery, so even instances marked
//! unhealthy get their attempt.

use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FanoutConfig;
use crate::models::Instance;

// ============================================================================
// Protocol Types
// ============================================================================

/// JSON body instances return on every completed request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    pub status: String,
    #[serde(default)]
    pub msg: String,
}

/// Outcome of one instance's attempt
#[derive(Debug, Clone)]
pub struct InstanceResponse {
    /// HTTP status code, when a response was received at all
    pub status: Option<u16>,

    /// Decoded reply body, when one was present and parseable
    pub reply: Option<ApiReply>,

    /// Failure description for unreachable/non-2xx targets
    pub error: Option<String>,
}

impl InstanceResponse {
    fn ok(status: u16, reply: Option<ApiReply>) -> Self {
        Self {
            status: Some(status),
            reply,
            error: None,
        }
    }

    fn failed(status: Option<u16>, reply: Option<ApiReply>, error: String) -> Self {
        Self {
            status,
            reply,
            error: Some(error),
        }
    }

    /// Whether this attempt succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-fanout accounting: which instances failed, and every response
///
/// Keyed by instance endpoint; hostnames may repeat across ports.
#[derive(Debug, Clone, Default)]
pub struct FanoutReport {
    /// Endpoints that failed (connect error, timeout, non-2xx or an
    /// API-level error reply)
    pub failed: Vec<String>,

    /// Every instance's outcome, keyed by endpoint
    pub responses: HashMap<String, InstanceResponse>,
}

impl FanoutReport {
    /// Whether every attempted instance succeeded
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    /// Whether a specific instance succeeded
    pub fn succeeded(&self, endpoint: &str) -> bool {
        self.responses
            .get(endpoint)
            .map(InstanceResponse::is_success)
            .unwrap_or(false)
    }

    /// Number of instances attempted
    pub fn attempted(&self) -> usize {
        self.responses.len()
    }
}

// ============================================================================
// Fanout Client
// ============================================================================

/// HTTP fanout client for the per-instance control protocol
pub struct ApiFanout {
    client: Client,
    config: FanoutConfig,
}

impl ApiFanout {
    /// Create a fanout client with the configured bounded timeout
    pub fn new(config: FanoutConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// Broadcast one call to every instance, each attempted exactly once
    pub async fn send(
        &self,
        instances: &[Instance],
        method: Method,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> FanoutReport {
        let attempts = instances.iter().map(|instance| {
            let method = method.clone();
            async move {
                let outcome = self
                    .attempt(instance, method, path, payload, None)
                    .await;
                (instance.endpoint(), outcome)
            }
        });

        self.collect(futures::future::join_all(attempts).await, path)
    }

    /// Broadcast a directory tree as a multipart body to every instance
    ///
    /// Used to deliver cached job artifacts and certificate material.
    /// The tree is read once; each instance gets its own request body.
    pub async fn send_files(
        &self,
        instances: &[Instance],
        dir: &Path,
        path: &str,
    ) -> FanoutReport {
        let files = match collect_files(dir).await {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot read fanout payload directory");
                let mut report = FanoutReport::default();
                for instance in instances {
                    report.failed.push(instance.endpoint());
                    report.responses.insert(
                        instance.endpoint(),
                        InstanceResponse::failed(None, None, format!("payload read error: {e}")),
                    );
                }
                return report;
            }
        };

        let attempts = instances.iter().map(|instance| {
            let files = files.clone();
            async move {
                let outcome = self
                    .attempt(instance, Method::POST, path, None, Some(files))
                    .await;
                (instance.endpoint(), outcome)
            }
        });

        self.collect(futures::future::join_all(attempts).await, path)
    }

    /// Health ping for one instance
    pub async fn ping(&self, instance: &Instance) -> bool {
        self.attempt(instance, Method::GET, "/ping", None, None)
            .await
            .is_success()
    }

    fn collect(
        &self,
        outcomes: Vec<(String, InstanceResponse)>,
        path: &str,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        for (endpoint, outcome) in outcomes {
            if !outcome.is_success() {
                report.failed.push(endpoint.clone());
            }
            report.responses.insert(endpoint, outcome);
        }
        report.failed.sort();

        debug!(
            path,
            attempted = report.attempted(),
            failed = report.failed.len(),
            "fanout completed"
        );
        crate::metrics::record_fanout(path, report.attempted(), report.failed.len());

        report
    }

    // One attempt against one instance. Connect errors, timeouts and
    // non-2xx statuses all come back as a failed outcome; nothing is
    // raised past the fanout boundary.
    async fn attempt(
        &self,
        instance: &Instance,
        method: Method,
        path: &str,
        payload: Option<&serde_json::Value>,
        files: Option<Vec<(String, Vec<u8>)>>,
    ) -> InstanceResponse {
        let url = format!("{}{}", instance.endpoint(), path);

        let mut request = self
            .client
            .request(method, &url)
            .header("User-Agent", &self.config.caller_identity)
            .header("Host", &self.config.api_server_name);

        if let Some(body) = payload {
            request = request.json(body);
        }

        if let Some(files) = files {
            let mut form = reqwest::multipart::Form::new();
            for (name, data) in files {
                form = form.part(
                    name.clone(),
                    reqwest::multipart::Part::bytes(data).file_name(name),
                );
            }
            request = request.multipart(form);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let reply = response.json::<ApiReply>().await.ok();
                if status.is_success() {
                    // A 2xx can still carry an API-level failure.
                    if let Some(r) = reply.as_ref().filter(|r| r.status != "success") {
                        warn!(
                            hostname = %instance.hostname,
                            reply_status = %r.status,
                            msg = %r.msg,
                            "instance reported failure"
                        );
                        let error = format!("api status '{}': {}", r.status, r.msg);
                        return InstanceResponse::failed(Some(status.as_u16()), reply, error);
                    }
                    InstanceResponse::ok(status.as_u16(), reply)
                } else {
                    let msg = reply
                        .as_ref()
                        .map(|r| r.msg.clone())
                        .unwrap_or_else(|| "no reply body".to_string());
                    warn!(
                        hostname = %instance.hostname,
                        status = status.as_u16(),
                        msg = %msg,
                        "instance returned error status"
                    );
                    InstanceResponse::failed(
                        Some(status.as_u16()),
                        reply,
                        format!("status {}: {}", status.as_u16(), msg),
                    )
                }
            }
            Err(e) => {
                warn!(hostname = %instance.hostname, error = %e, "instance unreachable");
                InstanceResponse::failed(None, None, e.to_string())
            }
        }
    }
}

/// Read a directory tree into (relative path, contents) pairs
async fn collect_files(dir: &Path) -> std::io::Result<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path);
            } else {
                let relative = path
                    .strip_prefix(dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                let data = tokio::fs::read(&path).await?;
                files.push((relative, data));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

// ============================================================================
// Tests
// ============================================================================
