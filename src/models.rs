//! Core data structures shared across the control plane
//!
//! The types here are the vocabulary every component speaks: proxy
//! instances, managed services (virtual hosts) and custom configuration
//! blobs extracted from backend labels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Instance
// ============================================================================

/// How an instance became known to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationMethod {
    /// Declared in a static variables file
    Declarative,
    /// Discovered through an orchestrator backend
    Discovered,
    /// Added explicitly through an operator action
    Manual,
}

impl fmt::Display for RegistrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declarative => write!(f, "declarative"),
            Self::Discovered => write!(f, "discovered"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A running proxy/WAF process registered with the control plane
///
/// Identity key is `hostname` (case-sensitive, unique). The instance is
/// regenerated on every watch cycle; `env` carries its raw declared
/// key/value pairs exactly as the backend reported them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique hostname, identity key
    pub hostname: String,

    /// Control protocol port
    pub port: u16,

    /// Registration method
    pub method: RegistrationMethod,

    /// Health as last observed by the backend (advisory, may lag)
    pub healthy: bool,

    /// When the instance was last observed
    pub last_seen: DateTime<Utc>,

    /// Primary server names declared on the instance itself
    pub server_names: Vec<String>,

    /// Raw declared key/value pairs
    pub env: BTreeMap<String, String>,
}

impl Instance {
    /// Create a new instance record
    pub fn new(hostname: impl Into<String>, port: u16, method: RegistrationMethod) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            method,
            healthy: false,
            last_seen: Utc::now(),
            server_names: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Control protocol endpoint for this instance
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }

    /// Set the declared environment, extracting server names
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        if let Some(names) = env.get("SERVER_NAME") {
            self.server_names = names.split_whitespace().map(str::to_string).collect();
        }
        self.env = env;
        self
    }

    /// Mark health and refresh the observation timestamp
    pub fn observe_health(&mut self, healthy: bool) {
        self.healthy = healthy;
        self.last_seen = Utc::now();
    }
}

// ============================================================================
// Managed Service
// ============================================================================

/// Where a managed service definition came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceSource {
    /// Discovered from backend labels/annotations
    Discovered,
    /// Statically declared
    Static,
}

/// A declared virtual host whose settings are merged fleet-wide
///
/// Regenerated wholesale on every watch cycle; the merger diffs against
/// the previous snapshot, there is no incremental patching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedService {
    /// First of the space-separated name list; empty if undeclared
    pub primary_name: String,

    /// Full declared name list
    pub names: Vec<String>,

    /// Per-setting key/value map
    pub settings: BTreeMap<String, String>,

    /// Definition source
    pub source: ServiceSource,
}

impl ManagedService {
    /// Build a service from its raw declared settings
    ///
    /// The primary name is the first entry of `SERVER_NAME`; a service
    /// without one has an empty primary name and is skipped for
    /// prefixing purposes, but its unprefixed keys still apply.
    pub fn from_settings(settings: BTreeMap<String, String>, source: ServiceSource) -> Self {
        let names: Vec<String> = settings
            .get("SERVER_NAME")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            primary_name: names.first().cloned().unwrap_or_default(),
            names,
            settings,
            source,
        }
    }
}

// ============================================================================
// Custom Configs
// ============================================================================

/// Supported custom configuration blob types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigType {
    Http,
    Stream,
    ServerHttp,
    ServerStream,
    DefaultServerHttp,
    Modsec,
    ModsecCrs,
}

impl ConfigType {
    /// All supported types
    pub const ALL: [ConfigType; 7] = [
        ConfigType::Http,
        ConfigType::Stream,
        ConfigType::ServerHttp,
        ConfigType::ServerStream,
        ConfigType::DefaultServerHttp,
        ConfigType::Modsec,
        ConfigType::ModsecCrs,
    ];

    /// Parse the label suffix form (e.g. `SERVER_HTTP`, `MODSEC_CRS`)
    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "HTTP" => Some(Self::Http),
            "STREAM" => Some(Self::Stream),
            "SERVER_HTTP" => Some(Self::ServerHttp),
            "SERVER_STREAM" => Some(Self::ServerStream),
            "DEFAULT_SERVER_HTTP" => Some(Self::DefaultServerHttp),
            "MODSEC" => Some(Self::Modsec),
            "MODSEC_CRS" => Some(Self::ModsecCrs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Stream => "stream",
            Self::ServerHttp => "server-http",
            Self::ServerStream => "server-stream",
            Self::DefaultServerHttp => "default-server-http",
            Self::Modsec => "modsec",
            Self::ModsecCrs => "modsec-crs",
        }
    }
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A per-service custom configuration text blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomConfig {
    /// Owning service primary name; `None` for fleet-wide blobs
    pub service: Option<String>,

    /// Blob type
    pub config_type: ConfigType,

    /// Blob name (label remainder, `.conf` suffix stripped)
    pub name: String,

    /// Blob content
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_instance_endpoint() {
        let instance = Instance::new("bw-1", 5000, RegistrationMethod::Discovered);
        assert_eq!(instance.endpoint(), "http://bw-1:5000");
    }

    #[test]
    fn test_instance_server_names_from_env() {
        let instance = Instance::new("bw-1", 5000, RegistrationMethod::Discovered)
            .with_env(settings(&[("SERVER_NAME", "a.test b.test")]));
        assert_eq!(instance.server_names, vec!["a.test", "b.test"]);
    }

    #[test]
    fn test_service_primary_name() {
        let svc = ManagedService::from_settings(
            settings(&[("SERVER_NAME", "a.test www.a.test"), ("USE_X", "yes")]),
            ServiceSource::Discovered,
        );
        assert_eq!(svc.primary_name, "a.test");
        assert_eq!(svc.names.len(), 2);
    }

    #[test]
    fn test_service_without_name() {
        let svc =
            ManagedService::from_settings(settings(&[("USE_X", "yes")]), ServiceSource::Static);
        assert!(svc.primary_name.is_empty());
        assert!(svc.names.is_empty());
    }

    #[test]
    fn test_config_type_from_label() {
        assert_eq!(
            ConfigType::from_label("SERVER_HTTP"),
            Some(ConfigType::ServerHttp)
        );
        assert_eq!(
            ConfigType::from_label("MODSEC_CRS"),
            Some(ConfigType::ModsecCrs)
        );
        assert_eq!(ConfigType::from_label("NOT_A_TYPE"), None);
    }
}
