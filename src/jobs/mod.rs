//! Scheduled job subsystem
//!
//! Jobs produce cached artifacts (threat-intel lists, certificates,
//! databases). Two independent gates decide what a run means:
//!
//! 1. Freshness: a sidecar younger than the job's interval skips the
//!    run entirely (success, no reload requested).
//! 2. Change detection: a completed run whose artifact hashes equal to
//!    the cached hash reports "no change"; only a differing hash
//!    replaces the cache and requests a propagation cycle.
//!
//! One job's failure never blocks the others; the prior cache entry of
//! a failed job stays untouched.

pub mod cache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::error::{Error, Result};
use cache::{content_hash, JobCacheEntry};

// ============================================================================
// Job Definitions
// ============================================================================

/// How often a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobInterval {
    /// Run once per invocation, no freshness TTL
    Once,
    Hour,
    Day,
    Week,
}

impl JobInterval {
    /// Freshness TTL for the sidecar gate; `None` for once-jobs
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::Once => None,
            Self::Hour => Some(Duration::from_secs(3600)),
            Self::Day => Some(Duration::from_secs(86400)),
            Self::Week => Some(Duration::from_secs(604800)),
        }
    }
}

/// One entry of the job catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    /// Unique job name; also the cache key
    pub name: String,

    /// Scheduling interval
    pub every: JobInterval,

    /// Artifact file name, relative to the cache directory
    pub artifact: String,

    /// Optional source URL; when set, the job downloads it
    #[serde(default)]
    pub source: Option<String>,
}

/// Load the job catalog from a JSON file
pub fn load_catalog(path: &Path) -> Result<Vec<JobDef>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::startup(format!("cannot read job catalog {}: {}", path.display(), e)))?;
    let defs: Vec<JobDef> = serde_json::from_str(&content)
        .map_err(|e| Error::startup(format!("malformed job catalog {}: {}", path.display(), e)))?;

    let mut seen = HashSet::new();
    for def in &defs {
        if !seen.insert(def.name.clone()) {
            return Err(Error::startup(format!(
                "duplicate job name '{}' in catalog",
                def.name
            )));
        }
    }
    Ok(defs)
}

// ============================================================================
// Producers
// ============================================================================

/// A job's artifact producer
#[async_trait]
pub trait JobProducer: Send + Sync {
    /// Produce the artifact contents
    async fn produce(&self) -> Result<Vec<u8>>;
}

/// Producer that downloads its artifact from a URL
pub struct HttpDownloadProducer {
    client: reqwest::Client,
    url: String,
}

impl HttpDownloadProducer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl JobProducer for HttpDownloadProducer {
    async fn produce(&self) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::JobFailed {
                job: self.url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(Error::JobFailed {
                job: self.url.clone(),
                reason: format!("download returned status {}", response.status()),
            });
        }

        let body = response.bytes().await.map_err(|e| Error::JobFailed {
            job: self.url.clone(),
            reason: e.to_string(),
        })?;
        Ok(body.to_vec())
    }
}

// ============================================================================
// Run Outcomes
// ============================================================================

/// Outcome of one job in one scheduling pass
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Sidecar still fresh, producer not run
    Skipped,
    /// Producer ran, artifact hash unchanged
    Unchanged,
    /// Producer ran, artifact replaced
    Changed,
    /// Producer failed; prior cache untouched
    Failed(String),
    /// Previous run still in flight, not restarted
    InFlight,
}

impl JobOutcome {
    /// Whether the outcome counts as success for run-once aggregation
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    fn metric_label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Unchanged => "unchanged",
            Self::Changed => "changed",
            Self::Failed(_) => "failed",
            Self::InFlight => "in_flight",
        }
    }
}

/// Aggregate result of one scheduling pass
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Per-job outcomes
    pub outcomes: HashMap<String, JobOutcome>,
}

impl TickReport {
    /// Whether any job produced a changed artifact
    pub fn any_changed(&self) -> bool {
        self.outcomes.values().any(|o| *o == JobOutcome::Changed)
    }

    /// Whether every job was skipped or succeeded
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(JobOutcome::is_success)
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Executes the job catalog with capped parallelism
///
/// Cache writes for distinct job names never contend (one artifact per
/// name); writes to the same job's entry are serialized by the
/// in-flight guard, which also prevents a job from being restarted
/// while its previous run is still going.
pub struct JobScheduler {
    defs: Vec<JobDef>,
    producers: HashMap<String, Arc<dyn JobProducer>>,
    cache_dir: PathBuf,
    workers: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl JobScheduler {
    /// Create a scheduler over a catalog
    pub fn new(defs: Vec<JobDef>, cache_dir: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            defs,
            producers: HashMap::new(),
            cache_dir: cache_dir.into(),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register a producer for a catalog entry without a source URL
    pub fn register_producer(&mut self, name: impl Into<String>, producer: Arc<dyn JobProducer>) {
        self.producers.insert(name.into(), producer);
    }

    /// Artifact path for a job
    pub fn artifact_path(&self, def: &JobDef) -> PathBuf {
        self.cache_dir.join(&def.artifact)
    }

    /// Run one scheduling pass over every job
    ///
    /// Jobs run concurrently up to the worker cap; the pass completes
    /// when every job has reported. The caller consults
    /// [`TickReport::any_changed`] to decide whether a propagation
    /// cycle is needed.
    pub async fn tick(&self) -> TickReport {
        let mut handles = Vec::with_capacity(self.defs.len());

        for def in &self.defs {
            let producer = self.producer_for(def);
            let artifact = self.artifact_path(def);
            let name = def.name.clone();
            let every = def.every;
            let workers = Arc::clone(&self.workers);
            let in_flight = Arc::clone(&self.in_flight);

            handles.push(tokio::spawn(async move {
                {
                    let mut guard = in_flight.lock().await;
                    if !guard.insert(name.clone()) {
                        return (name, JobOutcome::InFlight);
                    }
                }

                // Acquire never fails: the semaphore is never closed.
                let permit = workers.acquire().await;
                let outcome = run_job(&name, every, producer, &artifact).await;
                drop(permit);

                in_flight.lock().await.remove(&name);
                (name, outcome)
            }));
        }

        let mut report = TickReport::default();
        for handle in handles {
            match handle.await {
                Ok((name, outcome)) => {
                    crate::metrics::record_job(&name, outcome.metric_label());
                    report.outcomes.insert(name, outcome);
                }
                Err(e) => warn!(error = %e, "job task panicked"),
            }
        }
        report
    }

    /// Execute the full job set and report overall success
    ///
    /// Used by the non-daemon "apply once and exit" invocation: returns
    /// `true` only if every job was skipped (fresh) or succeeded.
    pub async fn run_once(&self) -> bool {
        let report = self.tick().await;
        for (name, outcome) in &report.outcomes {
            match outcome {
                JobOutcome::Failed(reason) => {
                    warn!(job = %name, reason = %reason, "job failed in run-once pass")
                }
                outcome => info!(job = %name, outcome = ?outcome, "job completed"),
            }
        }
        report.all_succeeded()
    }

    fn producer_for(&self, def: &JobDef) -> Option<Arc<dyn JobProducer>> {
        if let Some(url) = &def.source {
            return HttpDownloadProducer::new(url.clone(), Duration::from_secs(60))
                .ok()
                .map(|p| Arc::new(p) as Arc<dyn JobProducer>);
        }
        self.producers.get(&def.name).cloned()
    }
}

/// Execute one job through both gates
async fn run_job(
    name: &str,
    every: JobInterval,
    producer: Option<Arc<dyn JobProducer>>,
    artifact: &Path,
) -> JobOutcome {
    let cached = JobCacheEntry::load(artifact);

    // Gate 1: freshness.
    if let (Some(ttl), Some(entry)) = (every.ttl(), &cached) {
        if entry.is_fresh(ttl) {
            return JobOutcome::Skipped;
        }
    }

    let Some(producer) = producer else {
        return JobOutcome::Failed(format!("no producer registered for '{name}'"));
    };

    let data = match producer.produce().await {
        Ok(data) => data,
        Err(e) => {
            warn!(job = name, error = %e, "job producer failed");
            return JobOutcome::Failed(e.to_string());
        }
    };

    // Gate 2: change detection.
    let checksum = content_hash(&data);
    if let Some(entry) = &cached {
        if entry.checksum == checksum {
            // Refresh the freshness window; artifact untouched.
            let refreshed = JobCacheEntry::fresh(checksum);
            if let Err(e) = refreshed.save(artifact) {
                warn!(job = name, error = %e, "cannot refresh cache sidecar");
            }
            return JobOutcome::Unchanged;
        }
    }

    let entry = JobCacheEntry::fresh(checksum);
    match cache::store_artifact(artifact, &data, &entry) {
        Ok(()) => {
            info!(job = name, artifact = %artifact.display(), "artifact updated");
            JobOutcome::Changed
        }
        Err(e) => {
            warn!(job = name, error = %e, "cannot store artifact");
            JobOutcome::Failed(e.to_string())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
