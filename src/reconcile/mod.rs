//! Reconciliation loop
//!
//! The loop drives the fleet toward the observed state: every backend
//! observation is merged into a configuration snapshot, and when the
//! snapshot differs from the last published one the new configuration
//! is broadcast to the fleet and a reload is requested.
//!
//! Delivery is best-effort broadcast. A reload is only requested from
//! instances whose configuration push succeeded, and a pass counts as
//! published when at least one instance accepted the configuration;
//! instances that missed it converge on the next changed pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::InstanceDirectory;
use crate::error::{Error, Result};
use crate::fanout::{ApiFanout, FanoutReport};
use crate::jobs::JobScheduler;
use crate::merger::{merge, ConfigSnapshot};
use crate::metrics;
use crate::models::Instance;
use crate::schema::SettingCatalog;
use crate::store::Store;
use crate::utils::{with_retry, RetryConfig};
use crate::watcher::Observation;

/// How often the job scheduler gets a tick while watching
const JOB_TICK_INTERVAL: Duration = Duration::from_secs(3600);

/// Poll interval while waiting for the store schema
const STORE_WAIT_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Pass Report
// ============================================================================

/// Outcome of one reconciliation pass
#[derive(Debug)]
pub struct PassReport {
    /// Correlation id shared by every log line of the pass
    pub pass_id: Uuid,

    /// Whether the merged snapshot differed from the last published one
    pub changed: bool,

    /// Configuration fanout, present when a publish was attempted
    pub config: Option<FanoutReport>,

    /// Reload fanout, present when at least one config push succeeded
    pub reload: Option<FanoutReport>,
}

impl PassReport {
    /// At least one instance accepted the new configuration
    pub fn published(&self) -> bool {
        match &self.config {
            Some(report) => report.attempted() > report.failed.len(),
            None => false,
        }
    }

    /// Nothing left to deliver: either unchanged, or every instance
    /// accepted both the configuration and the reload
    pub fn converged(&self) -> bool {
        if !self.changed && self.config.is_none() {
            return true;
        }
        let config_ok = self.config.as_ref().is_some_and(|r| r.all_succeeded());
        let reload_ok = self.reload.as_ref().is_some_and(|r| r.all_succeeded());
        config_ok && reload_ok
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Owns the merge/publish cycle and the last published snapshot
pub struct Reconciler {
    directory: Arc<InstanceDirectory>,
    fanout: Arc<ApiFanout>,
    catalog: SettingCatalog,
    store: Arc<dyn Store>,
    lock: Arc<Mutex<()>>,
    scheduler: Option<Arc<JobScheduler>>,
    cache_dir: PathBuf,
    previous: ConfigSnapshot,
    applied_once: bool,
}

impl Reconciler {
    pub fn new(
        directory: Arc<InstanceDirectory>,
        fanout: Arc<ApiFanout>,
        catalog: SettingCatalog,
        store: Arc<dyn Store>,
        lock: Arc<Mutex<()>>,
        scheduler: Option<Arc<JobScheduler>>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            directory,
            fanout,
            catalog,
            store,
            lock,
            scheduler,
            cache_dir: cache_dir.into(),
            previous: ConfigSnapshot::empty(),
            applied_once: false,
        }
    }

    /// Block until the store schema exists, up to `timeout`
    ///
    /// Polls at a constant pace through the shared retry helper; the
    /// attempt budget is the timeout divided by the poll step.
    pub async fn wait_for_store(store: &dyn Store, timeout: Duration) -> Result<()> {
        let step = STORE_WAIT_INTERVAL.min(timeout);
        let step_ms = (step.as_millis() as u64).max(1);
        let attempts = ((timeout.as_millis() as u64) / step_ms).max(1) as u32;
        let config = RetryConfig::with_delays(attempts, step_ms, step_ms);

        with_retry(&config, || async move {
            if store.is_initialized().await {
                Ok(())
            } else {
                debug!("store not initialized yet, waiting");
                Err(Error::StoreUnavailable {
                    reason: format!("store not initialized after {timeout:?}"),
                })
            }
        })
        .await
    }

    /// Main loop: consume observations until shutdown
    ///
    /// The first observation carrying instances forces a full publish
    /// regardless of snapshot comparison; until then observations
    /// without instances are waited out.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Observation>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut job_tick = tokio::time::interval(JOB_TICK_INTERVAL);
        job_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // first interval tick fires immediately
        job_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciliation loop stopping");
                        break;
                    }
                }
                _ = job_tick.tick() => {
                    self.run_jobs().await;
                }
                observed = events.recv() => {
                    let Some(mut observation) = observed else {
                        info!("observation channel closed, stopping");
                        break;
                    };
                    if !self.applied_once && observation.instances.is_empty() {
                        info!("no instances observed yet, waiting");
                        continue;
                    }
                    if !self.applied_once {
                        self.probe_health(&mut observation.instances).await;
                    }
                    let force = !self.applied_once;
                    match self.apply(observation, force).await {
                        Ok(report) => {
                            if report.published() {
                                self.applied_once = true;
                            }
                        }
                        Err(e) => warn!(error = %e, "reconciliation pass failed"),
                    }
                }
            }
        }
    }

    /// Refresh health flags with a ping probe
    ///
    /// Reachability is advisory, the publish proceeds either way; the
    /// probe only makes the first pass log an honest healthy count.
    pub async fn probe_health(&self, instances: &mut [Instance]) {
        for instance in instances.iter_mut() {
            instance.healthy = self.fanout.ping(instance).await;
        }
        let up = instances.iter().filter(|i| i.healthy).count();
        info!(total = instances.len(), up, "instance health probed");
    }

    /// One reconciliation pass under the shared lock
    ///
    /// `force` publishes even when the snapshot is unchanged, used for
    /// the initial apply and for `run-once`.
    pub async fn apply(&mut self, observation: Observation, force: bool) -> Result<PassReport> {
        let _guard = self.lock.lock().await;
        let pass_id = Uuid::new_v4();

        self.directory
            .replace_all(observation.instances.clone())
            .await;
        let stats = self.directory.stats().await;
        metrics::set_instances(stats.total, stats.healthy);

        let outcome = merge(
            &self.catalog,
            &observation.instances,
            &observation.services,
            &self.previous,
        );
        for reject in &outcome.report.rejected {
            warn!(
                pass = %pass_id,
                origin = %reject.origin,
                key = %reject.key,
                reason = %reject.reason,
                "setting rejected"
            );
        }
        metrics::record_reconcile(outcome.changed);
        info!(
            pass = %pass_id,
            instances = stats.total,
            healthy = stats.healthy,
            services = observation.services.len(),
            changed = outcome.changed,
            "observation merged"
        );

        self.persist(&outcome.snapshot, &observation).await;

        if !outcome.changed && !force {
            return Ok(PassReport {
                pass_id,
                changed: false,
                config: None,
                reload: None,
            });
        }

        let targets = observation.instances;
        let payload = json!({ "env": outcome.snapshot.entries });
        let config_report = self
            .fanout
            .send(&targets, Method::POST, "/config", Some(&payload))
            .await;

        // Reload only where the configuration actually landed.
        let reload_targets: Vec<Instance> = targets
            .iter()
            .filter(|i| config_report.succeeded(&i.endpoint()))
            .cloned()
            .collect();

        let reload_report = if reload_targets.is_empty() {
            warn!(pass = %pass_id, "no instance accepted the configuration, skipping reload");
            None
        } else {
            if !observation.custom_configs.is_empty() {
                let blobs = json!(observation.custom_configs);
                let report = self
                    .fanout
                    .send(&reload_targets, Method::POST, "/custom_configs", Some(&blobs))
                    .await;
                if !report.all_succeeded() {
                    warn!(pass = %pass_id, failed = ?report.failed, "custom config push incomplete");
                }
            }
            Some(
                self.fanout
                    .send(&reload_targets, Method::POST, "/reload", None)
                    .await,
            )
        };

        let published = config_report.attempted() > config_report.failed.len();
        if published {
            self.previous = outcome.snapshot;
        } else {
            warn!(pass = %pass_id, "configuration not published, keeping previous snapshot for retry");
        }

        if let Some(report) = &reload_report {
            if !report.failed.is_empty() {
                warn!(pass = %pass_id, failed = ?report.failed, "reload incomplete");
            }
        }

        Ok(PassReport {
            pass_id,
            changed: outcome.changed,
            config: Some(config_report),
            reload: reload_report,
        })
    }

    /// Best-effort persistence; a pass never fails on store errors
    async fn persist(&self, snapshot: &ConfigSnapshot, observation: &Observation) {
        if !self.store.is_initialized().await {
            warn!("store not initialized, skipping persistence for this pass");
            return;
        }
        if let Err(e) = self.store.save_config(snapshot, "autoconf").await {
            warn!(error = %e, "cannot persist configuration snapshot");
        }
        if let Err(e) = self
            .store
            .save_custom_configs(&observation.custom_configs, "autoconf")
            .await
        {
            warn!(error = %e, "cannot persist custom configs");
        }
        if let Err(e) = self.store.update_instances(&observation.instances).await {
            warn!(error = %e, "cannot persist instance list");
        }
    }

    /// Tick the job scheduler and push refreshed artifacts to the fleet
    pub async fn run_jobs(&self) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        let report = scheduler.tick().await;
        if !report.any_changed() {
            return;
        }
        let instances = self.directory.all().await;
        if instances.is_empty() {
            return;
        }
        let _guard = self.lock.lock().await;
        info!("job artifacts changed, pushing cache to fleet");
        let push = self
            .fanout
            .send_files(&instances, &self.cache_dir, "/cache")
            .await;
        let reload_targets: Vec<Instance> = instances
            .iter()
            .filter(|i| push.succeeded(&i.endpoint()))
            .cloned()
            .collect();
        if reload_targets.is_empty() {
            warn!("no instance accepted the cache push");
            return;
        }
        let reload = self
            .fanout
            .send(&reload_targets, Method::POST, "/reload", None)
            .await;
        if !reload.failed.is_empty() {
            warn!(failed = ?reload.failed, "reload after cache push incomplete");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
