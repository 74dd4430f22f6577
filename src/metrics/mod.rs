//! Prometheus metrics for the control plane
//!
//! This module tracks reconcile passes, fanout outcomes, job runs and
//! directory size.
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Gauge,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all control-plane metrics
struct ControlPlaneMetrics {
    reconcile_passes: Counter,
    reconcile_changed: Counter,
    fanout_attempts: CounterVec,
    fanout_failures: CounterVec,
    job_runs: CounterVec,
    instances_known: Gauge,
    instances_healthy: Gauge,
}

/// Global storage for control-plane metrics
static METRICS: OnceLock<ControlPlaneMetrics> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Should be called once at application startup. If registration
/// fails, the error is returned and subsequent metric operations
/// become no-ops; the control plane keeps running without metrics.
pub fn init_metrics() -> Result<(), String> {
    let metrics = ControlPlaneMetrics {
        reconcile_passes: register_counter!(
            "fleetward_reconcile_passes_total",
            "Total reconcile passes executed"
        )
        .map_err(|e| e.to_string())?,
        reconcile_changed: register_counter!(
            "fleetward_reconcile_changed_total",
            "Reconcile passes that produced a changed snapshot"
        )
        .map_err(|e| e.to_string())?,
        fanout_attempts: register_counter_vec!(
            "fleetward_fanout_attempts_total",
            "Per-instance control calls attempted",
            &["path"]
        )
        .map_err(|e| e.to_string())?,
        fanout_failures: register_counter_vec!(
            "fleetward_fanout_failures_total",
            "Per-instance control calls that failed",
            &["path"]
        )
        .map_err(|e| e.to_string())?,
        job_runs: register_counter_vec!(
            "fleetward_job_runs_total",
            "Job runs by outcome",
            &["job", "outcome"]
        )
        .map_err(|e| e.to_string())?,
        instances_known: register_gauge!(
            "fleetward_instances_known",
            "Instances currently in the directory"
        )
        .map_err(|e| e.to_string())?,
        instances_healthy: register_gauge!(
            "fleetward_instances_healthy",
            "Instances currently reporting healthy"
        )
        .map_err(|e| e.to_string())?,
    };

    METRICS
        .set(metrics)
        .map_err(|_| "metrics already initialized".to_string())
}

// ============================================================================
// Recording
// ============================================================================

/// Record a completed reconcile pass
pub fn record_reconcile(changed: bool) {
    if let Some(m) = METRICS.get() {
        m.reconcile_passes.inc();
        if changed {
            m.reconcile_changed.inc();
        }
    }
}

/// Record a completed fanout
pub fn record_fanout(path: &str, attempted: usize, failed: usize) {
    if let Some(m) = METRICS.get() {
        m.fanout_attempts
            .with_label_values(&[path])
            .inc_by(attempted as f64);
        m.fanout_failures
            .with_label_values(&[path])
            .inc_by(failed as f64);
    }
}

/// Record a job run outcome (`succeeded`, `failed`, `skipped`, `unchanged`)
pub fn record_job(job: &str, outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.job_runs.with_label_values(&[job, outcome]).inc();
    }
}

/// Update directory gauges
pub fn set_instances(known: usize, healthy: usize) {
    if let Some(m) = METRICS.get() {
        m.instances_known.set(known as f64);
        m.instances_healthy.set(healthy as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_init_is_noop() {
        // Must not panic when metrics were never registered.
        record_reconcile(true);
        record_fanout("/reload", 3, 1);
        record_job("certs", "succeeded");
        set_instances(2, 1);
    }
}
