use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::BridgeError;

/// Sink for bridge counters. Implementations can forward to Prometheus,
/// StatsD, or simply log.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// Atomic counters shared by every in-flight invocation.
pub struct BridgeMetrics {
    pub calls: AtomicU64,
    pub failures: AtomicU64,
    pub engine_busy: AtomicU64,
    pub conflicts: AtomicU64,
    pub batches_run: AtomicU64,
    pub batches_aborted: AtomicU64,
    pub rollbacks_incomplete: AtomicU64,
    pub jobs_started: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for BridgeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            engine_busy: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            batches_run: AtomicU64::new(0),
            batches_aborted: AtomicU64::new(0),
            rollbacks_incomplete: AtomicU64::new(0),
            jobs_started: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    fn bump(&self, counter: &AtomicU64, name: &str) {
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
        }
    }

    /// Count one top-level invocation and its outcome.
    pub fn record_call(&self, elapsed_ms: f64, error: Option<&BridgeError>) {
        self.bump(&self.calls, "cinder.bridge.calls");
        if let Some(backend) = &self.backend {
            backend.record_histogram("cinder.bridge.call_ms", elapsed_ms);
        }
        let Some(error) = error else {
            return;
        };
        self.bump(&self.failures, "cinder.bridge.failures");
        match error {
            BridgeError::EngineBusy(_) => self.bump(&self.engine_busy, "cinder.bridge.engine_busy"),
            BridgeError::Conflict(_) => self.bump(&self.conflicts, "cinder.bridge.conflicts"),
            _ => {}
        }
    }

    pub fn record_batch(&self, error: Option<&BridgeError>) {
        self.bump(&self.batches_run, "cinder.bridge.batches_run");
        if let Some(BridgeError::BatchAborted { rollback, .. }) = error {
            self.bump(&self.batches_aborted, "cinder.bridge.batches_aborted");
            if *rollback != crate::error::RollbackOutcome::Complete {
                self.bump(&self.rollbacks_incomplete, "cinder.bridge.rollbacks_incomplete");
            }
        }
    }

    pub fn record_job_started(&self) {
        self.bump(&self.jobs_started, "cinder.bridge.jobs_started");
    }

    pub fn record_job_cancelled(&self) {
        self.bump(&self.jobs_cancelled, "cinder.bridge.jobs_cancelled");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            engine_busy: self.engine_busy.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            batches_run: self.batches_run.load(Ordering::Relaxed),
            batches_aborted: self.batches_aborted.load(Ordering::Relaxed),
            rollbacks_incomplete: self.rollbacks_incomplete.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of bridge counters.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub engine_busy: u64,
    pub conflicts: u64,
    pub batches_run: u64,
    pub batches_aborted: u64,
    pub rollbacks_incomplete: u64,
    pub jobs_started: u64,
    pub jobs_cancelled: u64,
}

/// Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::debug!(metric = name, value = value, kind = "counter", "metric");
    }

    fn record_histogram(&self, name: &str, value: f64) {
        tracing::debug!(metric = name, value = value, kind = "histogram", "metric");
    }
}
