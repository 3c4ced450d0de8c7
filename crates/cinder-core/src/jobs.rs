use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::addressing::EntityPath;
use crate::config::JobsConfig;
use crate::engine::{EngineAdapter, Route};
use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Cook,
    Render,
    Inference,
}

impl JobKind {
    /// Cook and render jobs may not overlap on the same target.
    pub fn exclusive(self) -> bool {
        matches!(self, JobKind::Cook | JobKind::Render)
    }

    fn start_route(self) -> Route {
        match self {
            JobKind::Cook => Route::StartCook,
            JobKind::Render => Route::StartRender,
            JobKind::Inference => Route::StartInference,
        }
    }

    fn status_route(self) -> Route {
        match self {
            JobKind::Cook => Route::CookJobStatus,
            JobKind::Render => Route::RenderJobStatus,
            JobKind::Inference => Route::InferenceJobStatus,
        }
    }

    fn cancel_route(self) -> Route {
        match self {
            JobKind::Cook => Route::CancelCook,
            JobKind::Render => Route::CancelRender,
            JobKind::Inference => Route::CancelInference,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Cook => write!(f, "cook"),
            JobKind::Render => write!(f, "render"),
            JobKind::Inference => write!(f, "inference"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

/// Snapshot of a tracked job as agents see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub target: EntityPath,
    pub state: JobState,
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub cancellation_requested: bool,
}

/// What one engine status poll said about a job.
#[derive(Debug, Clone, PartialEq)]
enum Observed {
    Pending,
    Running,
    Succeeded(Value),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
struct Observation {
    state: Observed,
    progress: f64,
}

impl Observation {
    /// Interpret a cook status payload (`cook_state` plus work item counts).
    fn from_cook(value: &Value) -> Self {
        let counts = &value["work_item_counts"];
        let count = |key: &str| counts.get(key).and_then(Value::as_u64).unwrap_or(0);
        let total = count("total");
        let failed = count("failed");
        let finished = count("success") + failed;
        let progress = if total == 0 {
            0.0
        } else {
            finished as f64 / total as f64
        };
        let error = || {
            value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{failed} work item(s) failed"))
        };
        let state = match value.get("cook_state").and_then(Value::as_str).unwrap_or("") {
            "cooked" | "success" if failed > 0 => Observed::Failed(error()),
            "cooked" | "success" => Observed::Succeeded(counts.clone()),
            "failed" | "error" => Observed::Failed(error()),
            "cancelled" => Observed::Cancelled,
            "cooking" => Observed::Running,
            _ => Observed::Pending,
        };
        Self { state, progress }
    }

    /// Interpret a render or inference status payload.
    fn from_generic(value: &Value) -> Self {
        let progress = value.get("progress").and_then(Value::as_f64).unwrap_or(0.0);
        let state = match value.get("state").and_then(Value::as_str).unwrap_or("") {
            "running" => Observed::Running,
            "succeeded" | "success" | "done" => {
                Observed::Succeeded(value.get("result").cloned().unwrap_or(Value::Null))
            }
            "failed" | "error" => Observed::Failed(
                value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("job failed")
                    .to_string(),
            ),
            "cancelled" => Observed::Cancelled,
            _ => Observed::Pending,
        };
        Self { state, progress }
    }
}

struct JobRecord {
    job: Job,
    handle: Option<String>,
    terminal_since: Option<Instant>,
    cancel_requested_at: Option<Instant>,
    cancel_sent: bool,
}

impl JobRecord {
    /// Fold one observation into the job. Terminal jobs never change,
    /// progress never goes backwards.
    fn apply(&mut self, observation: Observation) {
        if self.job.state.is_terminal() {
            return;
        }
        let progress = observation.progress.clamp(0.0, 1.0);
        if progress > self.job.progress {
            self.job.progress = progress;
        }
        match observation.state {
            Observed::Pending => {}
            Observed::Running => self.job.state = JobState::Running,
            Observed::Succeeded(_) if self.job.cancellation_requested => {
                self.finish(JobState::Cancelled);
            }
            Observed::Succeeded(result) => {
                self.job.progress = 1.0;
                self.job.result = Some(result);
                self.finish(JobState::Succeeded);
            }
            Observed::Failed(error) => {
                self.job.error = Some(error);
                self.finish(JobState::Failed);
            }
            Observed::Cancelled => self.finish(JobState::Cancelled),
        }
    }

    fn finish(&mut self, state: JobState) {
        self.job.state = state;
        self.job.finished_at = Some(Utc::now());
        self.terminal_since = Some(Instant::now());
    }
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<String, JobRecord>,
}

impl RegistryState {
    fn sweep(&mut self, config: &JobsConfig) {
        let retention = config.retention();
        self.jobs.retain(|_, r| {
            r.terminal_since
                .is_none_or(|since| since.elapsed() < retention)
        });
        let mut terminal: Vec<(Instant, String)> = self
            .jobs
            .iter()
            .filter_map(|(id, r)| r.terminal_since.map(|t| (t, id.clone())))
            .collect();
        if terminal.len() > config.max_retained_terminal {
            terminal.sort();
            let excess = terminal.len() - config.max_retained_terminal;
            for (_, id) in terminal.into_iter().take(excess) {
                self.jobs.remove(&id);
            }
        }
    }

    /// Make room for a new job, or say which live jobs are in the way.
    fn admit(
        &mut self,
        kind: JobKind,
        target: &EntityPath,
        max_jobs: usize,
    ) -> Result<(), (BridgeError, Vec<String>)> {
        if kind.exclusive()
            && let Some(existing) = self.jobs.values().find(|r| {
                r.job.kind == kind && &r.job.target == target && !r.job.state.is_terminal()
            })
        {
            return Err((
                BridgeError::Conflict(format!(
                    "{kind} job {} is still {:?} on {target}",
                    existing.job.id, existing.job.state
                )),
                vec![existing.job.id.clone()],
            ));
        }
        if self.jobs.len() >= max_jobs && !self.evict_oldest_terminal() {
            let live = self.jobs.keys().cloned().collect();
            return Err((
                BridgeError::Conflict(format!(
                    "job registry is full ({} active jobs)",
                    self.jobs.len()
                )),
                live,
            ));
        }
        Ok(())
    }

    fn evict_oldest_terminal(&mut self) -> bool {
        let oldest = self
            .jobs
            .iter()
            .filter_map(|(id, r)| r.terminal_since.map(|t| (t, id.clone())))
            .min();
        match oldest {
            Some((_, id)) => {
                tracing::debug!(job_id = %id, "Evicting terminal job for capacity");
                self.jobs.remove(&id);
                true
            }
            None => false,
        }
    }
}

/// In-memory registry of long-running engine operations.
///
/// Jobs are started synchronously and observed by polling; state is refreshed
/// lazily from the engine on each `status` call. Nothing here survives a
/// restart.
pub struct JobRegistry {
    adapter: Arc<EngineAdapter>,
    config: JobsConfig,
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    pub fn new(adapter: Arc<EngineAdapter>, config: JobsConfig) -> Self {
        Self {
            adapter,
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Start a job and return immediately with its id.
    ///
    /// The slot is reserved before the engine is asked, so two concurrent
    /// starts on one target cannot both get through.
    pub async fn start(
        &self,
        kind: JobKind,
        target: EntityPath,
        params: Map<String, Value>,
    ) -> Result<Job, BridgeError> {
        let id = format!("job_{}", uuid::Uuid::new_v4().simple());
        let job = Job {
            id: id.clone(),
            kind,
            target: target.clone(),
            state: JobState::Pending,
            progress: 0.0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            result: None,
            cancellation_requested: false,
        };

        // A blocking job may have finished in the engine without anyone
        // polling it, so refresh the blockers once before giving up.
        let mut refreshed = false;
        loop {
            let blockers = {
                let mut state = self.state.lock().await;
                state.sweep(&self.config);
                match state.admit(kind, &target, self.config.max_jobs) {
                    Ok(()) => {
                        state.jobs.insert(
                            id.clone(),
                            JobRecord {
                                job: job.clone(),
                                handle: None,
                                terminal_since: None,
                                cancel_requested_at: None,
                                cancel_sent: false,
                            },
                        );
                        break;
                    }
                    Err((err, _)) if refreshed => return Err(err),
                    Err((_, blockers)) => blockers,
                }
            };
            for blocker in &blockers {
                if let Err(e) = self.status(blocker).await {
                    tracing::debug!(job_id = %blocker, error = %e, "Blocking job refresh failed");
                }
            }
            refreshed = true;
        }

        let mut payload = params;
        payload.insert("target".into(), Value::String(target.as_str().to_string()));
        let started = self.adapter.call(kind.start_route(), payload, &["target"]).await;

        let mut state = self.state.lock().await;
        let handle = match started {
            Ok(value) => value
                .get("handle")
                .and_then(|h| match h {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .ok_or_else(|| BridgeError::EngineError("engine returned no job handle".into())),
            Err(err) => Err(err),
        };
        match handle {
            Ok(handle) => {
                tracing::info!(job_id = %id, kind = %kind, target = %target, "Job started");
                match state.jobs.get_mut(&id) {
                    Some(record) => {
                        record.handle = Some(handle);
                        Ok(record.job.clone())
                    }
                    None => Ok(job),
                }
            }
            Err(err) => {
                state.jobs.remove(&id);
                tracing::warn!(kind = %kind, target = %target, error = %err, "Job failed to start");
                Err(err)
            }
        }
    }

    /// Point-in-time snapshot, refreshed from the engine when non-terminal.
    pub async fn status(&self, id: &str) -> Result<Job, BridgeError> {
        let (kind, handle, send_cancel) = {
            let mut state = self.state.lock().await;
            state.sweep(&self.config);
            let record = state
                .jobs
                .get(id)
                .ok_or_else(|| BridgeError::NotFound(format!("job {id}")))?;
            if record.job.state.is_terminal() {
                return Ok(record.job.clone());
            }
            let Some(handle) = record.handle.clone() else {
                return Ok(record.job.clone());
            };
            let send_cancel = record.job.cancellation_requested && !record.cancel_sent;
            (record.job.kind, handle, send_cancel)
        };

        let cancel_sent = send_cancel && self.send_cancel(id, kind, &handle).await;
        let polled = self
            .adapter
            .query(kind.status_route(), json!({ "handle": handle }))
            .await;

        let mut state = self.state.lock().await;
        let record = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| BridgeError::NotFound(format!("job {id}")))?;
        if cancel_sent {
            record.cancel_sent = true;
        }
        match polled {
            Ok(value) => {
                let observation = match kind {
                    JobKind::Cook => Observation::from_cook(&value),
                    JobKind::Render | JobKind::Inference => Observation::from_generic(&value),
                };
                record.apply(observation);
            }
            Err(BridgeError::NotFound(msg)) => record.apply(Observation {
                state: Observed::Failed(format!("engine no longer tracks this job: {msg}")),
                progress: 0.0,
            }),
            Err(err) => {
                tracing::warn!(job_id = %id, error = %err, "Status poll failed, returning last snapshot");
            }
        }

        if !record.job.state.is_terminal()
            && let Some(requested) = record.cancel_requested_at
            && requested.elapsed() >= self.config.cancel_grace()
        {
            tracing::warn!(job_id = %id, "Cancellation grace period elapsed, forcing cancelled");
            record.finish(JobState::Cancelled);
        }
        if record.job.state.is_terminal() {
            tracing::info!(job_id = %id, state = ?record.job.state, "Job finished");
        }
        Ok(record.job.clone())
    }

    /// Request cooperative cancellation. Returns without waiting for the
    /// engine to stop the job.
    pub async fn cancel(&self, id: &str) -> Result<Job, BridgeError> {
        let (kind, handle, snapshot) = {
            let mut state = self.state.lock().await;
            state.sweep(&self.config);
            let record = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| BridgeError::NotFound(format!("job {id}")))?;
            if record.job.state.is_terminal() {
                return Err(BridgeError::AlreadyTerminal(format!(
                    "job {id} is already {:?}",
                    record.job.state
                )));
            }
            if !record.job.cancellation_requested {
                record.job.cancellation_requested = true;
                record.cancel_requested_at = Some(Instant::now());
            }
            tracing::info!(job_id = %id, "Cancellation requested");
            let handle = if record.cancel_sent {
                None
            } else {
                record.handle.clone()
            };
            (record.job.kind, handle, record.job.clone())
        };

        if let Some(handle) = handle
            && self.send_cancel(id, kind, &handle).await
        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.jobs.get_mut(id) {
                record.cancel_sent = true;
            }
        }
        Ok(snapshot)
    }

    async fn send_cancel(&self, id: &str, kind: JobKind, handle: &str) -> bool {
        let mut payload = Map::new();
        payload.insert("handle".into(), Value::String(handle.to_string()));
        match self.adapter.call(kind.cancel_route(), payload, &[]).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(job_id = %id, error = %err, "Engine cancel failed, will retry on next poll");
                false
            }
        }
    }

    /// Tracked jobs, oldest first.
    pub async fn list(&self, filter: Option<JobState>) -> Vec<Job> {
        let mut state = self.state.lock().await;
        state.sweep(&self.config);
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|r| filter.is_none_or(|f| r.job.state == f))
            .map(|r| r.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.jobs.is_empty()
    }
}
