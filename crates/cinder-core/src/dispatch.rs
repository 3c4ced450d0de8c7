use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value, json};

use crate::addressing::EntityPath;
use crate::batch::BatchExecutor;
use crate::catalogue::Catalogue;
use crate::config::CinderConfig;
use crate::contract::{ToolContract, ToolTarget};
use crate::engine::{EngineAdapter, EngineBackend};
use crate::error::BridgeError;
use crate::invocation::{Invocation, Outcome};
use crate::jobs::{JobRegistry, JobState};
use crate::metrics::BridgeMetrics;

/// Entry point for every tool call: look up, validate, route, shape.
pub struct Dispatcher {
    catalogue: Catalogue,
    adapter: Arc<EngineAdapter>,
    jobs: JobRegistry,
    metrics: Arc<BridgeMetrics>,
    default_root: EntityPath,
}

impl Dispatcher {
    pub fn new(config: &CinderConfig, backend: Arc<dyn EngineBackend>) -> Result<Self, BridgeError> {
        let default_root = EntityPath::parse(&config.addressing.default_root)?;
        let adapter = Arc::new(EngineAdapter::from_config(backend, &config.engine));
        Ok(Self {
            catalogue: Catalogue::builtin(),
            jobs: JobRegistry::new(Arc::clone(&adapter), config.jobs.clone()),
            adapter,
            metrics: Arc::new(BridgeMetrics::new()),
            default_root,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    pub fn adapter(&self) -> &EngineAdapter {
        &self.adapter
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    pub fn default_root(&self) -> &EntityPath {
        &self.default_root
    }

    /// Run one invocation. Never panics and never returns both a result and
    /// an error.
    pub async fn dispatch(&self, invocation: &Invocation) -> Outcome {
        let started = Instant::now();
        tracing::debug!(tool = %invocation.tool, trace_id = %invocation.trace_id, "Tool call");

        let result = self.try_dispatch(invocation).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_call(elapsed_ms, result.as_ref().err());

        match &result {
            Ok(_) => tracing::info!(
                tool = %invocation.tool,
                trace_id = %invocation.trace_id,
                elapsed_ms,
                "Tool call succeeded"
            ),
            Err(err) => tracing::warn!(
                tool = %invocation.tool,
                trace_id = %invocation.trace_id,
                kind = err.kind(),
                error = %err,
                "Tool call failed"
            ),
        }
        Outcome::from(result)
    }

    async fn try_dispatch(&self, invocation: &Invocation) -> Result<Value, BridgeError> {
        let contract = self
            .catalogue
            .get(&invocation.tool)
            .ok_or_else(|| BridgeError::UnknownTool(invocation.tool.clone()))?;
        let args = crate::validate::validate(contract, &invocation.arguments, &self.default_root)?;

        if contract.target == ToolTarget::Batch {
            let result = BatchExecutor::run_arguments(self, args).await;
            self.metrics.record_batch(result.as_ref().err());
            return result;
        }
        self.execute(contract, args).await
    }

    /// Route validated arguments to their handler. Batches are not accepted
    /// here, which keeps batch steps from recursing.
    pub(crate) async fn execute(
        &self,
        contract: &ToolContract,
        mut args: Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        match contract.target {
            ToolTarget::Engine(route) => {
                self.adapter
                    .call(route, args, &contract.node_fields())
                    .await
            }
            ToolTarget::StartJob(kind) => {
                let target = match args.remove("target") {
                    Some(Value::String(raw)) => EntityPath::parse(&raw)?,
                    _ => {
                        return Err(BridgeError::InvalidArgument(
                            "missing argument `target`".into(),
                        ));
                    }
                };
                let job = self.jobs.start(kind, target, args).await?;
                self.metrics.record_job_started();
                Ok(json!({
                    "job_id": job.id,
                    "kind": job.kind,
                    "target": job.target,
                    "state": job.state,
                }))
            }
            ToolTarget::JobStatus => {
                let job = self.jobs.status(&job_id(&args)?).await?;
                to_json(&job)
            }
            ToolTarget::CancelJob => {
                let job = self.jobs.cancel(&job_id(&args)?).await?;
                self.metrics.record_job_cancelled();
                Ok(json!({
                    "id": job.id,
                    "state": job.state,
                    "cancellation_requested": job.cancellation_requested,
                }))
            }
            ToolTarget::ListJobs => {
                let filter = match args.get("state").and_then(Value::as_str) {
                    Some(raw) => Some(JobState::parse(raw).ok_or_else(|| {
                        BridgeError::InvalidArgument(format!("unknown job state `{raw}`"))
                    })?),
                    None => None,
                };
                let jobs = self.jobs.list(filter).await;
                Ok(json!({ "count": jobs.len(), "jobs": jobs }))
            }
            ToolTarget::Stats => to_json(&self.metrics.snapshot()),
            ToolTarget::Batch => Err(BridgeError::InvalidArgument(
                "batches cannot be nested".into(),
            )),
        }
    }
}

fn job_id(args: &Map<String, Value>) -> Result<String, BridgeError> {
    args.get("job_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::InvalidArgument("missing argument `job_id`".into()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|e| BridgeError::EngineError(e.to_string()))
}
