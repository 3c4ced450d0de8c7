//! Sequential multi-step execution with compensating rollback.
//!
//! The engine has no transactions. A batch runs its steps in order; when one
//! fails, the steps already applied are undone newest-first using the inverse
//! each tool declares, and the failure is reported together with how much of
//! that undo worked.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::addressing::EntityPath;
use crate::contract::{Inverse, ToolContract, ToolTarget};
use crate::dispatch::Dispatcher;
use crate::engine::{EngineSession, Route};
use crate::error::{BridgeError, RollbackOutcome};
use crate::validate::validate;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchStep {
    tool: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

/// What undoing one applied step takes.
#[derive(Debug)]
enum Undo {
    /// Engine calls run in order.
    Engine(Vec<(Route, Map<String, Value>)>),
    CancelJob(String),
    /// The step changed something no inverse exists for.
    Unavailable,
}

/// State read before a mutating step, needed to build its inverse.
#[derive(Debug)]
enum PriorState {
    Nothing,
    Parameter { path: String, name: String, value: Value },
    Flag { path: String, flag: String, value: Value },
    Name(String),
    Input { to: String, input: i64, wire: Option<(String, u64)> },
    Frame(Value),
}

struct Applied {
    step: usize,
    tool: &'static str,
    undo: Undo,
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn str_arg(args: &Map<String, Value>, key: &str) -> Result<String, BridgeError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::InvalidArgument(format!("missing argument `{key}`")))
}

fn int_arg(args: &Map<String, Value>, key: &str) -> i64 {
    args.get(key).and_then(Value::as_i64).unwrap_or(0)
}

/// Runs one batch on behalf of a [`Dispatcher`].
pub struct BatchExecutor<'a> {
    dispatcher: &'a Dispatcher,
    cwd: EntityPath,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(dispatcher: &'a Dispatcher, cwd: EntityPath) -> Self {
        Self { dispatcher, cwd }
    }

    /// Run validated batch arguments (`operations`, optional `cwd`).
    pub async fn run_arguments(
        dispatcher: &'a Dispatcher,
        args: Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        let cwd = match args.get("cwd").and_then(Value::as_str) {
            Some(raw) => EntityPath::parse(raw)?,
            None => dispatcher.default_root().clone(),
        };
        let steps: Vec<BatchStep> =
            serde_json::from_value(args.get("operations").cloned().unwrap_or(Value::Null))
                .map_err(|e| BridgeError::InvalidArgument(format!("malformed batch: {e}")))?;
        Self::new(dispatcher, cwd).run(steps).await
    }

    async fn run(mut self, steps: Vec<BatchStep>) -> Result<Value, BridgeError> {
        let total = steps.len();
        let mut applied: Vec<Applied> = Vec::new();
        let mut results = Vec::with_capacity(total);

        for (i, step) in steps.into_iter().enumerate() {
            let index = i + 1;
            match self.run_step(index, &step).await {
                Ok((contract, result, undo)) => {
                    if let Some(undo) = undo {
                        applied.push(Applied {
                            step: index,
                            tool: contract.name,
                            undo,
                        });
                    }
                    results.push(json!({ "step": index, "tool": contract.name, "result": result }));
                }
                Err(cause) => {
                    tracing::warn!(
                        step = index,
                        total,
                        tool = %step.tool,
                        error = %cause,
                        "Batch step failed, rolling back"
                    );
                    let (rollback, rollback_failures) = self.roll_back(applied, (index, &step.tool, &cause)).await;
                    return Err(BridgeError::BatchAborted {
                        index,
                        cause: Box::new(cause),
                        rollback,
                        rollback_failures,
                    });
                }
            }
        }

        tracing::info!(steps = total, "Batch completed");
        Ok(json!({ "count": results.len(), "results": results }))
    }

    async fn run_step(
        &mut self,
        index: usize,
        step: &BatchStep,
    ) -> Result<(&'static ToolContract, Value, Option<Undo>), BridgeError> {
        let contract = self
            .dispatcher
            .catalogue()
            .get(&step.tool)
            .ok_or_else(|| BridgeError::UnknownTool(step.tool.clone()))?;
        if contract.target == ToolTarget::Batch {
            return Err(BridgeError::InvalidArgument("batches cannot be nested".into()));
        }
        let empty = Map::new();
        let args = validate(contract, step.arguments.as_ref().unwrap_or(&empty), &self.cwd)?;
        tracing::debug!(step = index, tool = contract.name, "Batch step");

        let (prior, result) = match contract.target {
            ToolTarget::Engine(route) if contract.mutating => {
                // Capture and write under one hold so nothing lands in between.
                let session = self.dispatcher.adapter().session().await?;
                let prior = capture(&session, contract.inverse, &args).await?;
                let result = session
                    .call(route, args.clone(), &contract.node_fields())
                    .await?;
                (prior, result)
            }
            _ => (
                PriorState::Nothing,
                self.dispatcher.execute(contract, args.clone()).await?,
            ),
        };

        let undo = contract
            .mutating
            .then(|| inverse_of(contract.inverse, &args, &result, prior));

        if contract.inverse == Inverse::DeleteCreated
            && let Some(created) = result.get("path").and_then(Value::as_str)
            && let Ok(created) = EntityPath::parse(created)
            && let Some(parent) = created.parent()
        {
            self.cwd = parent;
        }
        Ok((contract, result, undo))
    }

    /// Undo `applied` newest-first and classify how well that went.
    ///
    /// A failed step whose write may still have landed cannot be undone, so
    /// it alone keeps the rollback from being complete.
    async fn roll_back(
        &self,
        applied: Vec<Applied>,
        (index, tool, cause): (usize, &str, &BridgeError),
    ) -> (RollbackOutcome, Vec<String>) {
        let mut failures = Vec::new();
        if cause.outcome_unknown() {
            failures.push(format!("step {index} ({tool}): outcome unknown, not undone"));
        }
        if applied.is_empty() && failures.is_empty() {
            return (RollbackOutcome::Complete, Vec::new());
        }
        let attempted = applied
            .iter()
            .filter(|a| !matches!(a.undo, Undo::Unavailable))
            .count();

        for entry in applied.into_iter().rev() {
            let outcome = match entry.undo {
                Undo::Unavailable => Err("no inverse for this tool".to_string()),
                Undo::CancelJob(id) => match self.dispatcher.jobs().cancel(&id).await {
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.to_string()),
                },
                Undo::Engine(calls) => {
                    let mut result = Ok(());
                    for (route, payload) in calls {
                        if let Err(e) = self.dispatcher.adapter().call(route, payload, &[]).await {
                            result = Err(format!("{route}: {e}"));
                            break;
                        }
                    }
                    result
                }
            };
            if let Err(detail) = outcome {
                tracing::warn!(step = entry.step, tool = entry.tool, %detail, "Rollback step failed");
                failures.push(format!("step {} ({}): {detail}", entry.step, entry.tool));
            }
        }

        let outcome = if failures.is_empty() {
            RollbackOutcome::Complete
        } else if attempted == 0 {
            RollbackOutcome::NotAttempted
        } else {
            RollbackOutcome::Partial
        };
        tracing::info!(rollback = %outcome, failures = failures.len(), "Batch rolled back");
        (outcome, failures)
    }
}

async fn read(session: &EngineSession<'_>, route: Route, payload: Value) -> Result<Value, BridgeError> {
    session.call(route, object(payload), &[]).await
}

/// Read what the step is about to overwrite.
async fn capture(
    session: &EngineSession<'_>,
    inverse: Inverse,
    args: &Map<String, Value>,
) -> Result<PriorState, BridgeError> {
    match inverse {
        Inverse::RestoreParameter => {
            let path = str_arg(args, "path")?;
            let name = str_arg(args, "name")?;
            let current = read(
                session,
                Route::GetParameter,
                json!({ "path": path, "name": name }),
            )
            .await?;
            Ok(PriorState::Parameter {
                path,
                name,
                value: current.get("value").cloned().unwrap_or(Value::Null),
            })
        }
        Inverse::RestoreFlag => {
            let path = str_arg(args, "path")?;
            let flag = str_arg(args, "flag")?;
            let node = read(session, Route::GetNode, json!({ "path": path })).await?;
            Ok(PriorState::Flag {
                value: node["flags"].get(&flag).cloned().unwrap_or(Value::Bool(false)),
                path,
                flag,
            })
        }
        Inverse::RenameBack => {
            let path = EntityPath::parse(&str_arg(args, "path")?)?;
            Ok(PriorState::Name(path.name().to_string()))
        }
        Inverse::RestoreInput => {
            let to = match args.get("to") {
                Some(_) => str_arg(args, "to")?,
                None => str_arg(args, "path")?,
            };
            let input = int_arg(args, "input");
            let node = read(session, Route::GetNode, json!({ "path": to })).await?;
            let wire = node["inputs"]
                .as_array()
                .into_iter()
                .flatten()
                .find(|w| w.get("index").and_then(Value::as_i64) == Some(input))
                .and_then(|w| {
                    let from = w.get("from")?.as_str()?.to_string();
                    Some((from, w.get("output").and_then(Value::as_u64).unwrap_or(0)))
                });
            Ok(PriorState::Input { to, input, wire })
        }
        Inverse::RestoreFrame => {
            let scene = read(session, Route::SceneInfo, json!({})).await?;
            Ok(PriorState::Frame(scene.get("frame").cloned().unwrap_or(json!(1.0))))
        }
        Inverse::None
        | Inverse::DeleteCreated
        | Inverse::CancelStartedJob
        | Inverse::NotAttempted => Ok(PriorState::Nothing),
    }
}

/// Build the compensation for a step that just succeeded.
fn inverse_of(inverse: Inverse, args: &Map<String, Value>, result: &Value, prior: PriorState) -> Undo {
    let result_str = |key: &str| result.get(key).and_then(Value::as_str).map(str::to_string);
    match (inverse, prior) {
        (Inverse::DeleteCreated, _) => match result_str("path") {
            Some(path) => Undo::Engine(vec![(Route::DeleteNode, object(json!({ "path": path })))]),
            None => Undo::Unavailable,
        },
        (Inverse::RestoreParameter, PriorState::Parameter { path, name, value }) => Undo::Engine(vec![(
            Route::SetParameter,
            object(json!({ "path": path, "name": name, "value": value })),
        )]),
        (Inverse::RestoreFlag, PriorState::Flag { path, flag, value }) => Undo::Engine(vec![(
            Route::SetFlag,
            object(json!({ "path": path, "flag": flag, "value": value })),
        )]),
        (Inverse::RenameBack, PriorState::Name(old_name)) => {
            match result_str("path") {
                Some(path) => Undo::Engine(vec![(
                    Route::RenameNode,
                    object(json!({ "path": path, "name": old_name })),
                )]),
                None => Undo::Unavailable,
            }
        }
        (Inverse::RestoreInput, PriorState::Input { to, input, wire }) => match wire {
            Some((from, output)) => Undo::Engine(vec![(
                Route::Connect,
                object(json!({ "from": from, "to": to, "input": input, "output": output })),
            )]),
            None if args.contains_key("from") => Undo::Engine(vec![(
                Route::Disconnect,
                object(json!({ "path": to, "input": input })),
            )]),
            // Clearing an input that was already empty changed nothing.
            None => Undo::Engine(Vec::new()),
        },
        (Inverse::RestoreFrame, PriorState::Frame(frame)) => {
            Undo::Engine(vec![(Route::SetFrame, object(json!({ "frame": frame })))])
        }
        (Inverse::CancelStartedJob, _) => match result_str("job_id") {
            Some(id) => Undo::CancelJob(id),
            None => Undo::Unavailable,
        },
        _ => Undo::Unavailable,
    }
}
