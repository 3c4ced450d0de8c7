//! Bridge over real HTTP: `HttpBackend` against the stand-in server backed by
//! the simulated engine.

use std::sync::Arc;
use std::time::Duration;

use cinder_core::engine::{EngineBackend, Route, SimulatedEngine};
use cinder_core::error::EngineError;
use cinder_core::{BridgeError, CinderConfig, Dispatcher, Invocation};
use cinder_engine::HttpBackend;
use cinder_engine::stand_in;
use serde_json::{Value, json};

async fn start() -> (Arc<SimulatedEngine>, HttpBackend) {
    let engine = Arc::new(SimulatedEngine::new());
    let (addr, _handle) = stand_in::spawn(engine.clone()).await.unwrap();
    let backend = HttpBackend::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
    (engine, backend)
}

#[tokio::test]
async fn get_and_post_routes_round_trip() {
    let (engine, backend) = start().await;

    let ping = backend.call(Route::Ping, &json!({})).await.unwrap();
    assert_eq!(ping["status"], "ok");

    let created = backend
        .call(Route::CreateNode, &json!({"type": "scatter", "parent": "/obj/geo1"}))
        .await
        .unwrap();
    assert_eq!(created["path"], "/obj/geo1/scatter1");
    assert!(engine.scene().await.nodes.contains_key("/obj/geo1/scatter1"));

    let parm = backend
        .call(Route::GetParameter, &json!({"path": "/obj/geo1/scatter1", "name": "npts"}))
        .await
        .unwrap();
    assert_eq!(parm["value"], 1000);

    let tree = backend
        .call(Route::NodeTree, &json!({"root": "/obj", "depth": 1}))
        .await
        .unwrap();
    assert!(tree["children"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn engine_failures_keep_their_kind() {
    let (_, backend) = start().await;

    let err = backend
        .call(Route::GetNode, &json!({"path": "/obj/nothing"}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = backend
        .call(Route::CreateNode, &json!({"type": "teapot", "parent": "/obj/geo1"}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test]
async fn injected_busy_maps_to_engine_busy() {
    let (engine, backend) = start().await;
    engine
        .fail_next(Route::SceneInfo, EngineError::Busy("cooking".into()))
        .await;
    let err = backend.call(Route::SceneInfo, &json!({})).await.unwrap_err();
    assert_eq!(err, EngineError::Busy("cooking".into()));
}

#[tokio::test]
async fn unreachable_engine_names_the_url() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = HttpBackend::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
    let err = backend.call(Route::Ping, &json!({})).await.unwrap_err();
    match &err {
        EngineError::Unreachable { url, .. } => assert_eq!(url, &format!("http://{addr}")),
        other => panic!("expected Unreachable, got {other:?}"),
    }
    assert!(err.to_string().contains("is the engine bridge running"));
}

async fn call(dispatcher: &Dispatcher, tool: &str, args: Value) -> Result<Value, BridgeError> {
    let inv = Invocation::from_value(tool, args).unwrap();
    dispatcher.dispatch(&inv).await.into_result()
}

#[tokio::test]
async fn dispatcher_runs_batches_and_jobs_over_http() {
    let (engine, backend) = start().await;
    let dispatcher = Dispatcher::new(&CinderConfig::default(), Arc::new(backend)).unwrap();

    let result = call(
        &dispatcher,
        "batch",
        json!({"operations": [
            {"tool": "create-node", "arguments": {"type": "sphere", "parent": "/obj/geo1"}},
            {"tool": "create-node", "arguments": {"type": "scatter", "parent": "/obj/geo1"}},
            {"tool": "connect", "arguments": {"from": "sphere1", "to": "scatter1"}},
        ]}),
    )
    .await
    .unwrap();
    assert_eq!(result["count"], 3);
    let scene = engine.scene().await;
    assert_eq!(scene.nodes["/obj/geo1/scatter1"].inputs[&0].from, "/obj/geo1/sphere1");

    let before = engine.scene().await;
    let err = call(
        &dispatcher,
        "batch",
        json!({"operations": [
            {"tool": "set-parameter", "arguments": {"path": "/obj/geo1/scatter1", "name": "npts", "value": 5}},
            {"tool": "delete-node", "arguments": {"path": "/obj/geo1/ghost"}},
        ]}),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BridgeError::BatchAborted { index: 2, .. }));
    assert_eq!(engine.scene().await, before);

    let started = call(&dispatcher, "start-cook", json!({"target": "/obj/topnet1"})).await.unwrap();
    let id = started["job_id"].clone();
    let mut state = String::new();
    for _ in 0..20 {
        let status = call(&dispatcher, "job-status", json!({"job_id": id})).await.unwrap();
        state = status["state"].as_str().unwrap().to_string();
        if state == "succeeded" || state == "failed" || state == "cancelled" {
            break;
        }
    }
    assert_eq!(state, "succeeded");
}

/// Applies each write, then stalls before answering `create-node`.
struct ApplyThenStall {
    inner: Arc<SimulatedEngine>,
}

impl EngineBackend for ApplyThenStall {
    fn name(&self) -> &str {
        "apply-then-stall"
    }

    fn call<'a>(
        &'a self,
        route: Route,
        payload: &'a Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, EngineError>> + Send + 'a>>
    {
        Box::pin(async move {
            let result = self.inner.call(route, payload).await;
            if route == Route::CreateNode {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            result
        })
    }
}

#[tokio::test]
async fn timed_out_write_is_not_reported_as_busy() {
    let engine = Arc::new(SimulatedEngine::new());
    let (addr, _handle) = stand_in::spawn(Arc::new(ApplyThenStall { inner: engine.clone() }))
        .await
        .unwrap();
    let backend = HttpBackend::new(&format!("http://{addr}"), Duration::from_millis(100)).unwrap();

    let err = backend
        .call(Route::CreateNode, &json!({"type": "null", "parent": "/obj/geo1"}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OutcomeUnknown(_)), "got {err:?}");
    // The engine did apply it.
    assert!(engine.scene().await.nodes.contains_key("/obj/geo1/null1"));

    let dispatcher = Dispatcher::new(&CinderConfig::default(), Arc::new(backend)).unwrap();
    let err = call(
        &dispatcher,
        "create-node",
        json!({"type": "box", "parent": "/obj/geo1"}),
    )
    .await
    .unwrap_err();
    assert!(err.outcome_unknown());
    let json = err.to_json();
    assert_eq!(json["kind"], "engine_error");
    assert_eq!(json["retryable"], false);

    let err = call(
        &dispatcher,
        "batch",
        json!({"operations": [
            {"tool": "set-parameter", "arguments": {"path": "/obj/geo1", "name": "scale", "value": 3.0}},
            {"tool": "create-node", "arguments": {"type": "sphere", "parent": "/obj/geo1"}},
        ]}),
    )
    .await
    .unwrap_err();
    match err {
        BridgeError::BatchAborted { index, rollback, rollback_failures, .. } => {
            assert_eq!(index, 2);
            assert_eq!(rollback, cinder_core::error::RollbackOutcome::Partial);
            assert!(rollback_failures.iter().any(|f| f.contains("outcome unknown")));
        }
        other => panic!("expected BatchAborted, got {other:?}"),
    }
}
