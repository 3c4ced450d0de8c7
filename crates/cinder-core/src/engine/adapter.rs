use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, MutexGuard};

use crate::addressing::{EntityHandle, EntityPath};
use crate::config::EngineConfig;
use crate::engine::{EngineBackend, Route};
use crate::error::BridgeError;

/// The only component that talks to the engine.
///
/// Every call, reads included, runs while holding `gate`, so the engine sees
/// one caller at a time no matter how many requests are in flight. Waiting
/// for the gate is bounded by `lock_timeout`; running out surfaces as
/// `EngineBusy`.
pub struct EngineAdapter {
    backend: Arc<dyn EngineBackend>,
    gate: Mutex<()>,
    lock_timeout: Duration,
    query_timeout: Duration,
}

impl EngineAdapter {
    pub fn new(backend: Arc<dyn EngineBackend>, lock_timeout: Duration, query_timeout: Duration) -> Self {
        Self {
            backend,
            gate: Mutex::new(()),
            lock_timeout,
            query_timeout,
        }
    }

    pub fn from_config(backend: Arc<dyn EngineBackend>, config: &EngineConfig) -> Self {
        Self::new(backend, config.lock_timeout(), config.query_timeout())
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, ()>, BridgeError> {
        tokio::time::timeout(self.lock_timeout, self.gate.lock())
            .await
            .map_err(|_| {
                tracing::warn!(
                    timeout_ms = self.lock_timeout.as_millis() as u64,
                    "Engine lock not acquired in time"
                );
                BridgeError::EngineBusy(format!(
                    "engine lock not acquired within {} ms",
                    self.lock_timeout.as_millis()
                ))
            })
    }

    /// Look a path up in the engine's current graph.
    pub async fn resolve(&self, path: &EntityPath) -> Result<EntityHandle, BridgeError> {
        let _guard = self.acquire().await?;
        self.resolve_locked(path).await
    }

    async fn resolve_locked(&self, path: &EntityPath) -> Result<EntityHandle, BridgeError> {
        let payload = json!({ "path": path.as_str() });
        let value = self.backend.call(Route::ResolveNode, &payload).await?;
        EntityHandle::from_engine(&value, path)
    }

    /// Run one engine operation.
    ///
    /// Each field named in `node_fields` holds a node path; it is resolved
    /// under the same lock hold as the operation itself and replaced by the
    /// engine's canonical path, so a node removed by an earlier call is caught
    /// here rather than by the engine half-way through.
    pub async fn call(
        &self,
        route: Route,
        payload: Map<String, Value>,
        node_fields: &[&str],
    ) -> Result<Value, BridgeError> {
        self.session().await?.call(route, payload, node_fields).await
    }

    /// Hold the engine for several calls in a row.
    pub async fn session(&self) -> Result<EngineSession<'_>, BridgeError> {
        Ok(EngineSession {
            adapter: self,
            _guard: self.acquire().await?,
        })
    }

    async fn call_locked(
        &self,
        route: Route,
        mut payload: Map<String, Value>,
        node_fields: &[&str],
    ) -> Result<Value, BridgeError> {
        for field in node_fields {
            let Some(raw) = payload.get(*field).and_then(Value::as_str) else {
                continue;
            };
            let path = EntityPath::parse(raw)?;
            let handle = self.resolve_locked(&path).await?;
            payload.insert(
                (*field).to_string(),
                Value::String(handle.path.as_str().to_string()),
            );
        }

        tracing::debug!(route = %route, backend = self.backend.name(), "Engine call");
        let payload = Value::Object(payload);
        self.backend.call(route, &payload).await.map_err(|e| {
            tracing::debug!(route = %route, error = %e, "Engine call failed");
            BridgeError::from(e)
        })
    }

    /// A status read that gives up after `query_timeout`.
    pub async fn query(&self, route: Route, payload: Value) -> Result<Value, BridgeError> {
        let _guard = self.acquire().await?;
        match tokio::time::timeout(self.query_timeout, self.backend.call(route, &payload)).await {
            Ok(result) => result.map_err(BridgeError::from),
            Err(_) if route.is_read() => Err(BridgeError::EngineBusy(format!(
                "{route} did not answer within {} ms",
                self.query_timeout.as_millis()
            ))),
            Err(_) => Err(BridgeError::EngineOutcomeUnknown(format!(
                "{route} got no reply within {} ms",
                self.query_timeout.as_millis()
            ))),
        }
    }
}

/// Exclusive use of the engine until dropped.
///
/// Nothing else reaches the engine between two calls made through the same
/// session, so a read followed by a write sees no interleaved change.
pub struct EngineSession<'a> {
    adapter: &'a EngineAdapter,
    _guard: MutexGuard<'a, ()>,
}

impl EngineSession<'_> {
    pub async fn call(
        &self,
        route: Route,
        payload: Map<String, Value>,
        node_fields: &[&str],
    ) -> Result<Value, BridgeError> {
        self.adapter.call_locked(route, payload, node_fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulatedEngine;

    fn adapter(engine: SimulatedEngine, lock_ms: u64) -> EngineAdapter {
        EngineAdapter::new(
            Arc::new(engine),
            Duration::from_millis(lock_ms),
            Duration::from_millis(1000),
        )
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn resolve_existing_and_missing() {
        let adapter = adapter(SimulatedEngine::new(), 1000);
        let handle = adapter
            .resolve(&EntityPath::parse("/obj/geo1").unwrap())
            .await
            .unwrap();
        assert_eq!(handle.node_type, "geo");

        let err = adapter
            .resolve(&EntityPath::parse("/obj/missing").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn call_resolves_node_fields_first() {
        let adapter = adapter(SimulatedEngine::new(), 1000);
        let err = adapter
            .call(
                Route::CreateNode,
                args(json!({"type": "sphere", "parent": "/obj/nowhere"})),
                &["parent"],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));

        let created = adapter
            .call(
                Route::CreateNode,
                args(json!({"type": "sphere", "parent": "/obj/geo1"})),
                &["parent"],
            )
            .await
            .unwrap();
        assert_eq!(created["path"], "/obj/geo1/sphere1");
    }

    #[tokio::test]
    async fn contended_lock_reports_engine_busy() {
        let engine = SimulatedEngine::new().with_latency(Duration::from_millis(300));
        let adapter = Arc::new(adapter(engine, 20));

        let slow = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.query(Route::Ping, json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = adapter.query(Route::Ping, json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::EngineBusy(_)));
        assert!(err.retryable());
        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn session_keeps_other_callers_out() {
        let adapter = Arc::new(adapter(SimulatedEngine::new(), 30));
        let session = adapter.session().await.unwrap();
        session
            .call(Route::GetNode, args(json!({"path": "/obj/geo1"})), &["path"])
            .await
            .unwrap();

        let err = adapter.query(Route::Ping, json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::EngineBusy(_)));

        session
            .call(
                Route::CreateNode,
                args(json!({"type": "null", "parent": "/obj/geo1"})),
                &["parent"],
            )
            .await
            .unwrap();
        drop(session);
        assert!(adapter.query(Route::Ping, json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn slow_query_is_bounded() {
        let engine = SimulatedEngine::new().with_latency(Duration::from_millis(500));
        let adapter = EngineAdapter::new(
            Arc::new(engine),
            Duration::from_millis(1000),
            Duration::from_millis(50),
        );
        let err = adapter.query(Route::Ping, json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::EngineBusy(_)));

        let err = adapter
            .query(Route::SetFrame, json!({"frame": 10}))
            .await
            .unwrap_err();
        assert!(err.outcome_unknown(), "got {err:?}");
        assert!(!err.retryable());
    }
}
