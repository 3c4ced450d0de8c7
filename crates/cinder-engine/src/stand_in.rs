//! Serves the engine control API from an arbitrary [`EngineBackend`].
//!
//! Pointing `HttpBackend` at this server backed by the simulated engine gives
//! a full bridge round trip with no real engine running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cinder_core::engine::{EngineBackend, Method, Route};
use cinder_core::error::EngineError;
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;

type Shared = Arc<dyn EngineBackend>;

/// Status and `code` an engine error is reported with.
fn classify(err: &EngineError) -> (StatusCode, &'static str) {
    match err {
        EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        EngineError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_PARAMS"),
        EngineError::Busy(_) => (StatusCode::SERVICE_UNAVAILABLE, "BUSY"),
        EngineError::Failed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR"),
        EngineError::OutcomeUnknown(_) => (StatusCode::GATEWAY_TIMEOUT, "ENGINE_ERROR"),
        EngineError::Unreachable { .. } => (StatusCode::BAD_GATEWAY, "ENGINE_ERROR"),
    }
}

async fn respond(backend: &Shared, route: Route, payload: Value) -> Response {
    match backend.call(route, &payload).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => {
            let (status, code) = classify(&err);
            tracing::debug!(route = %route, %status, error = %err, "Stand-in engine call failed");
            (
                status,
                Json(json!({ "error": true, "code": code, "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

/// Query strings carry JSON text for non-string values.
fn decode_query(query: HashMap<String, String>) -> Value {
    let fields: Map<String, Value> = query
        .into_iter()
        .map(|(k, v)| {
            let value = match serde_json::from_str::<Value>(&v) {
                Ok(parsed @ (Value::Number(_) | Value::Bool(_) | Value::Array(_) | Value::Object(_))) => parsed,
                _ => Value::String(v),
            };
            (k, value)
        })
        .collect();
    Value::Object(fields)
}

fn decode_body(body: &Bytes) -> Result<Value, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": true, "code": "INVALID_PARAMS", "message": format!("malformed JSON body: {e}") })),
        )
            .into_response()
    })
}

/// One axum route per engine endpoint.
pub fn router(backend: Shared) -> Router {
    let mut app: Router<Shared> = Router::new();
    for &route in Route::ALL {
        app = match route.method() {
            Method::Get => app.route(
                route.endpoint(),
                get(
                    move |State(backend): State<Shared>, Query(query): Query<HashMap<String, String>>| async move {
                        respond(&backend, route, decode_query(query)).await
                    },
                ),
            ),
            Method::Post => app.route(
                route.endpoint(),
                post(move |State(backend): State<Shared>, body: Bytes| async move {
                    match decode_body(&body) {
                        Ok(payload) => respond(&backend, route, payload).await,
                        Err(rejection) => rejection,
                    }
                }),
            ),
        };
    }
    app.with_state(backend)
}

/// Serve until Ctrl-C.
pub async fn serve(addr: SocketAddr, backend: Shared) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, backend = backend.name(), "Stand-in engine listening");
    axum::serve(listener, router(backend))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Stand-in engine shutting down");
        })
        .await
}

/// Serve on an ephemeral localhost port in the background.
pub async fn spawn(backend: Shared) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(backend);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Stand-in engine error: {}", e);
        }
    });
    Ok((addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_are_decoded() {
        let mut query = HashMap::new();
        query.insert("path".to_string(), "/obj/geo1".to_string());
        query.insert("depth".to_string(), "3".to_string());
        query.insert("include_attrs".to_string(), "false".to_string());
        query.insert("handle".to_string(), "cook-1".to_string());
        let value = decode_query(query);
        assert_eq!(value["path"], "/obj/geo1");
        assert_eq!(value["depth"], 3);
        assert_eq!(value["include_attrs"], false);
        assert_eq!(value["handle"], "cook-1");
    }

    #[test]
    fn empty_body_is_an_empty_object() {
        assert_eq!(decode_body(&Bytes::from_static(b"  ")).ok(), Some(json!({})));
        assert!(decode_body(&Bytes::from_static(b"{nope")).is_err());
    }

    #[test]
    fn errors_map_to_engine_codes() {
        assert_eq!(classify(&EngineError::NotFound("x".into())).1, "NOT_FOUND");
        assert_eq!(classify(&EngineError::Busy("x".into())).0, StatusCode::SERVICE_UNAVAILABLE);
    }
}
