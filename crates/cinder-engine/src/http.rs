use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use cinder_core::config::EngineConfig;
use cinder_core::engine::{EngineBackend, Method, Route};
use cinder_core::error::EngineError;
use reqwest::StatusCode;
use serde_json::{Value, json};

/// [`EngineBackend`] over the engine's HTTP control API.
///
/// Reads are `GET` with query parameters, writes `POST` a JSON body. Failures
/// come back as `{"error": true, "code": ..., "message": ...}`.
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Failed(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::new(&config.base_url, config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn transport_error(&self, route: Route, err: reqwest::Error) -> EngineError {
        if err.is_connect() {
            EngineError::Unreachable {
                url: self.base_url.clone(),
                detail: err.to_string(),
            }
        } else if err.is_timeout() && route.is_read() {
            EngineError::Busy(format!("engine did not answer in time: {err}"))
        } else if err.is_timeout() {
            // The body went out, so the engine may have acted on it.
            EngineError::OutcomeUnknown(format!("{route} got no reply in time: {err}"))
        } else {
            EngineError::Failed(format!("HTTP request failed: {err}"))
        }
    }
}

/// Query pairs for a GET route. Nulls are dropped; non-strings are sent as
/// their JSON text.
pub fn query_pairs(payload: &Value) -> Vec<(String, String)> {
    let Some(fields) = payload.as_object() else {
        return Vec::new();
    };
    fields
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

/// Classify a failed engine response.
pub fn map_error(status: StatusCode, body: &Value) -> EngineError {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("engine returned {status}"));
    match body.get("code").and_then(Value::as_str) {
        Some("NODE_NOT_FOUND" | "PARM_NOT_FOUND" | "NOT_FOUND") => EngineError::NotFound(message),
        Some("TYPE_MISMATCH" | "INVALID_PARAMS") => EngineError::InvalidArgument(message),
        Some("BUSY") => EngineError::Busy(message),
        _ => match status {
            StatusCode::NOT_FOUND => EngineError::NotFound(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                EngineError::InvalidArgument(message)
            }
            StatusCode::CONFLICT | StatusCode::SERVICE_UNAVAILABLE => EngineError::Busy(message),
            _ => EngineError::Failed(message),
        },
    }
}

impl EngineBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn call<'a>(
        &'a self,
        route: Route,
        payload: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, route.endpoint());
            let req = match route.method() {
                Method::Get => self.http.get(&url).query(&query_pairs(payload)),
                Method::Post => self.http.post(&url).json(payload),
            };

            let resp = req.send().await.map_err(|e| self.transport_error(route, e))?;
            let status = resp.status();
            let text = resp.text().await.map_err(|e| self.transport_error(route, e))?;
            let body: Value = if text.trim().is_empty() {
                json!({})
            } else {
                match serde_json::from_str(&text) {
                    Ok(body) => body,
                    Err(_) if !status.is_success() => json!({ "message": text }),
                    Err(e) => {
                        return Err(EngineError::Failed(format!(
                            "malformed response from {route}: {e}"
                        )));
                    }
                }
            };

            if !status.is_success() || body.get("error") == Some(&Value::Bool(true)) {
                let err = map_error(status, &body);
                tracing::debug!(route = %route, status = %status, error = %err, "Engine reported failure");
                return Err(err);
            }
            Ok(body)
        })
    }
}
