use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::BridgeError;

/// One tool call as received from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default = "new_trace_id")]
    pub trace_id: String,
}

fn new_trace_id() -> String {
    format!("trace_{}", uuid::Uuid::new_v4().simple())
}

impl Invocation {
    pub fn new(tool: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            trace_id: new_trace_id(),
        }
    }

    /// Build from a JSON value; anything but an object (or null) as
    /// arguments is an error.
    pub fn from_value(tool: impl Into<String>, arguments: Value) -> Result<Self, BridgeError> {
        match arguments {
            Value::Object(map) => Ok(Self::new(tool, map)),
            Value::Null => Ok(Self::new(tool, Map::new())),
            _ => Err(BridgeError::InvalidArgument(
                "arguments must be a JSON object".into(),
            )),
        }
    }
}

/// Exactly one of a success payload or a classified error.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Value),
    Failure(BridgeError),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn into_result(self) -> Result<Value, BridgeError> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(err) => Err(err),
        }
    }

    /// Envelope returned to the agent.
    pub fn to_json(&self, invocation: &Invocation) -> Value {
        match self {
            Outcome::Success(result) => json!({
                "status": "ok",
                "tool": invocation.tool,
                "trace_id": invocation.trace_id,
                "result": result,
            }),
            Outcome::Failure(err) => json!({
                "status": "error",
                "tool": invocation.tool,
                "trace_id": invocation.trace_id,
                "error": err.to_json(),
            }),
        }
    }
}

impl From<Result<Value, BridgeError>> for Outcome {
    fn from(result: Result<Value, BridgeError>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(err) => Outcome::Failure(err),
        }
    }
}
