use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// How much of an aborted batch could be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackOutcome {
    Complete,
    Partial,
    NotAttempted,
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::Complete => write!(f, "complete"),
            RollbackOutcome::Partial => write!(f, "partial"),
            RollbackOutcome::NotAttempted => write!(f, "not-attempted"),
        }
    }
}

/// The failure vocabulary every agent-visible error is expressed in.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("engine busy: {0}")]
    EngineBusy(String),

    #[error("engine error: {0}")]
    EngineError(String),

    /// A write whose reply never arrived. It may or may not have been
    /// applied, so it is neither retryable nor undoable.
    #[error("engine error: {0}; the change may have been applied")]
    EngineOutcomeUnknown(String),

    #[error("batch aborted at step {index}: {cause} (rollback {rollback})")]
    BatchAborted {
        index: usize,
        cause: Box<BridgeError>,
        rollback: RollbackOutcome,
        rollback_failures: Vec<String>,
    },
}

impl BridgeError {
    /// Stable snake_case identifier for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::UnknownTool(_) => "unknown_tool",
            BridgeError::InvalidArgument(_) => "invalid_argument",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::Conflict(_) => "conflict",
            BridgeError::AlreadyTerminal(_) => "already_terminal",
            BridgeError::EngineBusy(_) => "engine_busy",
            BridgeError::EngineError(_) | BridgeError::EngineOutcomeUnknown(_) => "engine_error",
            BridgeError::BatchAborted { .. } => "batch_aborted",
        }
    }

    /// Whether the same call may succeed if retried later unchanged.
    pub fn retryable(&self) -> bool {
        matches!(self, BridgeError::EngineBusy(_) | BridgeError::Conflict(_))
    }

    /// True when the engine may hold changes nobody got a reply for.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, BridgeError::EngineOutcomeUnknown(_))
    }

    /// Structured form sent back to the agent.
    pub fn to_json(&self) -> Value {
        match self {
            BridgeError::BatchAborted {
                index,
                cause,
                rollback,
                rollback_failures,
            } => json!({
                "kind": self.kind(),
                "message": self.to_string(),
                "retryable": false,
                "index": index,
                "cause": cause.to_json(),
                "rollback": rollback,
                "rollback_failures": rollback_failures,
            }),
            other => json!({
                "kind": other.kind(),
                "message": other.to_string(),
                "retryable": other.retryable(),
            }),
        }
    }
}

/// Failures reported by an engine backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    Failed(String),

    /// The request was sent but no reply came back in time.
    #[error("{0}")]
    OutcomeUnknown(String),

    #[error("engine unreachable at {url} ({detail}); is the engine bridge running?")]
    Unreachable { url: String, detail: String },
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(msg) => BridgeError::NotFound(msg),
            EngineError::InvalidArgument(msg) => BridgeError::InvalidArgument(msg),
            EngineError::Busy(msg) => BridgeError::EngineBusy(msg),
            EngineError::Failed(msg) => BridgeError::EngineError(msg),
            EngineError::OutcomeUnknown(msg) => BridgeError::EngineOutcomeUnknown(msg),
            unreachable @ EngineError::Unreachable { .. } => {
                BridgeError::EngineError(unreachable.to_string())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_onto_bridge_kinds() {
        let cases = [
            (EngineError::NotFound("x".into()), "not_found"),
            (EngineError::InvalidArgument("x".into()), "invalid_argument"),
            (EngineError::Busy("x".into()), "engine_busy"),
            (EngineError::Failed("x".into()), "engine_error"),
            (EngineError::OutcomeUnknown("x".into()), "engine_error"),
            (
                EngineError::Unreachable {
                    url: "http://127.0.0.1:8765".into(),
                    detail: "refused".into(),
                },
                "engine_error",
            ),
        ];
        for (engine, kind) in cases {
            assert_eq!(BridgeError::from(engine).kind(), kind);
        }
    }

    #[test]
    fn only_busy_and_conflict_are_retryable() {
        assert!(BridgeError::EngineBusy("lock".into()).retryable());
        assert!(BridgeError::Conflict("cook".into()).retryable());
        assert!(!BridgeError::NotFound("node".into()).retryable());
        assert!(!BridgeError::InvalidArgument("arg".into()).retryable());
    }

    #[test]
    fn unanswered_write_is_not_retryable() {
        let err = BridgeError::from(EngineError::OutcomeUnknown("create-node timed out".into()));
        assert!(err.outcome_unknown());
        assert!(!err.retryable());
        let json = err.to_json();
        assert_eq!(json["kind"], "engine_error");
        assert_eq!(json["retryable"], false);
        assert!(json["message"].as_str().unwrap().contains("may have been applied"));
    }

    #[test]
    fn batch_aborted_json_nests_cause() {
        let err = BridgeError::BatchAborted {
            index: 3,
            cause: Box::new(BridgeError::NotFound("/obj/nope".into())),
            rollback: RollbackOutcome::Partial,
            rollback_failures: vec!["step 1: engine busy".into()],
        };
        let json = err.to_json();
        assert_eq!(json["kind"], "batch_aborted");
        assert_eq!(json["index"], 3);
        assert_eq!(json["cause"]["kind"], "not_found");
        assert_eq!(json["rollback"], "partial");
        assert_eq!(json["rollback_failures"][0], "step 1: engine busy");
    }

    #[test]
    fn unreachable_message_names_url() {
        let err: BridgeError = EngineError::Unreachable {
            url: "http://127.0.0.1:8765".into(),
            detail: "connection refused".into(),
        }
        .into();
        assert!(err.to_string().contains("http://127.0.0.1:8765"));
    }
}
