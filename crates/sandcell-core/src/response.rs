//! Outbound response contract
//!
//! Success: `200 { "state": "Success", "output": [...], "result": value }`.
//! Failure: `{ "state": "Failed", "error": "...", "output": [...] }` with a
//! status chosen by [`status_for`]. `"truncated": true` appears only when
//! console output was dropped.

use crate::request::RequestError;
use sandcell_sandbox::{ErrorKind, ExecutionOutcome};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResponse {
    pub state: RunState,
    pub output: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl RunResponse {
    fn failed(error: String, output: Vec<Value>, truncated: bool) -> Self {
        Self {
            state: RunState::Failed,
            output,
            result: None,
            error: Some(error),
            truncated,
        }
    }
}

/// A rendered response plus the HTTP status it goes out with
#[derive(Debug, Clone, PartialEq)]
pub struct RunReply {
    pub status: u16,
    /// Failure kind, for frontends that report it out of band
    pub kind: Option<ErrorKind>,
    pub body: RunResponse,
}

impl RunReply {
    /// The body never made it to the engine
    pub fn rejected(err: &RequestError) -> Self {
        Self {
            status: 400,
            kind: Some(ErrorKind::ValidationError),
            body: RunResponse::failed(err.to_string(), Vec::new(), false),
        }
    }

    /// No execution slot freed up in time
    pub fn busy() -> Self {
        Self {
            status: 503,
            kind: None,
            body: RunResponse::failed(
                "Server is busy, try again later".to_string(),
                Vec::new(),
                false,
            ),
        }
    }

    pub fn is_success(&self) -> bool {
        self.body.state == RunState::Success
    }
}

impl From<ExecutionOutcome> for RunReply {
    fn from(outcome: ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Success { logs, result } => {
                let truncated = logs.is_truncated();
                Self {
                    status: 200,
                    kind: None,
                    body: RunResponse {
                        state: RunState::Success,
                        output: logs.into_entries(),
                        result: Some(result),
                        error: None,
                        truncated,
                    },
                }
            }
            ExecutionOutcome::Failure { failure, logs } => {
                let truncated = logs.is_truncated();
                Self {
                    status: status_for(failure.kind),
                    kind: Some(failure.kind),
                    body: RunResponse::failed(failure.render(), logs.into_entries(), truncated),
                }
            }
        }
    }
}

/// HTTP status for a failure kind
pub fn status_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::TimeoutError => 408,
        ErrorKind::ValidationError
        | ErrorKind::CompileError
        | ErrorKind::PermissionError
        | ErrorKind::RuntimeError => 400,
    }
}
