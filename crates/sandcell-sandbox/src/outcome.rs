//! What an execution produces

use crate::logs::LogBuffer;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Failure taxonomy. Every kind is terminal for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Missing or malformed input
    ValidationError,
    /// The source does not parse
    CompileError,
    /// A capability (or a resource behind one) was not granted
    PermissionError,
    /// The deadline passed, or the result can never settle
    TimeoutError,
    /// Uncaught exception from the sandboxed code
    RuntimeError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::CompileError => "CompileError",
            ErrorKind::PermissionError => "PermissionError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::RuntimeError => "RuntimeError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line in the caller's own source (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Location {
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    /// The underlying error text, unmodified
    pub message: String,
    /// Best-effort; absent when the failure did not come from the caller's code
    pub location: Option<Location>,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
        }
    }

    /// `"<message> at line <n>"`, or just the message when no line is known
    pub fn render(&self) -> String {
        match self.location {
            Some(location) => format!("{} at line {}", self.message, location.line),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.render())
    }
}

/// Result of one execution. Logs are kept on both arms.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success { logs: LogBuffer, result: Value },
    Failure { failure: Failure, logs: LogBuffer },
}

impl ExecutionOutcome {
    pub fn logs(&self) -> &LogBuffer {
        match self {
            ExecutionOutcome::Success { logs, .. } | ExecutionOutcome::Failure { logs, .. } => logs,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            ExecutionOutcome::Success { result, .. } => Some(result),
            ExecutionOutcome::Failure { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ExecutionOutcome::Success { .. } => None,
            ExecutionOutcome::Failure { failure, .. } => Some(failure),
        }
    }
}
