//! Failure diagnosis
//!
//! Turns whatever went wrong into a [`Failure`]. Location extraction is
//! best-effort: the caller's source is registered with the interpreter under
//! [`SOURCE_MARKER`], and a line number is reported only when the diagnostic
//! trace names that marker. Anything else yields no location rather than a
//! guess.

use crate::outcome::{ErrorKind, Failure, Location};

/// Path the caller's source is registered under
pub const SOURCE_MARKER: &str = "sandcell:input";

/// Lines the async wrapper adds in front of the caller's source
pub const WRAPPER_PREFIX_LINES: u32 = 1;

/// `name` carried by errors thrown for refused capabilities
pub(crate) const PERMISSION_ERROR_NAME: &str = "PermissionError";

/// A failure before diagnosis
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFailure {
    Validation(String),
    Compile(String),
    Timeout(String),
    /// A capability refusal raised by the host and left uncaught
    Refused(String),
    /// A value thrown (or a promise rejected) inside the sandbox
    Thrown {
        /// The error's `name`, when it has one
        name: Option<String>,
        message: String,
        /// Engine diagnostic text searched for the source marker
        trace: String,
        /// Prefix lines of the wrapping the source ran under
        prefix_lines: u32,
    },
    /// The sandbox itself failed (worker lost, result too large, setup error)
    Internal(String),
}

pub fn diagnose(raw: RawFailure) -> Failure {
    match raw {
        RawFailure::Validation(message) => Failure::new(ErrorKind::ValidationError, message),
        RawFailure::Compile(message) => Failure::new(ErrorKind::CompileError, message),
        RawFailure::Timeout(message) => Failure::new(ErrorKind::TimeoutError, message),
        RawFailure::Refused(message) => Failure::new(ErrorKind::PermissionError, message),
        RawFailure::Internal(message) => Failure::new(ErrorKind::RuntimeError, message),
        RawFailure::Thrown {
            message,
            trace,
            prefix_lines,
            ..
        } => Failure {
            kind: ErrorKind::RuntimeError,
            message,
            location: locate(&trace, prefix_lines),
        },
    }
}

/// Find the caller's line in a diagnostic trace
///
/// Takes the first line number right after [`SOURCE_MARKER`] (`marker:12`,
/// `marker line 12`, ...) and removes the wrapper's prefix lines. Returns
/// `None` when the marker is absent, no number follows it, or the line
/// falls inside the wrapper.
pub fn locate(trace: &str, prefix_lines: u32) -> Option<Location> {
    let (_, after) = trace.split_once(SOURCE_MARKER)?;
    let after = after.trim_start_matches(|c: char| c == ':' || c == '(' || c.is_whitespace());
    let after = after
        .strip_prefix("line")
        .map(|rest| rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace()))
        .unwrap_or(after);

    let digits_end = after
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(after.len());
    let line: u32 = after[..digits_end].parse().ok()?;

    line.checked_sub(prefix_lines)
        .filter(|line| *line > 0)
        .map(|line| Location { line })
}
