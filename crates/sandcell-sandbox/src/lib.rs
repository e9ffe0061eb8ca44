//! Sandcell Sandbox - capability-gated JavaScript execution
//!
//! Every request runs in a fresh interpreter on its own worker thread.
//! No filesystem, no network, no environment variables. Sandboxed code
//! reaches the host only through `console` and `require`, and `require`
//! only hands out what the [`CapabilityRegistry`] granted for that request.

mod bindings;
mod capabilities;
mod config;
mod diagnose;
mod engine;
mod environment;
mod jobs;
mod logs;
mod outcome;
mod serialize;

pub use capabilities::{
    Capability, CapabilityKind, CapabilityRegistry, FsPolicy, HttpPolicy, LoadError, LookupError,
};
pub use config::{HttpConfig, SandboxConfig};
pub use diagnose::{diagnose, locate, RawFailure, SOURCE_MARKER, WRAPPER_PREFIX_LINES};
pub use engine::{ExecutionRequest, SandboxEngine};
pub use logs::LogBuffer;
pub use outcome::{ErrorKind, ExecutionOutcome, Failure, Location};

/// Errors from sandbox setup (never from the sandboxed code itself)
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Default capability '{name}' failed to load: {source}")]
    DefaultCapability {
        name: String,
        #[source]
        source: LoadError,
    },

    #[error("Failed to start sandbox worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Sandbox worker terminated unexpectedly")]
    WorkerLost,
}

pub type Result<T> = std::result::Result<T, SandboxError>;
