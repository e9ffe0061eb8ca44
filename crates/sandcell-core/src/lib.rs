//! Sandcell Core - the wire contract and execution service
//!
//! Shared by every frontend (HTTP server, one-shot CLI runs): request
//! parsing, response rendering and status mapping, the configuration file,
//! and the concurrency-gated [`CompilerService`].

pub mod config;
pub mod request;
pub mod response;
pub mod service;

pub use config::{Config, ConfigError, ServerConfig};
pub use request::{parse_capabilities, parse_query, parse_request, RequestError};
pub use response::{status_for, RunReply, RunResponse, RunState};
pub use service::CompilerService;
pub use sandcell_sandbox::{ErrorKind, ExecutionRequest};
