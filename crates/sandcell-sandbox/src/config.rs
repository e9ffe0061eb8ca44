//! Sandbox configuration

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sandbox
///
/// Every field has a default, so an empty `[sandbox]` table is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock deadline for one execution, in milliseconds
    pub timeout_ms: u64,
    /// Capabilities granted to every execution
    pub default_capabilities: Vec<String>,
    /// Object fields dropped from results at any depth (console output keeps them)
    pub denylist: Vec<String>,
    /// Maximum number of console entries kept per execution
    pub max_log_entries: usize,
    /// Maximum serialized size of all console entries, in bytes
    pub max_log_bytes: usize,
    /// Maximum serialized size of the result, in bytes
    pub max_result_bytes: usize,
    /// Nesting depth past which values serialize as `null`
    pub max_depth: usize,
    /// Interpreter loop iteration ceiling (reaps runaway loops after a timeout)
    pub loop_iteration_limit: u64,
    /// Interpreter recursion ceiling
    pub recursion_limit: usize,
    /// Interpreter value stack ceiling
    pub stack_size_limit: usize,
    /// Native stack size of each worker thread, in bytes
    pub worker_stack_bytes: usize,
    /// Directory the `fs` capability is confined to. `fs` cannot load without it.
    pub fs_root: Option<PathBuf>,
    /// Maximum bytes a single `fs` write may carry
    pub max_write_bytes: usize,
    /// Outbound HTTP policy for the `http` and `fetch` capabilities
    pub http: HttpConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            default_capabilities: vec!["path".to_string(), "timers".to_string()],
            denylist: vec!["config".to_string(), "request".to_string()],
            max_log_entries: 1_000,
            max_log_bytes: 256 * 1024,     // 256KB
            max_result_bytes: 1024 * 1024, // 1MB
            max_depth: 64,
            loop_iteration_limit: 100_000_000,
            recursion_limit: 512,
            stack_size_limit: 64 * 1024,
            worker_stack_bytes: 16 * 1024 * 1024, // 16MB
            fs_root: None,
            max_write_bytes: 1024 * 1024,
            http: HttpConfig::default(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outbound HTTP policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// When false, `http` and `fetch` never load
    pub enabled: bool,
    /// Hosts sandboxed code may contact. Empty means any host.
    /// Entries are exact hosts, `*`, or `*.example.com` suffix patterns.
    pub allowed_hosts: Vec<String>,
    /// Per-request timeout, in milliseconds (further capped by the deadline)
    pub timeout_ms: u64,
    /// Maximum response body size, in bytes
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_hosts: Vec::new(),
            timeout_ms: 10_000,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
