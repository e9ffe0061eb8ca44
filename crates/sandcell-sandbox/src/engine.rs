//! Sandbox execution engine

use crate::capabilities::CapabilityRegistry;
use crate::config::SandboxConfig;
use crate::diagnose::{diagnose, RawFailure};
use crate::environment::{self, Job};
use crate::logs::{self, LogBuffer, SharedLogs};
use crate::outcome::ExecutionOutcome;
use crate::SandboxError;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// One unit of work: source code plus the capabilities it asks for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub source_code: String,
    /// Names in caller order; duplicates are harmless
    pub requested_capabilities: Vec<String>,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            requested_capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, name: impl Into<String>) -> Self {
        self.requested_capabilities.push(name.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_capabilities
            .extend(names.into_iter().map(Into::into));
        self
    }
}

/// Runs requests, each in its own isolated environment
///
/// Cheap to clone; clones share the configuration and the worker count.
#[derive(Debug, Clone)]
pub struct SandboxEngine {
    config: Arc<SandboxConfig>,
    workers: Arc<AtomicUsize>,
}

/// Counts one live worker thread until dropped
struct WorkerGuard(Arc<AtomicUsize>);

impl WorkerGuard {
    fn enter(workers: &Arc<AtomicUsize>) -> Self {
        workers.fetch_add(1, Ordering::SeqCst);
        Self(workers.clone())
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SandboxEngine {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config: Arc::new(config),
            workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Worker threads still running, including ones whose caller already
    /// gave up on them after a timeout
    pub fn active_workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Execute under the configured deadline
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        self.execute_with_deadline(request, self.config.timeout())
            .await
    }

    /// Execute under an explicit deadline
    ///
    /// Never fails: every problem, including sandbox setup problems, comes
    /// back as an [`ExecutionOutcome::Failure`] carrying the logs collected
    /// up to that point.
    pub async fn execute_with_deadline(
        &self,
        request: &ExecutionRequest,
        deadline: Duration,
    ) -> ExecutionOutcome {
        let execution_id = Uuid::new_v4();
        let span = info_span!("execute", %execution_id);
        async move {
            let started = Instant::now();
            let logs: SharedLogs = Arc::new(Mutex::new(LogBuffer::with_limits(
                self.config.max_log_entries,
                self.config.max_log_bytes,
            )));

            let result = self.run(request, deadline, &logs, execution_id).await;
            let logs = logs::snapshot(&logs);
            if logs.is_truncated() {
                warn!(dropped = logs.dropped(), "console output truncated");
            }

            let outcome = match result {
                Ok(result) => ExecutionOutcome::Success { logs, result },
                Err(raw) => ExecutionOutcome::Failure {
                    failure: diagnose(raw),
                    logs,
                },
            };
            match outcome.failure() {
                None => info!(elapsed_ms = started.elapsed().as_millis() as u64, "execution succeeded"),
                Some(failure) => info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    kind = %failure.kind,
                    "execution failed"
                ),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        deadline: Duration,
        logs: &SharedLogs,
        execution_id: Uuid,
    ) -> Result<Value, RawFailure> {
        if request.source_code.trim().is_empty() {
            return Err(RawFailure::Validation(
                "Code parameter is required".to_string(),
            ));
        }

        let registry = CapabilityRegistry::resolve(&self.config, &request.requested_capabilities)
            .map_err(|e| RawFailure::Internal(e.to_string()))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let job = Job {
            source: request.source_code.clone(),
            registry,
            config: self.config.clone(),
            logs: logs.clone(),
            cancel: cancel.clone(),
            deadline: Instant::now() + deadline,
        };

        let (tx, rx) = oneshot::channel();
        let worker_name = format!("sandcell-{}", &execution_id.simple().to_string()[..8]);
        let guard = WorkerGuard::enter(&self.workers);
        std::thread::Builder::new()
            .name(worker_name)
            .stack_size(self.config.worker_stack_bytes)
            .spawn(move || {
                let _guard = guard;
                let result = panic::catch_unwind(AssertUnwindSafe(|| environment::run(job)))
                    .unwrap_or_else(|_| {
                        Err(RawFailure::Internal(
                            "Sandbox worker panicked".to_string(),
                        ))
                    });
                let _ = tx.send(result);
            })
            .map_err(|e| RawFailure::Internal(SandboxError::Spawn(e).to_string()))?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RawFailure::Internal(SandboxError::WorkerLost.to_string())),
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                warn!(timeout_ms = deadline.as_millis() as u64, "execution timed out");
                Err(RawFailure::Timeout(format!(
                    "Script execution timed out after {}ms",
                    deadline.as_millis()
                )))
            }
        }
    }
}
