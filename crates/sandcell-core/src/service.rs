//! The compiler service: request parsing, concurrency gate, engine call

use crate::config::Config;
use crate::request::parse_request;
use crate::response::RunReply;
use sandcell_sandbox::{ExecutionRequest, SandboxEngine};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Runs requests against one engine, at most `max_concurrent` at a time
///
/// Cheap to clone; clones share the engine and the slots.
#[derive(Debug, Clone)]
pub struct CompilerService {
    engine: SandboxEngine,
    slots: Arc<Semaphore>,
}

impl CompilerService {
    pub fn new(config: &Config) -> Self {
        Self {
            engine: SandboxEngine::new(config.sandbox.clone()),
            slots: Arc::new(Semaphore::new(config.server.max_concurrent)),
        }
    }

    pub fn engine(&self) -> &SandboxEngine {
        &self.engine
    }

    /// Handle a raw JSON body
    pub async fn run(&self, body: &Value) -> RunReply {
        match parse_request(body) {
            Ok(request) => self.execute(&request).await,
            Err(err) => {
                warn!(error = %err, "rejected request");
                RunReply::rejected(&err)
            }
        }
    }

    /// Execute a parsed request
    ///
    /// Waits for a free slot for at most the execution timeout, then gives up
    /// with a busy reply.
    pub async fn execute(&self, request: &ExecutionRequest) -> RunReply {
        let wait = self.engine.config().timeout();
        let _permit = match tokio::time::timeout(wait, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(wait_ms = wait.as_millis() as u64, "no execution slot available");
                return RunReply::busy();
            }
        };
        debug!(
            available = self.slots.available_permits(),
            capabilities = ?request.requested_capabilities,
            "execution slot acquired"
        );

        RunReply::from(self.engine.execute(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use sandcell_sandbox::SandboxConfig;

    fn service(max_concurrent: usize, timeout_ms: u64) -> CompilerService {
        CompilerService::new(&Config {
            server: ServerConfig {
                max_concurrent,
                ..ServerConfig::default()
            },
            sandbox: SandboxConfig {
                timeout_ms,
                ..SandboxConfig::default()
            },
        })
    }

    #[tokio::test]
    async fn test_busy_when_no_slot_frees_up() {
        let service = service(1, 100);
        let _held = service.slots.clone().acquire_owned().await.unwrap();

        let reply = service.execute(&ExecutionRequest::new("1")).await;
        assert_eq!(reply.status, 503);
        assert!(reply.kind.is_none());
    }

    #[tokio::test]
    async fn test_slot_is_released_after_execution() {
        let service = service(1, 1_000);
        for _ in 0..3 {
            let reply = service.execute(&ExecutionRequest::new("1")).await;
            assert_eq!(reply.status, 200);
        }
        assert_eq!(service.slots.available_permits(), 1);
    }
}
