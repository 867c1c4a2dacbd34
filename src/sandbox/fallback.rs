//! Degraded executor: the host interpreter, run in the session directory.
//!
//! Keeps the interface contract (per-session working directory, timeout,
//! output capture, result shape) but enforces no memory, CPU, network or
//! filesystem containment. Only ever selected by explicit configuration.
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info, warn};

use super::process::run_with_watchdog;
use super::{
    ExecutionRequest, ExecutionResult, Executor, IsolationLevel, CONTEXT_ENV, SANDBOX_DIR_ENV,
};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::session::SessionDirs;

/// Default search path when the host one is unset
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub struct FallbackExecutor {
    python_bin: String,
    sessions: Arc<SessionDirs>,
    max_output_bytes: usize,
}

impl FallbackExecutor {
    pub fn new(config: &SandboxConfig, sessions: Arc<SessionDirs>) -> Self {
        warn!(
            "Fallback executor active: code runs as a host process, memory/CPU/network limits are NOT enforced"
        );
        Self {
            python_bin: config.python_bin.clone(),
            sessions,
            max_output_bytes: config.max_output_bytes,
        }
    }

    async fn run_on_host(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let dir = self.sessions.resolve(&request.session_id).await?;
        let context = request.context_env()?;

        if request.limits.network_enabled {
            // Network is simply whatever the host has; nothing to toggle
            warn!(session = %request.session_id, "Network request ignored by fallback executor");
        }

        let mut cmd = Command::new(&self.python_bin);
        cmd.args(request.interpreter_args())
            .current_dir(&dir)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string()),
            )
            .env("HOME", &dir)
            .env(SANDBOX_DIR_ENV, &dir);
        if let Some(context) = context {
            cmd.env(CONTEXT_ENV, context);
        }

        let captured = run_with_watchdog(
            cmd,
            &request.source_code,
            request.limits.timeout,
            self.max_output_bytes,
        )
        .await
        .map_err(|e| {
            SandboxError::RuntimeUnavailable(format!("cannot start {}: {e}", self.python_bin))
        })?;

        Ok(ExecutionResult::from_capture(
            &request.session_id,
            captured,
            IsolationLevel::Process,
            request.limits.timeout,
        ))
    }
}

#[async_trait]
impl Executor for FallbackExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        info!(session = %request.session_id, "Executing code with host interpreter");

        match self.run_on_host(request).await {
            Ok(result) => {
                info!(
                    session = %request.session_id,
                    succeeded = result.succeeded,
                    exit_code = ?result.exit_code,
                    duration_ms = result.duration.as_millis() as u64,
                    "Host execution finished"
                );
                result
            }
            Err(e) => {
                error!(session = %request.session_id, "Host execution failed: {e}");
                ExecutionResult::from_error(
                    &request.session_id,
                    &e,
                    IsolationLevel::Process,
                    started.elapsed(),
                )
            }
        }
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Process
    }

    fn name(&self) -> &str {
        "fallback"
    }
}
