//! Execution of validated code.
//!
//! Two executors implement [`Executor`]:
//!
//! 1. [`DockerExecutor`]: fresh container per call, kernel-enforced
//!    filesystem/network/privilege isolation, memory and CPU caps
//! 2. [`FallbackExecutor`]: host interpreter in the session directory,
//!    same timeout and capture contract, no containment
//!
//! Which one runs is decided once at startup by [`select_executor`] and
//! never changes for the lifetime of the process.

pub mod docker;
pub mod fallback;
pub mod process;
pub mod result;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{ExecutionMode, SandboxConfig};
use crate::error::SandboxError;
use crate::session::SessionDirs;

pub use docker::DockerExecutor;
pub use fallback::FallbackExecutor;
pub use result::{ErrorKind, ExecutionResult};

/// Interpreter flags used by both executors: isolated mode (no user
/// site-packages, no PYTHON* env, no cwd on sys.path), unbuffered
/// output so a timeout still yields what was printed, script on stdin.
pub const INTERPRETER_ARGS: &[&str] = &["-I", "-u", "-"];

/// Environment variable pointing at the session directory as seen by
/// the executed code.
pub const SANDBOX_DIR_ENV: &str = "SANDBOX_DIR";

/// Carries a request's JSON context to the interpreter. The loader
/// removes it from the environment before user code starts.
pub const CONTEXT_ENV: &str = "SANDBOX_CONTEXT";

/// Largest accepted context, serialized
pub const MAX_CONTEXT_BYTES: usize = 64 * 1024;

/// Runs the script from stdin with the context's keys as globals.
/// Compiling the whole script keeps `from __future__` imports legal.
const CONTEXT_LOADER: &str = "import json, os, sys\n\
namespace = {'__name__': '__main__', '__builtins__': __builtins__}\n\
namespace.update(json.loads(os.environ.pop('SANDBOX_CONTEXT')))\n\
exec(compile(sys.stdin.read(), '<stdin>', 'exec'), namespace)\n";

/// [`INTERPRETER_ARGS`] with the context loader in place of a bare `-`.
const CONTEXT_INTERPRETER_ARGS: &[&str] = &["-I", "-u", "-c", CONTEXT_LOADER];

/// Strength of the isolation an executor provides. Carried on every
/// result so it is never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Container with namespaces, cgroups, dropped capabilities
    Container,
    /// Plain host process, no kernel-level containment
    Process,
}

impl IsolationLevel {
    pub fn is_kernel_enforced(&self) -> bool {
        matches!(self, IsolationLevel::Container)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Container => f.write_str("container"),
            IsolationLevel::Process => f.write_str("process (no kernel isolation)"),
        }
    }
}

/// Limits applied to one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Microseconds of CPU per 100ms period
    pub cpu_quota: u64,
    pub timeout: Duration,
    pub network_enabled: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota: 100_000,
            timeout: Duration::from_secs(30),
            network_enabled: false,
        }
    }
}

/// Per-request overrides; unset fields keep the system-wide default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitOverrides {
    pub memory_bytes: Option<u64>,
    pub cpu_quota: Option<u64>,
    pub timeout: Option<Duration>,
    pub network_enabled: Option<bool>,
}

impl LimitOverrides {
    pub fn apply(&self, defaults: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: self.memory_bytes.unwrap_or(defaults.memory_bytes),
            cpu_quota: self.cpu_quota.unwrap_or(defaults.cpu_quota),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            network_enabled: self.network_enabled.unwrap_or(defaults.network_enabled),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One validated unit of work.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub session_id: String,
    pub source_code: String,
    pub limits: ResourceLimits,
    /// Values bound as global variables before the code runs
    pub context: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ExecutionRequest {
    fn has_context(&self) -> bool {
        self.context.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Interpreter flags for this request; the script always comes on stdin.
    pub fn interpreter_args(&self) -> &'static [&'static str] {
        if self.has_context() {
            CONTEXT_INTERPRETER_ARGS
        } else {
            INTERPRETER_ARGS
        }
    }

    /// Serialized context for [`CONTEXT_ENV`], or `None` when there is
    /// nothing to inject.
    pub fn context_env(&self) -> Result<Option<String>, SandboxError> {
        let Some(context) = self.context.as_ref().filter(|c| !c.is_empty()) else {
            return Ok(None);
        };
        let encoded = serde_json::to_string(context)
            .map_err(|e| SandboxError::Resource(format!("cannot encode context: {e}")))?;
        if encoded.len() > MAX_CONTEXT_BYTES {
            return Err(SandboxError::Resource(format!(
                "context is {} bytes, limit is {MAX_CONTEXT_BYTES}",
                encoded.len()
            )));
        }
        Ok(Some(encoded))
    }
}

/// Runs validated source code against a session directory.
///
/// Implementations never fail with an `Err`: runtime, timeout and
/// resource problems come back as an [`ExecutionResult`] with the
/// matching [`ErrorKind`]. Callers only ever see this interface, so
/// nothing can depend on which executor is behind it.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs the request to completion or timeout.
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult;

    /// Isolation strength of this executor.
    fn isolation(&self) -> IsolationLevel;

    /// Short name for logs, e.g. `"docker"`.
    fn name(&self) -> &str;
}

/// Picks the process-wide executor from configuration.
///
/// In `docker` mode the runtime is probed first. If it is unavailable
/// startup fails, unless `allow_fallback` explicitly permits downgrading
/// to the host interpreter.
pub async fn select_executor(
    config: &SandboxConfig,
    sessions: Arc<SessionDirs>,
) -> Result<Arc<dyn Executor>, SandboxError> {
    match config.mode {
        ExecutionMode::Docker => match DockerExecutor::connect(config, sessions.clone()).await {
            Ok(executor) => {
                info!("Execution mode: docker ({})", config.image_ref());
                Ok(Arc::new(executor))
            }
            Err(e) if config.allow_fallback => {
                warn!("{e}");
                warn!("allow_fallback is set, using the host interpreter without kernel isolation");
                Ok(Arc::new(FallbackExecutor::new(config, sessions)))
            }
            Err(e) => Err(e),
        },
        ExecutionMode::Fallback => {
            info!("Execution mode: fallback ({})", config.python_bin);
            Ok(Arc::new(FallbackExecutor::new(config, sessions)))
        }
    }
}
