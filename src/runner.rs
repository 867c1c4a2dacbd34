use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{SandboxError, ValidationError};
use crate::policy::AllowListPolicy;
use crate::sandbox::{
    select_executor, ExecutionRequest, ExecutionResult, Executor, IsolationLevel, LimitOverrides,
    ResourceLimits,
};
use crate::session::SessionDirs;
use crate::validate::{validate, ValidationResult};

/// Entry point for callers that want code run: validate, then execute.
///
/// Holds the process-wide state (policy, executor, session directories,
/// default limits), all fixed at construction. Shared by reference across
/// concurrent requests.
pub struct SandboxRunner {
    policy: Arc<AllowListPolicy>,
    executor: Arc<dyn Executor>,
    sessions: Arc<SessionDirs>,
    default_limits: ResourceLimits,
}

impl SandboxRunner {
    /// Builds the runner from configuration, probing the container runtime
    /// when the configured mode needs it.
    pub async fn from_config(config: &Config) -> Result<Self, SandboxError> {
        let default_limits = config.limits.to_limits()?;
        let policy = Arc::new(AllowListPolicy::from_config(&config.policy));
        let sessions = Arc::new(SessionDirs::new(&config.sandbox.base_dir));
        let executor = select_executor(&config.sandbox, sessions.clone()).await?;

        info!(
            "Sandbox ready: executor={}, isolation={}, {} allowed modules",
            executor.name(),
            executor.isolation(),
            policy.len()
        );
        if !executor.isolation().is_kernel_enforced() {
            warn!("Executed code is NOT isolated from the host");
        }

        Ok(Self::new(policy, executor, sessions, default_limits))
    }

    pub fn new(
        policy: Arc<AllowListPolicy>,
        executor: Arc<dyn Executor>,
        sessions: Arc<SessionDirs>,
        default_limits: ResourceLimits,
    ) -> Self {
        Self {
            policy,
            executor,
            sessions,
            default_limits,
        }
    }

    /// Checks `source` against the allow-list without running it.
    pub fn validate(&self, source: &str) -> ValidationResult {
        validate(source, &self.policy)
    }

    /// Validates and executes `source` in the given session.
    ///
    /// A rejected source is returned as `Err` and never reaches the
    /// executor. Everything after validation (runtime down, timeout,
    /// session directory unusable, failing code) is an `Ok` result with
    /// `succeeded == false`.
    pub async fn run(
        &self,
        session_id: &str,
        source: &str,
        overrides: &LimitOverrides,
    ) -> Result<ExecutionResult, ValidationError> {
        self.run_with_context(session_id, source, overrides, None).await
    }

    /// Like [`run`](Self::run), with `context`'s keys bound as global
    /// variables before `source` starts.
    pub async fn run_with_context(
        &self,
        session_id: &str,
        source: &str,
        overrides: &LimitOverrides,
        context: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ExecutionResult, ValidationError> {
        let validation = self.validate(source);
        if !validation.is_valid {
            info!(
                session = session_id,
                disallowed = ?validation.disallowed_modules,
                "Rejected code before execution"
            );
            return Err(ValidationError { result: validation });
        }

        let request = ExecutionRequest {
            session_id: session_id.to_string(),
            source_code: source.to_string(),
            limits: overrides.apply(&self.default_limits),
            context,
        };
        Ok(self.executor.execute(&request).await)
    }

    pub fn policy(&self) -> &AllowListPolicy {
        &self.policy
    }

    pub fn sessions(&self) -> &SessionDirs {
        &self.sessions
    }

    pub fn default_limits(&self) -> &ResourceLimits {
        &self.default_limits
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.executor.isolation()
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }
}
