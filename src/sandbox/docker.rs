//! Strong-isolation executor: one throwaway Docker container per call.
//!
//! Every call goes through the same scoped lifecycle:
//!
//!   create  → `docker create -i` with the hardened profile and the
//!             session directory bind-mounted read-write
//!   run     → `docker start -a -i`, source piped to `python3 -` on stdin,
//!             under the wall-clock watchdog
//!   remove  → `docker rm -f`, on every path (success, failure, timeout,
//!             and via `Drop` if the future is cancelled)
//!
//! The bind-mounted directory outlives the container; that is how files
//! pass between successive calls of one session.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::process::run_with_watchdog;
use super::{
    ExecutionRequest, ExecutionResult, Executor, IsolationLevel, CONTEXT_ENV, SANDBOX_DIR_ENV,
};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::session::SessionDirs;

/// Label put on every container this crate creates
pub const MANAGED_LABEL: &str = "fluux-sandbox.managed=true";

/// Label key carrying the session id
const SESSION_LABEL: &str = "fluux-sandbox.session";

/// Prefix of generated container names
const CONTAINER_PREFIX: &str = "fluux-sandbox";

/// CFS period matching `cpu_quota` semantics (µs per 100ms)
const CPU_PERIOD: u64 = 100_000;

/// Process count cap inside the container (fork bombs)
const PIDS_LIMIT: u32 = 128;

/// Upper bound for management commands (create, rm, inspect)
const CLI_TIMEOUT: Duration = Duration::from_secs(30);

/// `docker start` exit status when the daemon, not the code, failed
const DOCKER_CLI_ERROR: i32 = 125;

/// Standard daemon socket; when absent the Docker Desktop one is tried
const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
const DESKTOP_SOCKET: &str = "~/.docker/run/docker.sock";

/// Thin wrapper around the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    /// `--host` value when the default socket had to be discovered
    host: Option<String>,
}

impl DockerCli {
    pub fn new(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
            host: discover_host(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        if let Some(ref host) = self.host {
            cmd.arg("--host").arg(host);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Runs a management command and returns its trimmed stdout.
    async fn run(&self, args: &[&str]) -> Result<String, SandboxError> {
        let mut cmd = self.command();
        cmd.args(args);
        let output = tokio::time::timeout(CLI_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                SandboxError::RuntimeUnavailable(format!(
                    "`{} {}` did not answer within {}s",
                    self.bin,
                    args.first().unwrap_or(&""),
                    CLI_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| {
                SandboxError::RuntimeUnavailable(format!("cannot run {}: {e}", self.bin))
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(SandboxError::RuntimeUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Forcibly removes a container, ignoring "no such container".
    async fn force_remove(&self, name: &str) {
        if let Err(e) = self.run(&["rm", "-f", name]).await {
            let msg = e.to_string();
            if !msg.contains("No such container") {
                error!(container = name, "Failed to remove container: {msg}");
            }
        }
    }
}

/// Picks the Docker Desktop socket when `DOCKER_HOST` is unset and the
/// standard socket is missing. `None` means "let the CLI decide".
fn discover_host() -> Option<String> {
    if std::env::var_os("DOCKER_HOST").is_some() || Path::new(DEFAULT_SOCKET).exists() {
        return None;
    }
    let desktop = shellexpand::tilde(DESKTOP_SOCKET).into_owned();
    if Path::new(&desktop).exists() {
        debug!("Using Docker Desktop socket at {desktop}");
        Some(format!("unix://{desktop}"))
    } else {
        None
    }
}

/// A created container, removed on every exit path.
///
/// Call [`Container::remove`] when done. If the owning future is dropped
/// first (cancellation, panic), `Drop` schedules the removal instead.
struct Container {
    cli: DockerCli,
    name: String,
    removed: bool,
}

impl Container {
    async fn create(cli: &DockerCli, args: &[String]) -> Result<Self, SandboxError> {
        let name = args
            .iter()
            .position(|a| a == "--name")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .ok_or_else(|| SandboxError::RuntimeUnavailable("container name missing".into()))?;

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        match cli.run(&argv).await {
            Ok(id) => {
                debug!(container = %name, "Created container {id}");
                Ok(Self {
                    cli: cli.clone(),
                    name,
                    removed: false,
                })
            }
            Err(e) => {
                // A create that timed out may still have produced a container
                cli.force_remove(&name).await;
                Err(e)
            }
        }
    }

    async fn remove(mut self) {
        self.removed = true;
        self.cli.force_remove(&self.name).await;
        debug!(container = %self.name, "Removed container");
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        warn!(container = %self.name, "Container dropped without teardown, removing");
        let cli = self.cli.clone();
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { cli.force_remove(&name).await });
            }
            Err(_) => {
                let mut cmd = std::process::Command::new(&cli.bin);
                if let Some(ref host) = cli.host {
                    cmd.arg("--host").arg(host);
                }
                let _ = cmd.args(["rm", "-f", name.as_str()]).output();
            }
        }
    }
}

/// Executes code in a fresh, hardened container per call.
pub struct DockerExecutor {
    cli: DockerCli,
    sessions: Arc<SessionDirs>,
    image: String,
    mount_path: String,
    user: String,
    tmpfs_size: String,
    max_output_bytes: usize,
}

impl DockerExecutor {
    /// Probes the daemon and the execution image, then builds the executor.
    ///
    /// Either missing is `RuntimeUnavailable`; images are never built or
    /// pulled from here.
    pub async fn connect(
        config: &SandboxConfig,
        sessions: Arc<SessionDirs>,
    ) -> Result<Self, SandboxError> {
        let executor = Self::new(config, sessions);

        let version = executor
            .cli
            .run(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| match e {
                SandboxError::RuntimeUnavailable(detail) => SandboxError::RuntimeUnavailable(
                    format!("Docker daemon is not available, ensure Docker is running: {detail}"),
                ),
                other => other,
            })?;
        info!("Docker daemon reachable (server {version})");

        executor
            .cli
            .run(&["image", "inspect", "--format", "{{.Id}}", executor.image.as_str()])
            .await
            .map_err(|_| {
                SandboxError::RuntimeUnavailable(format!(
                    "Docker image '{image}' not found. Build it with: \
                     docker build -f Dockerfile.sandbox -t {image} .",
                    image = executor.image
                ))
            })?;
        info!("Using Docker image {}", executor.image);

        Ok(executor)
    }

    /// Builds the executor without probing the runtime.
    pub fn new(config: &SandboxConfig, sessions: Arc<SessionDirs>) -> Self {
        Self {
            cli: DockerCli::new(&config.docker_bin),
            sessions,
            image: config.image_ref(),
            mount_path: config.mount_path.clone(),
            user: config.user.clone(),
            tmpfs_size: config.tmpfs_size.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Number of containers created by this crate that still exist.
    /// Zero after every call has returned.
    pub async fn active_environments(&self) -> Result<usize, SandboxError> {
        let filter = format!("label={MANAGED_LABEL}");
        let ids = self.cli.run(&["ps", "-aq", "--filter", filter.as_str()]).await?;
        Ok(ids.lines().filter(|l| !l.trim().is_empty()).count())
    }

    /// `docker create` arguments for one request: hardened profile,
    /// limits, labels, bind mount, interpreter reading stdin.
    fn create_args(
        &self,
        name: &str,
        request: &ExecutionRequest,
        session_dir: &Path,
        context: Option<&str>,
    ) -> Vec<String> {
        let limits = &request.limits;
        let network = if limits.network_enabled { "bridge" } else { "none" };

        let mut args: Vec<String> = vec![
            "create".into(),
            "--interactive".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            MANAGED_LABEL.into(),
            "--label".into(),
            format!("{SESSION_LABEL}={}", request.session_id),
            "--network".into(),
            network.into(),
            // memory-swap equal to memory: no swap
            format!("--memory={}b", limits.memory_bytes),
            format!("--memory-swap={}b", limits.memory_bytes),
            format!("--cpu-period={CPU_PERIOD}"),
            format!("--cpu-quota={}", limits.cpu_quota),
            format!("--pids-limit={PIDS_LIMIT}"),
            "--user".into(),
            self.user.clone(),
            "--cap-drop=ALL".into(),
            "--security-opt=no-new-privileges".into(),
            "--tmpfs".into(),
            format!("/tmp:rw,size={},mode=1777", self.tmpfs_size),
            "--mount".into(),
            format!(
                "type=bind,source={},target={}",
                session_dir.display(),
                self.mount_path
            ),
            "--workdir".into(),
            self.mount_path.clone(),
            "--env".into(),
            format!("{SANDBOX_DIR_ENV}={}", self.mount_path),
        ];
        if let Some(context) = context {
            args.push("--env".into());
            args.push(format!("{CONTEXT_ENV}={context}"));
        }
        args.push(self.image.clone());
        args.push("python3".into());
        args.extend(request.interpreter_args().iter().map(|a| a.to_string()));
        args
    }

    async fn run_in_container(
        &self,
        request: &ExecutionRequest,
        session_dir: PathBuf,
    ) -> Result<ExecutionResult, SandboxError> {
        let name = format!("{CONTAINER_PREFIX}-{}", uuid::Uuid::new_v4());
        let context = request.context_env()?;
        let args = self.create_args(&name, request, &session_dir, context.as_deref());

        let container = Container::create(&self.cli, &args).await?;

        let mut start = self.cli.command();
        start.args(["start", "--attach", "--interactive", container.name.as_str()]);
        let captured = run_with_watchdog(
            start,
            &request.source_code,
            request.limits.timeout,
            self.max_output_bytes,
        )
        .await;

        container.remove().await;

        let captured = captured
            .map_err(|e| SandboxError::RuntimeUnavailable(format!("cannot run docker: {e}")))?;

        // Exit 125 with a daemon error: the container never ran the code
        if !captured.timed_out
            && captured.status.and_then(|s| s.code()) == Some(DOCKER_CLI_ERROR)
            && captured.stderr.contains("Error response from daemon")
        {
            return Err(SandboxError::RuntimeUnavailable(
                captured.stderr.trim().to_string(),
            ));
        }

        Ok(ExecutionResult::from_capture(
            &request.session_id,
            captured,
            IsolationLevel::Container,
            request.limits.timeout,
        ))
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        info!(session = %request.session_id, "Executing code in Docker container");

        let outcome = match self.sessions.resolve(&request.session_id).await {
            Ok(dir) => self.run_in_container(request, dir).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                info!(
                    session = %request.session_id,
                    succeeded = result.succeeded,
                    exit_code = ?result.exit_code,
                    duration_ms = result.duration.as_millis() as u64,
                    "Container execution finished"
                );
                result
            }
            Err(e) => {
                error!(session = %request.session_id, "Container execution failed: {e}");
                ExecutionResult::from_error(
                    &request.session_id,
                    &e,
                    IsolationLevel::Container,
                    started.elapsed(),
                )
            }
        }
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Container
    }

    fn name(&self) -> &str {
        "docker"
    }
}
