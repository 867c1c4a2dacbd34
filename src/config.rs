use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SandboxError;
use crate::sandbox::ResourceLimits;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Which executor handles every request for the lifetime of the process.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Fresh Docker container per call
    #[default]
    Docker,
    /// Host interpreter, no kernel-level containment
    Fallback,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Select the fallback executor when Docker is unavailable at startup
    /// instead of refusing to start
    #[serde(default)]
    pub allow_fallback: bool,
    /// Session directories live under here; `~` is expanded
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
    /// Where the session directory appears inside the container
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    /// Interpreter used by the fallback executor
    #[serde(default = "default_python_bin")]
    pub python_bin: String,
    /// Per stream (stdout, stderr)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Docker-style size, e.g. "512m", "1g"
    #[serde(default = "default_memory")]
    pub memory: String,
    /// Microseconds of CPU per 100ms period (100000 = one CPU)
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub network: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    /// Extra top-level modules to allow
    #[serde(default)]
    pub allow: Vec<String>,
    /// Modules removed from the allow-list
    #[serde(default)]
    pub deny: Vec<String>,
    /// Use `allow` as the whole allow-list instead of extending the builtin one
    #[serde(default)]
    pub replace: bool,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/tmp/sandboxes")
}

fn default_image() -> String {
    "dolphin-python-sandbox".to_string()
}

fn default_image_tag() -> String {
    "latest".to_string()
}

fn default_mount_path() -> String {
    "/sandbox".to_string()
}

fn default_user() -> String {
    "sandbox".to_string()
}

fn default_tmpfs_size() -> String {
    "100M".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_python_bin() -> String {
    "python3".to_string()
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpu_quota() -> u64 {
    100_000
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            allow_fallback: false,
            base_dir: default_base_dir(),
            image: default_image(),
            image_tag: default_image_tag(),
            mount_path: default_mount_path(),
            user: default_user(),
            tmpfs_size: default_tmpfs_size(),
            docker_bin: default_docker_bin(),
            python_bin: default_python_bin(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu_quota: default_cpu_quota(),
            timeout_secs: default_timeout_secs(),
            network: false,
        }
    }
}

impl SandboxConfig {
    /// Full image reference, e.g. `dolphin-python-sandbox:latest`
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.image_tag)
    }
}

impl LimitsConfig {
    /// System-wide default limits, validated.
    pub fn to_limits(&self) -> Result<ResourceLimits, SandboxError> {
        let memory_bytes = parse_memory_size(&self.memory).ok_or_else(|| {
            SandboxError::Config(format!("limits.memory: cannot parse '{}'", self.memory))
        })?;
        if self.cpu_quota == 0 {
            return Err(SandboxError::Config("limits.cpu_quota must be > 0".into()));
        }
        if self.timeout_secs == 0 {
            return Err(SandboxError::Config("limits.timeout_secs must be > 0".into()));
        }
        Ok(ResourceLimits {
            memory_bytes,
            cpu_quota: self.cpu_quota,
            timeout: Duration::from_secs(self.timeout_secs),
            network_enabled: self.network,
        })
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config text. `${VAR}` references are expanded from the
    /// environment, then every value is validated.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let mut config: Config = toml::from_str(&expanded)?;

        let base_dir = config.sandbox.base_dir.to_string_lossy().into_owned();
        let base_dir = PathBuf::from(shellexpand::tilde(&base_dir).into_owned());
        // Relative to the working directory at load time, never per call
        config.sandbox.base_dir = std::path::absolute(&base_dir).map_err(|e| {
            SandboxError::Config(format!(
                "sandbox.base_dir: cannot resolve '{}': {e}",
                base_dir.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SandboxError> {
        self.limits.to_limits()?;
        if !self.sandbox.mount_path.starts_with('/') {
            return Err(SandboxError::Config(format!(
                "sandbox.mount_path must be absolute (got '{}')",
                self.sandbox.mount_path
            )));
        }
        // Both paths end up inside a comma-separated `--mount` value
        if self.sandbox.base_dir.to_string_lossy().contains(',') {
            return Err(SandboxError::Config(format!(
                "sandbox.base_dir must not contain ',' (got '{}')",
                self.sandbox.base_dir.display()
            )));
        }
        if self.sandbox.mount_path.contains(',') {
            return Err(SandboxError::Config(format!(
                "sandbox.mount_path must not contain ',' (got '{}')",
                self.sandbox.mount_path
            )));
        }
        if self.sandbox.max_output_bytes == 0 {
            return Err(SandboxError::Config(
                "sandbox.max_output_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Human-readable description of the execution mode
    pub fn mode_description(&self) -> String {
        match self.sandbox.mode {
            ExecutionMode::Docker if self.sandbox.allow_fallback => {
                format!("docker ({}), fallback allowed", self.sandbox.image_ref())
            }
            ExecutionMode::Docker => format!("docker ({})", self.sandbox.image_ref()),
            ExecutionMode::Fallback => format!("fallback ({})", self.sandbox.python_bin),
        }
    }
}

/// Parses a Docker-style memory size ("512m", "1g", "2048k", "1048576b",
/// or bare bytes). Case-insensitive suffix; zero is rejected.
pub fn parse_memory_size(value: &str) -> Option<u64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'b' => (&value[..value.len() - 1], 1),
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (value.as_str(), 1),
        _ => return None,
    };
    let n: u64 = digits.parse().ok()?;
    n.checked_mul(multiplier).filter(|bytes| *bytes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parsing ─────────────────────────────────────────

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.sandbox.mode, ExecutionMode::Docker);
        assert!(!config.sandbox.allow_fallback);
        assert_eq!(config.sandbox.base_dir, PathBuf::from("/tmp/sandboxes"));
        assert_eq!(config.sandbox.image_ref(), "dolphin-python-sandbox:latest");
        assert_eq!(config.sandbox.mount_path, "/sandbox");
        assert_eq!(config.limits.memory, "512m");
        assert_eq!(config.limits.cpu_quota, 100_000);
        assert_eq!(config.limits.timeout_secs, 30);
        assert!(!config.limits.network);
        assert!(config.policy.allow.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
[sandbox]
mode = "fallback"
allow_fallback = true
base_dir = "/var/lib/fluux/sandboxes"
image = "my-sandbox"
image_tag = "v2"
python_bin = "/usr/bin/python3.12"

[limits]
memory = "1g"
cpu_quota = 50000
timeout_secs = 10
network = true

[policy]
allow = ["requests"]
deny = ["subprocess"]
"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.mode, ExecutionMode::Fallback);
        assert!(config.sandbox.allow_fallback);
        assert_eq!(config.sandbox.image_ref(), "my-sandbox:v2");
        assert_eq!(config.sandbox.python_bin, "/usr/bin/python3.12");
        assert_eq!(config.policy.allow, vec!["requests"]);
        assert_eq!(config.policy.deny, vec!["subprocess"]);

        let limits = config.limits.to_limits().unwrap();
        assert_eq!(limits.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(limits.cpu_quota, 50_000);
        assert_eq!(limits.timeout, Duration::from_secs(10));
        assert!(limits.network_enabled);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let config = Config::parse(include_str!("../config/sandbox.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(config.sandbox.image_ref(), defaults.sandbox.image_ref());
        assert_eq!(config.sandbox.max_output_bytes, defaults.sandbox.max_output_bytes);
        assert_eq!(
            config.limits.to_limits().unwrap(),
            defaults.limits.to_limits().unwrap()
        );
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("FLUUX_SANDBOX_TEST_IMAGE", "from-env");
        let config = Config::parse("[sandbox]\nimage = \"${FLUUX_SANDBOX_TEST_IMAGE}\"\n").unwrap();
        assert_eq!(config.sandbox.image, "from-env");
    }

    #[test]
    fn test_tilde_expansion_in_base_dir() {
        let config = Config::parse("[sandbox]\nbase_dir = \"~/sandboxes\"\n").unwrap();
        assert!(!config.sandbox.base_dir.to_string_lossy().starts_with('~'));
        assert!(config.sandbox.base_dir.ends_with("sandboxes"));
    }

    #[test]
    fn test_relative_base_dir_is_made_absolute() {
        let config = Config::parse("[sandbox]\nbase_dir = \"sandboxes\"\n").unwrap();
        assert!(config.sandbox.base_dir.is_absolute());
        assert_eq!(
            config.sandbox.base_dir,
            std::env::current_dir().unwrap().join("sandboxes")
        );
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Config::parse("[sandbox]\nmode = \"vm\"\n").is_err());
    }

    // ── validation ──────────────────────────────────────

    #[test]
    fn test_invalid_memory_rejected() {
        let err = Config::parse("[limits]\nmemory = \"lots\"\n").unwrap_err();
        assert!(err.to_string().contains("limits.memory"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = Config::parse("[limits]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn test_zero_cpu_quota_rejected() {
        let err = Config::parse("[limits]\ncpu_quota = 0\n").unwrap_err();
        assert!(err.to_string().contains("cpu_quota"));
    }

    #[test]
    fn test_relative_mount_path_rejected() {
        let err = Config::parse("[sandbox]\nmount_path = \"sandbox\"\n").unwrap_err();
        assert!(err.to_string().contains("mount_path"));
    }

    #[test]
    fn test_comma_in_base_dir_rejected() {
        let err = Config::parse("[sandbox]\nbase_dir = \"/tmp/a,readonly\"\n").unwrap_err();
        assert!(err.to_string().contains("base_dir"));
    }

    #[test]
    fn test_comma_in_mount_path_rejected() {
        let err = Config::parse("[sandbox]\nmount_path = \"/sandbox,ro\"\n").unwrap_err();
        assert!(err.to_string().contains("mount_path"));
    }

    // ── parse_memory_size ───────────────────────────────

    #[test]
    fn test_parse_memory_size() {
        assert_eq!(parse_memory_size("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_size("64k"), Some(64 * 1024));
        assert_eq!(parse_memory_size("100b"), Some(100));
        assert_eq!(parse_memory_size("4096"), Some(4096));
        assert_eq!(parse_memory_size(" 2m "), Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_parse_memory_size_invalid() {
        assert_eq!(parse_memory_size(""), None);
        assert_eq!(parse_memory_size("m"), None);
        assert_eq!(parse_memory_size("0m"), None);
        assert_eq!(parse_memory_size("12x"), None);
        assert_eq!(parse_memory_size("-5m"), None);
    }

    // ── mode_description ────────────────────────────────

    #[test]
    fn test_mode_description() {
        let mut config = Config::default();
        assert_eq!(config.mode_description(), "docker (dolphin-python-sandbox:latest)");

        config.sandbox.allow_fallback = true;
        assert_eq!(
            config.mode_description(),
            "docker (dolphin-python-sandbox:latest), fallback allowed"
        );

        config.sandbox.mode = ExecutionMode::Fallback;
        assert_eq!(config.mode_description(), "fallback (python3)");
    }
}
