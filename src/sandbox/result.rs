use std::time::Duration;

use serde::{Serialize, Serializer};

use super::process::Captured;
use super::IsolationLevel;
use crate::error::SandboxError;

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The code ran and exited with a failure status
    NonZeroExit,
    /// Wall-clock budget exceeded, environment torn down
    Timeout,
    /// Container runtime or image not reachable
    RuntimeUnavailable,
    /// Session directory could not be created or accessed
    Resource,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NonZeroExit => "non_zero_exit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RuntimeUnavailable => "runtime_unavailable",
            ErrorKind::Resource => "resource",
        }
    }
}

/// Outcome of one execution, identical in shape for every executor.
///
/// Returned by value; the executor keeps no reference to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub session_id: String,
    pub stdout: String,
    pub stderr: String,
    pub succeeded: bool,
    /// `None` exactly when `succeeded` is true
    pub error_kind: Option<ErrorKind>,
    /// Interpreter exit status, when the process ran to completion
    pub exit_code: Option<i32>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub isolation: IsolationLevel,
    /// Output was cut at the configured byte cap
    pub truncated: bool,
}

impl ExecutionResult {
    /// Classifies a finished (or killed) process.
    pub(crate) fn from_capture(
        session_id: &str,
        captured: Captured,
        isolation: IsolationLevel,
        timeout: Duration,
    ) -> Self {
        let exit_code = captured.status.and_then(|s| s.code());
        let error_kind = if captured.timed_out {
            Some(ErrorKind::Timeout)
        } else if captured.status.map(|s| s.success()).unwrap_or(false) {
            None
        } else {
            Some(ErrorKind::NonZeroExit)
        };

        let mut stderr = captured.stderr;
        if captured.timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&SandboxError::Timeout(timeout).to_string());
        }

        Self {
            session_id: session_id.to_string(),
            stdout: captured.stdout,
            stderr,
            succeeded: error_kind.is_none(),
            error_kind,
            exit_code,
            duration: captured.duration,
            isolation,
            truncated: captured.truncated,
        }
    }

    /// A request that never produced a process (or whose environment
    /// could not be started). The error text goes to `stderr`.
    pub(crate) fn from_error(
        session_id: &str,
        error: &SandboxError,
        isolation: IsolationLevel,
        duration: Duration,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            stdout: String::new(),
            stderr: error.to_string(),
            succeeded: false,
            error_kind: Some(error.kind().unwrap_or(ErrorKind::RuntimeUnavailable)),
            exit_code: None,
            duration,
            isolation,
            truncated: false,
        }
    }

    /// Renders the result as plain text for a model or a terminal:
    /// stdout, then a `STDERR:` block, then a status line on failure.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("STDERR:\n");
            out.push_str(&self.stderr);
        }
        if let Some(kind) = self.error_kind {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            match (kind, self.exit_code) {
                (ErrorKind::NonZeroExit, Some(code)) => {
                    out.push_str(&format!("[execution failed: exit code {code}]"))
                }
                _ => out.push_str(&format!("[execution failed: {}]", kind.as_str())),
            }
        }
        if out.is_empty() {
            out.push_str("[no output]");
        }
        out
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn exit_status(code: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }

    fn captured(stdout: &str, stderr: &str) -> Captured {
        Captured {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status: None,
            timed_out: false,
            truncated: false,
            duration: Duration::from_millis(120),
        }
    }

    // ── classification ──────────────────────────────────

    #[cfg(unix)]
    #[test]
    fn test_success() {
        let mut c = captured("42\n", "");
        c.status = Some(exit_status(0));
        let r = ExecutionResult::from_capture("s1", c, IsolationLevel::Container, Duration::from_secs(5));
        assert!(r.succeeded);
        assert_eq!(r.error_kind, None);
        assert_eq!(r.exit_code, Some(0));
        assert_eq!(r.stdout, "42\n");
        assert_eq!(r.session_id, "s1");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit() {
        let mut c = captured("", "Traceback...\nZeroDivisionError\n");
        c.status = Some(exit_status(1));
        let r = ExecutionResult::from_capture("s1", c, IsolationLevel::Process, Duration::from_secs(5));
        assert!(!r.succeeded);
        assert_eq!(r.error_kind, Some(ErrorKind::NonZeroExit));
        assert_eq!(r.exit_code, Some(1));
        assert!(r.stderr.contains("ZeroDivisionError"));
    }

    #[test]
    fn test_timeout_keeps_partial_output() {
        let mut c = captured("partial\n", "warming up");
        c.timed_out = true;
        let r = ExecutionResult::from_capture("s1", c, IsolationLevel::Container, Duration::from_secs(2));
        assert!(!r.succeeded);
        assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(r.exit_code, None);
        assert_eq!(r.stdout, "partial\n");
        assert_eq!(r.stderr, "warming up\nexecution timed out after 2s");
    }

    #[test]
    fn test_from_error() {
        let err = SandboxError::RuntimeUnavailable("daemon down".into());
        let r = ExecutionResult::from_error("s1", &err, IsolationLevel::Container, Duration::ZERO);
        assert!(!r.succeeded);
        assert_eq!(r.error_kind, Some(ErrorKind::RuntimeUnavailable));
        assert!(r.stderr.contains("daemon down"));

        let err = SandboxError::Resource("disk full".into());
        let r = ExecutionResult::from_error("s1", &err, IsolationLevel::Process, Duration::ZERO);
        assert_eq!(r.error_kind, Some(ErrorKind::Resource));
    }

    // ── rendering ───────────────────────────────────────

    #[test]
    fn test_to_text_failure() {
        let err = SandboxError::Timeout(Duration::from_secs(1));
        let mut r = ExecutionResult::from_error("s1", &err, IsolationLevel::Container, Duration::ZERO);
        r.stdout = "out".into();
        assert_eq!(
            r.to_text(),
            "out\nSTDERR:\nexecution timed out after 1s\n[execution failed: timeout]"
        );
    }

    #[test]
    fn test_to_text_empty_success() {
        let r = ExecutionResult {
            session_id: "s1".into(),
            stdout: String::new(),
            stderr: String::new(),
            succeeded: true,
            error_kind: None,
            exit_code: Some(0),
            duration: Duration::ZERO,
            isolation: IsolationLevel::Container,
            truncated: false,
        };
        assert_eq!(r.to_text(), "[no output]");
    }

    #[test]
    fn test_serialize_json() {
        let err = SandboxError::Resource("x".into());
        let r = ExecutionResult::from_error("s1", &err, IsolationLevel::Process, Duration::from_millis(1500));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["duration_ms"], 1500);
        assert_eq!(json["error_kind"], "resource");
        assert_eq!(json["isolation"], "process");
        assert_eq!(json["succeeded"], false);
    }
}
