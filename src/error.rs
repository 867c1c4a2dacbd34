use std::fmt;
use std::time::Duration;

use crate::sandbox::ErrorKind;
use crate::validate::ValidationResult;

/// Errors raised by the sandbox subsystem.
///
/// Executors never let these escape to the caller of `run()`: runtime,
/// timeout and resource failures are folded into an `ExecutionResult`
/// via [`SandboxError::kind`]. Only startup (config, runtime probe)
/// surfaces them directly.
#[derive(Debug)]
pub enum SandboxError {
    /// Disallowed import or unparsable source. Nothing was executed.
    Validation(String),
    /// The container runtime or execution image is missing/unreachable.
    RuntimeUnavailable(String),
    /// Execution exceeded its wall-clock budget and was torn down.
    Timeout(Duration),
    /// Session directory could not be created or accessed.
    Resource(String),
    /// Invalid configuration value.
    Config(String),
}

impl SandboxError {
    /// Whether the caller can reasonably try again with the same input.
    ///
    /// Nothing is retried inside the subsystem; this only informs callers.
    /// A timeout may succeed under a larger budget, everything else needs
    /// a change of code, configuration or host environment first.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }

    /// The result-level classification of this error, if it belongs in
    /// an `ExecutionResult`. Validation and config errors never do.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SandboxError::RuntimeUnavailable(_) => Some(ErrorKind::RuntimeUnavailable),
            SandboxError::Timeout(_) => Some(ErrorKind::Timeout),
            SandboxError::Resource(_) => Some(ErrorKind::Resource),
            SandboxError::Validation(_) | SandboxError::Config(_) => None,
        }
    }
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Validation(msg) => write!(f, "validation failed: {msg}"),
            SandboxError::RuntimeUnavailable(msg) => write!(f, "sandbox runtime unavailable: {msg}"),
            SandboxError::Timeout(limit) => {
                write!(f, "execution timed out after {}s", limit.as_secs_f64())
            }
            SandboxError::Resource(msg) => write!(f, "session resource error: {msg}"),
            SandboxError::Config(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {}

/// Terminal rejection of a request by the import validator.
///
/// Callers must not retry the same source; the message is meant to be
/// shown verbatim to whoever wrote the code.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub result: ValidationResult,
}

impl ValidationError {
    pub fn message(&self) -> &str {
        &self.result.message
    }

    pub fn disallowed_modules(&self) -> &[String] {
        &self.result.disallowed_modules
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.result.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for SandboxError {
    fn from(err: ValidationError) -> Self {
        SandboxError::Validation(err.result.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeout_is_retriable() {
        assert!(SandboxError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(!SandboxError::RuntimeUnavailable("down".into()).is_retriable());
        assert!(!SandboxError::Resource("disk full".into()).is_retriable());
        assert!(!SandboxError::Validation("bad import".into()).is_retriable());
        assert!(!SandboxError::Config("bad".into()).is_retriable());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SandboxError::RuntimeUnavailable("x".into()).kind(),
            Some(ErrorKind::RuntimeUnavailable)
        );
        assert_eq!(
            SandboxError::Timeout(Duration::from_secs(3)).kind(),
            Some(ErrorKind::Timeout)
        );
        assert_eq!(SandboxError::Resource("x".into()).kind(), Some(ErrorKind::Resource));
        assert_eq!(SandboxError::Validation("x".into()).kind(), None);
        assert_eq!(SandboxError::Config("x".into()).kind(), None);
    }

    #[test]
    fn test_display_timeout() {
        let err = SandboxError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "execution timed out after 1.5s");
    }

    #[test]
    fn test_validation_error_displays_message_verbatim() {
        let err = ValidationError {
            result: ValidationResult::rejected(vec!["requests".to_string()]),
        };
        assert_eq!(err.to_string(), err.message());
        assert_eq!(err.disallowed_modules(), ["requests".to_string()]);
    }
}
