//! Sandboxed Python execution for AI agents.
//!
//! Source code goes through two gates: a static import check against an
//! allow-list ([`validate`]), then an [`Executor`](sandbox::Executor) that
//! runs it in a per-session working directory under resource limits.
//! [`SandboxRunner`] ties the two together.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use fluux_sandbox::{Config, LimitOverrides, SandboxRunner};
//!
//! let config = Config::load("config/sandbox.toml")?;
//! let runner = SandboxRunner::from_config(&config).await?;
//! match runner.run("s1", "print(6 * 7)", &LimitOverrides::default()).await {
//!     Ok(result) => println!("{}", result.to_text()),
//!     Err(rejected) => println!("{rejected}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod policy;
pub mod runner;
pub mod sandbox;
pub mod session;
pub mod skills;
pub mod validate;

pub use config::Config;
pub use error::{SandboxError, ValidationError};
pub use policy::AllowListPolicy;
pub use runner::SandboxRunner;
pub use sandbox::{
    ErrorKind, ExecutionRequest, ExecutionResult, Executor, IsolationLevel, LimitOverrides,
    ResourceLimits,
};
pub use session::{SessionDirs, SessionFile, SessionId};
pub use validate::{validate, ValidationResult};
