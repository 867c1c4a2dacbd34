pub mod builtin;
pub mod registry;

use async_trait::async_trait;

/// Runtime context passed to skill execution.
pub struct SkillContext {
    /// Session the invocation belongs to, so files carry over between
    /// calls of one conversation. Set by the caller, never by the model.
    pub session_id: String,
}

/// A tool a reasoning loop can invoke via tool_use.
///
/// The loop calls `execute()` when the model requests the tool.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Unique identifier used in the `tools[]` array.
    /// Must be lowercase alphanumeric + underscores (e.g. "python_interpreter").
    fn name(&self) -> &str;

    /// Human-readable description shown to the model so it knows
    /// when to invoke this skill.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters this skill accepts.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Declared capabilities, e.g. "process:docker", "filesystem:/tmp/sandboxes:write"
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    /// Execute the skill with the given parameters and return a text result.
    /// The returned string is sent back to the model as a `tool_result`.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &SkillContext,
    ) -> anyhow::Result<String>;
}

pub use registry::{SkillRegistry, ToolDefinition};
