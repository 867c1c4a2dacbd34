use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::runner::SandboxRunner;
use crate::sandbox::LimitOverrides;
use crate::skills::{Skill, SkillContext};

/// Longest timeout the model may ask for
const MAX_TIMEOUT_SECS: u64 = 300;

/// Skill that runs Python code in the sandbox.
///
/// Files written under the working directory persist for the session, so
/// the model can build results over several calls. Imports outside the
/// allow-list are rejected before anything runs; the rejection text is
/// returned as-is so the model can rewrite its code.
pub struct PythonInterpreterSkill {
    runner: Arc<SandboxRunner>,
    description: String,
}

impl PythonInterpreterSkill {
    pub fn new(runner: Arc<SandboxRunner>) -> Self {
        let description = format!(
            "Execute Python 3 code in an isolated sandbox and return its output. \
             Print anything you want to see. Files written to the current directory \
             (also available as $SANDBOX_DIR) persist between calls of the same session. \
             Network access is disabled unless requested.\n\n{}",
            runner.policy().describe()
        );
        Self {
            runner,
            description,
        }
    }
}

#[async_trait]
impl Skill for PythonInterpreterSkill {
    fn name(&self) -> &str {
        "python_interpreter"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python source code to execute"
                },
                "context": {
                    "type": "object",
                    "description": "Values made available to the code as global \
                                    variables, keyed by variable name"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Wall-clock limit in seconds",
                    "minimum": 1,
                    "maximum": MAX_TIMEOUT_SECS
                },
                "network": {
                    "type": "boolean",
                    "description": "Allow outbound network access"
                }
            },
            "required": ["code"]
        })
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            format!("process:{}", self.runner.executor_name()),
            format!(
                "filesystem:{}:write",
                self.runner.sessions().base_dir().display()
            ),
        ]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let code = params["code"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: code"))?;
        // The caller's session, never one named by the model
        let session_id = context.session_id.as_str();
        let globals = match params.get("context") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => anyhow::bail!("context must be a JSON object"),
        };

        let timeout = match params.get("timeout_secs") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let secs = v
                    .as_u64()
                    .filter(|s| (1..=MAX_TIMEOUT_SECS).contains(s))
                    .ok_or_else(|| {
                        anyhow::anyhow!("timeout_secs must be an integer between 1 and {MAX_TIMEOUT_SECS}")
                    })?;
                Some(Duration::from_secs(secs))
            }
        };
        let overrides = LimitOverrides {
            timeout,
            network_enabled: params["network"].as_bool(),
            ..Default::default()
        };

        info!(session = session_id, "python_interpreter invoked ({} bytes)", code.len());

        match self
            .runner
            .run_with_context(session_id, code, &overrides, globals)
            .await
        {
            Ok(result) => Ok(result.to_text()),
            Err(rejection) => Ok(rejection.message().to_string()),
        }
    }
}
