use serde::Serialize;
use tracing::info;

use super::Skill;

/// Tool description in the shape model APIs expect.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Skills available to a reasoning loop, looked up by name.
#[derive(Default)]
pub struct SkillRegistry {
    skills: Vec<Box<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a skill. A skill with the same name is replaced.
    pub fn register(&mut self, skill: Box<dyn Skill>) {
        info!(
            "Registering skill: {} (capabilities: {})",
            skill.name(),
            skill.capabilities().join(", ")
        );
        self.skills.retain(|s| s.name() != skill.name());
        self.skills.push(skill);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Skill> {
        self.skills
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.name()).collect()
    }

    /// Definitions for every registered skill, in registration order.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.skills
            .iter()
            .map(|s| ToolDefinition {
                name: s.name().to_string(),
                description: s.description().to_string(),
                input_schema: s.parameters_schema(),
            })
            .collect()
    }
}
