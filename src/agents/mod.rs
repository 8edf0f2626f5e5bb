use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{AgentOverride, ProjectConfig};
use crate::permission::{PermissionConfig, RuleSource, Ruleset};

// ---------------------------------------------------------------------------
// Agent definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Primary,
    Subagent,
    All,
}

impl AgentMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(AgentMode::Primary),
            "subagent" => Some(AgentMode::Subagent),
            "all" => Some(AgentMode::All),
            _ => None,
        }
    }
}

/// Resolved agent definition. Immutable for the rest of the process once
/// the registry is built.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
    pub mode: AgentMode,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub hidden: bool,
    pub native: bool,
    pub steps: Option<usize>,
    pub color: Option<String>,
    pub options: HashMap<String, JsonValue>,
    pub permission: Ruleset,
}

impl AgentInfo {
    pub fn is_visible_primary(&self) -> bool {
        !self.hidden && matches!(self.mode, AgentMode::Primary | AgentMode::All)
    }
}

#[derive(Debug)]
pub enum RegistryError {
    DefaultAgentNotFound(String),
    NoPrimaryAgent,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DefaultAgentNotFound(name) => {
                write!(f, "default agent not found: {name}")
            }
            RegistryError::NoPrimaryAgent => write!(f, "no visible primary agent available"),
        }
    }
}

impl std::error::Error for RegistryError {}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

struct BuiltinAgent {
    name: &'static str,
    description: &'static str,
    mode: AgentMode,
    hidden: bool,
    temperature: Option<f32>,
    plan_mode: bool,
}

const KNOWN_NATIVE: [&str; 2] = ["build", "plan"];

fn builtin_agents() -> Vec<BuiltinAgent> {
    vec![
        BuiltinAgent {
            name: "build",
            description: "General-purpose coding agent with full tool access",
            mode: AgentMode::Primary,
            hidden: false,
            temperature: None,
            plan_mode: false,
        },
        BuiltinAgent {
            name: "plan",
            description: "Read-mostly planning agent; edits restricted to plan files",
            mode: AgentMode::Primary,
            hidden: false,
            temperature: None,
            plan_mode: true,
        },
        BuiltinAgent {
            name: "explore",
            description: "Fast codebase exploration subagent",
            mode: AgentMode::Subagent,
            hidden: false,
            temperature: None,
            plan_mode: false,
        },
        BuiltinAgent {
            name: "code-reviewer",
            description: "Reviews diffs for correctness and style",
            mode: AgentMode::Subagent,
            hidden: false,
            temperature: None,
            plan_mode: false,
        },
        BuiltinAgent {
            name: "compaction",
            description: "Summarizes pruned context during compaction",
            mode: AgentMode::Subagent,
            hidden: true,
            temperature: Some(0.3),
            plan_mode: false,
        },
        BuiltinAgent {
            name: "title",
            description: "Generates a short session title",
            mode: AgentMode::Subagent,
            hidden: true,
            temperature: Some(0.5),
            plan_mode: false,
        },
        BuiltinAgent {
            name: "summary",
            description: "Generates a session summary on demand",
            mode: AgentMode::Subagent,
            hidden: true,
            temperature: Some(0.3),
            plan_mode: false,
        },
    ]
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Authoritative agent map for this process, materialized once from the
/// built-ins merged with user config.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentInfo>>,
    default_agent: String,
}

impl AgentRegistry {
    pub fn build(config: &ProjectConfig) -> Result<Self, RegistryError> {
        let mut agents: HashMap<String, Arc<AgentInfo>> = HashMap::new();

        for builtin in builtin_agents() {
            let override_entry = config.agent.get(builtin.name);
            if override_entry.map(|o| o.disable).unwrap_or(false) {
                continue;
            }
            let info = merge_agent(
                AgentInfo {
                    name: builtin.name.to_string(),
                    description: builtin.description.to_string(),
                    mode: builtin.mode,
                    model: None,
                    prompt: None,
                    temperature: builtin.temperature,
                    top_p: None,
                    hidden: builtin.hidden,
                    native: true,
                    steps: None,
                    color: None,
                    options: HashMap::new(),
                    permission: Ruleset::default(),
                },
                override_entry,
                config,
                builtin.plan_mode,
            );
            agents.insert(info.name.clone(), Arc::new(info));
        }

        // User-only agents: anything in config not covering a built-in.
        for (name, entry) in &config.agent {
            if entry.disable || agents.contains_key(name) {
                continue;
            }
            if builtin_agents().iter().any(|b| b.name == name) {
                continue; // disabled built-in, handled above
            }
            let info = merge_agent(
                AgentInfo {
                    name: name.clone(),
                    description: String::new(),
                    mode: AgentMode::All,
                    model: None,
                    prompt: None,
                    temperature: None,
                    top_p: None,
                    hidden: false,
                    native: false,
                    steps: None,
                    color: None,
                    options: HashMap::new(),
                    permission: Ruleset::default(),
                },
                Some(entry),
                config,
                false,
            );
            agents.insert(name.clone(), Arc::new(info));
        }

        let default_agent = resolve_default(&agents, config)?;
        Ok(Self {
            agents,
            default_agent,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentInfo>> {
        self.agents.get(name).cloned()
    }

    pub fn default_agent(&self) -> Arc<AgentInfo> {
        self.agents[&self.default_agent].clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn visible(&self) -> Vec<Arc<AgentInfo>> {
        let mut list: Vec<Arc<AgentInfo>> = self
            .agents
            .values()
            .filter(|a| !a.hidden)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

fn merge_agent(
    mut base: AgentInfo,
    override_entry: Option<&AgentOverride>,
    config: &ProjectConfig,
    plan_mode: bool,
) -> AgentInfo {
    let empty = PermissionConfig::new();
    let agent_permission = override_entry.map(|o| &o.permission).unwrap_or(&empty);
    if let Some(entry) = override_entry {
        if let Some(description) = &entry.description {
            base.description = description.clone();
        }
        if let Some(prompt) = &entry.prompt {
            base.prompt = Some(prompt.clone());
        }
        if let Some(model) = &entry.model {
            base.model = Some(model.clone());
        }
        if entry.temperature.is_some() {
            base.temperature = entry.temperature;
        }
        if entry.top_p.is_some() {
            base.top_p = entry.top_p;
        }
        if let Some(mode) = entry.mode.as_deref().and_then(AgentMode::parse) {
            base.mode = mode;
        }
        if let Some(hidden) = entry.hidden {
            base.hidden = hidden;
        }
        if entry.steps.is_some() {
            base.steps = entry.steps;
        }
        if let Some(color) = &entry.color {
            base.color = Some(color.clone());
        }
        for (k, v) in &entry.options {
            base.options.insert(k.clone(), v.clone());
        }
    }
    let compiled = Ruleset::compile(&[
        (RuleSource::Agent, agent_permission),
        (RuleSource::Project, &config.permission),
    ]);
    base.permission = if plan_mode {
        compiled.with_plan_mode()
    } else {
        compiled
    };
    base
}

fn resolve_default(
    agents: &HashMap<String, Arc<AgentInfo>>,
    config: &ProjectConfig,
) -> Result<String, RegistryError> {
    if let Some(name) = &config.default_agent {
        match agents.get(name) {
            Some(agent) if agent.is_visible_primary() => return Ok(name.clone()),
            Some(_) | None => {
                if !KNOWN_NATIVE.contains(&name.as_str()) {
                    return Err(RegistryError::DefaultAgentNotFound(name.clone()));
                }
                // Known-native but disabled/demoted: fall through to detection.
            }
        }
    }
    let mut primaries: Vec<&Arc<AgentInfo>> = agents
        .values()
        .filter(|a| a.is_visible_primary())
        .collect();
    primaries.sort_by(|a, b| a.name.cmp(&b.name));
    primaries
        .first()
        .map(|a| a.name.clone())
        .ok_or(RegistryError::NoPrimaryAgent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::{PermissionAction, PermissionKind, PermissionValue};

    #[test]
    fn test_builtins_present_with_rulesets() {
        let registry = AgentRegistry::build(&ProjectConfig::default()).unwrap();
        for name in ["build", "plan", "explore", "code-reviewer", "compaction", "title", "summary"] {
            let agent = registry.get(name).unwrap();
            assert!(!agent.name.is_empty());
            assert!(!agent.permission.is_empty());
        }
        assert_eq!(registry.default_agent().name, "build");
    }

    #[test]
    fn test_disable_removes_agent() {
        let mut config = ProjectConfig::default();
        config.agent.insert(
            "explore".to_string(),
            AgentOverride {
                disable: true,
                ..Default::default()
            },
        );
        let registry = AgentRegistry::build(&config).unwrap();
        assert!(registry.get("explore").is_none());
    }

    #[test]
    fn test_user_agent_defaults() {
        let mut config = ProjectConfig::default();
        config.agent.insert(
            "docs".to_string(),
            AgentOverride {
                prompt: Some("Write docs.".to_string()),
                ..Default::default()
            },
        );
        let registry = AgentRegistry::build(&config).unwrap();
        let docs = registry.get("docs").unwrap();
        assert_eq!(docs.mode, AgentMode::All);
        assert!(!docs.native);
        assert_eq!(docs.prompt.as_deref(), Some("Write docs."));
    }

    #[test]
    fn test_default_agent_not_found() {
        let mut config = ProjectConfig::default();
        config.default_agent = Some("ghost".to_string());
        match AgentRegistry::build(&config) {
            Err(RegistryError::DefaultAgentNotFound(name)) => assert_eq!(name, "ghost"),
            Err(e) => panic!("expected DefaultAgentNotFound, got {e}"),
            Ok(_) => panic!("expected DefaultAgentNotFound, got a registry"),
        }
    }

    #[test]
    fn test_known_native_default_falls_back() {
        let mut config = ProjectConfig::default();
        config.default_agent = Some("build".to_string());
        config.agent.insert(
            "build".to_string(),
            AgentOverride {
                disable: true,
                ..Default::default()
            },
        );
        let registry = AgentRegistry::build(&config).unwrap();
        // build is gone; auto-detection picks the remaining visible primary.
        assert_eq!(registry.default_agent().name, "plan");
    }

    #[test]
    fn test_plan_agent_edit_restrictions() {
        let registry = AgentRegistry::build(&ProjectConfig::default()).unwrap();
        let plan = registry.get("plan").unwrap();
        assert_eq!(
            plan.permission.decide(PermissionKind::Edit, Some("src/main.rs")),
            PermissionAction::Deny
        );
        assert_eq!(
            plan.permission
                .decide(PermissionKind::Edit, Some("docs/plans/x.md")),
            PermissionAction::Allow
        );
    }

    #[test]
    fn test_agent_permission_override_applies() {
        let mut config = ProjectConfig::default();
        let mut permission = PermissionConfig::new();
        permission.insert(
            "bash".to_string(),
            PermissionValue::Action(PermissionAction::Allow),
        );
        config.agent.insert(
            "build".to_string(),
            AgentOverride {
                permission,
                ..Default::default()
            },
        );
        let registry = AgentRegistry::build(&config).unwrap();
        let build = registry.get("build").unwrap();
        assert_eq!(
            build.permission.decide(PermissionKind::Bash, Some("ls")),
            PermissionAction::Allow
        );
    }
}
