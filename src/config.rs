use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::permission::PermissionConfig;

// ---------------------------------------------------------------------------
// Project config: codecoder.json at the worktree root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub default_agent: Option<String>,
    /// Per-agent overrides merged into the built-in registry.
    #[serde(default)]
    pub agent: HashMap<String, AgentOverride>,
    #[serde(default)]
    pub permission: PermissionConfig,
    /// MCP server map; passed through to tool discovery.
    #[serde(default)]
    pub mcp: HashMap<String, McpServerConfig>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub experimental: Experimental,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Experimental {
    #[serde(default, rename = "openTelemetry")]
    pub open_telemetry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// User config entry for one agent. `disable: true` removes the agent;
/// every other field merges over the built-in definition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentOverride {
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub hidden: Option<bool>,
    #[serde(default)]
    pub steps: Option<usize>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub permission: PermissionConfig,
}

impl ProjectConfig {
    pub fn load(worktree: &Path) -> Result<Self> {
        let path = worktree.join("codecoder.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: ProjectConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Global defaults: ~/.ccode/config.toml
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_steps() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub retention_days: Option<u64>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider: None,
            max_steps: 50,
            logging: LoggingConfig::default(),
        }
    }
}

impl GlobalConfig {
    pub fn load() -> Result<Self> {
        let path = crate::paths::global_config_file();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        let config: GlobalConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_project_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load(tmp.path()).unwrap();
        assert!(config.default_agent.is_none());
        assert!(config.agent.is_empty());
    }

    #[test]
    fn test_project_config_parse() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("codecoder.json"),
            r#"{
                "default_agent": "build",
                "agent": {
                    "build": { "temperature": 0.2 },
                    "legacy": { "disable": true }
                },
                "permission": { "bash": { "git *": "allow" } },
                "model": "small-coder",
                "experimental": { "openTelemetry": true },
                "username": "sam"
            }"#,
        )
        .unwrap();
        let config = ProjectConfig::load(tmp.path()).unwrap();
        assert_eq!(config.default_agent.as_deref(), Some("build"));
        assert!(config.agent["legacy"].disable);
        assert_eq!(config.agent["build"].temperature, Some(0.2));
        assert!(config.experimental.open_telemetry);
        assert_eq!(config.username.as_deref(), Some("sam"));
        assert_eq!(config.permission.len(), 1);
    }

    #[test]
    fn test_malformed_project_config_errors() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("codecoder.json"), "{ nope").unwrap();
        assert!(ProjectConfig::load(tmp.path()).is_err());
    }
}
