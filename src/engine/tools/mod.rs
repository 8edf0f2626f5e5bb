pub mod file_tools;
pub mod search_tools;
pub mod shell;
pub mod tasks;
pub mod web;

use anyhow::{bail, Result};
use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::memory::history::EditedFile;
use crate::permission::PermissionKind;

// ---------------------------------------------------------------------------
// Tool definitions and schema validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
}

#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    pub description: &'static str,
    pub default: Option<JsonValue>,
}

impl ToolParam {
    pub fn required_string(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            param_type: ParamType::String,
            required: true,
            description,
            default: None,
        }
    }

    pub fn optional(
        name: &'static str,
        param_type: ParamType,
        description: &'static str,
        default: Option<JsonValue>,
    ) -> Self {
        Self {
            name,
            param_type,
            required: false,
            description,
            default,
        }
    }
}

/// Declares one tool: schema, permission kind, output cap, compaction
/// protection. New tools must declare their permission kind.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub kind: PermissionKind,
    pub params: Vec<ToolParam>,
    /// Output beyond this many chars overflows to the truncation directory.
    pub output_cap: usize,
    /// Protected from context compaction (skill-declared capability).
    pub compaction_protected: bool,
}

impl ToolDef {
    /// Provider-neutral JSON schema for the model.
    pub fn schema_json(&self) -> JsonValue {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let type_str = match param.param_type {
                ParamType::String => "string",
                ParamType::Integer => "integer",
                ParamType::Boolean => "boolean",
            };
            properties.insert(
                param.name.to_string(),
                json!({ "type": type_str, "description": param.description }),
            );
            if param.required {
                required.push(param.name);
            }
        }
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }

    /// Validate model-provided JSON against the schema: unknown keys are
    /// rejected, required params enforced, defaults applied. Parse failure
    /// is a tool error, never a crash.
    pub fn validate_args(&self, args: &JsonValue) -> Result<JsonValue> {
        let Some(object) = args.as_object() else {
            bail!("tool input must be a JSON object");
        };
        for key in object.keys() {
            if !self.params.iter().any(|p| p.name == key) {
                bail!("unknown parameter '{}' for tool {}", key, self.name);
            }
        }
        let mut validated = Map::new();
        for param in &self.params {
            match object.get(param.name) {
                Some(value) => {
                    let ok = match param.param_type {
                        ParamType::String => value.is_string(),
                        ParamType::Integer => value.is_i64() || value.is_u64(),
                        ParamType::Boolean => value.is_boolean(),
                    };
                    if !ok {
                        bail!(
                            "parameter '{}' of tool {} has the wrong type",
                            param.name,
                            self.name
                        );
                    }
                    validated.insert(param.name.to_string(), value.clone());
                }
                None if param.required => {
                    bail!(
                        "missing required parameter '{}' for tool {}",
                        param.name,
                        self.name
                    )
                }
                None => {
                    if let Some(default) = &param.default {
                        validated.insert(param.name.to_string(), default.clone());
                    }
                }
            }
        }
        Ok(JsonValue::Object(validated))
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecContext {
    pub worktree: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
    /// Files touched by write-class tools, for edit records.
    pub edited_files: Vec<EditedFile>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            edited_files: Vec::new(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            edited_files: Vec::new(),
        }
    }
}

/// One registered tool: definition plus executor. Executors receive
/// schema-validated args and must observe the cancellation token.
pub trait ToolExecutor: Send + Sync {
    fn def(&self) -> &ToolDef;

    fn execute(
        &self,
        args: JsonValue,
        ctx: ExecContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ToolOutput>>;
}

/// Registered tools, keyed by canonical name. Built once per process.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// All builtin tools.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(file_tools::ReadTool::new()));
        registry.register(Arc::new(file_tools::WriteTool::new()));
        registry.register(Arc::new(file_tools::EditTool::new()));
        registry.register(Arc::new(file_tools::ListTool::new()));
        registry.register(Arc::new(file_tools::GlobTool::new()));
        registry.register(Arc::new(search_tools::GrepTool::new()));
        registry.register(Arc::new(shell::BashTool::new()));
        registry.register(Arc::new(web::WebFetchTool::new()));
        registry.register(Arc::new(tasks::TodoReadTool::new()));
        registry.register(Arc::new(tasks::TodoWriteTool::new()));
        registry.register(Arc::new(tasks::QuestionTool::new()));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn ToolExecutor>) {
        self.tools.insert(tool.def().name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schemas(&self) -> Vec<JsonValue> {
        let mut defs: Vec<&ToolDef> = self.tools.values().map(|t| t.def()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs.iter().map(|d| d.schema_json()).collect()
    }

    /// Whether a tool's results are protected from compaction.
    pub fn is_compaction_protected(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|t| t.def().compaction_protected)
            .unwrap_or(false)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Input extraction shared by hooks and permissions
// ---------------------------------------------------------------------------

/// Target path from a tool input, when the tool has one.
pub fn extract_path(args: &JsonValue) -> Option<String> {
    args.get("path")
        .or_else(|| args.get("file_path"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Command string for shell-class tools.
pub fn extract_command(args: &JsonValue) -> Option<String> {
    args.get("command")
        .or_else(|| args.get("cmd"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Scope value consulted by the permission engine for a tool call.
pub fn permission_scope(kind: PermissionKind, args: &JsonValue) -> Option<String> {
    match kind {
        PermissionKind::Bash => extract_command(args),
        PermissionKind::Webfetch => args.get("url").and_then(|v| v.as_str()).map(str::to_string),
        PermissionKind::Websearch | PermissionKind::Codesearch => args
            .get("query")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        PermissionKind::Glob | PermissionKind::Grep => args
            .get("pattern")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| extract_path(args)),
        k if k.is_path_scoped() => extract_path(args),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_def() -> ToolDef {
        ToolDef {
            name: "read".to_string(),
            description: "Read a file".to_string(),
            kind: PermissionKind::Read,
            params: vec![
                ToolParam::required_string("path", "File path"),
                ToolParam::optional("limit", ParamType::Integer, "Max lines", Some(json!(2000))),
            ],
            output_cap: 50_000,
            compaction_protected: false,
        }
    }

    #[test]
    fn test_validate_applies_defaults() {
        let def = sample_def();
        let validated = def.validate_args(&json!({ "path": "src/lib.rs" })).unwrap();
        assert_eq!(validated["path"], "src/lib.rs");
        assert_eq!(validated["limit"], 2000);
    }

    #[test]
    fn test_validate_rejects_unknown_keys() {
        let def = sample_def();
        let err = def
            .validate_args(&json!({ "path": "x", "surprise": true }))
            .unwrap_err();
        assert!(err.to_string().contains("unknown parameter"));
    }

    #[test]
    fn test_validate_rejects_missing_and_wrong_types() {
        let def = sample_def();
        assert!(def.validate_args(&json!({})).is_err());
        assert!(def.validate_args(&json!({ "path": 42 })).is_err());
        assert!(def.validate_args(&json!("not an object")).is_err());
        assert!(def
            .validate_args(&json!({ "path": "x", "limit": "many" }))
            .is_err());
    }

    #[test]
    fn test_schema_json_shape() {
        let def = sample_def();
        let schema = def.schema_json();
        assert_eq!(schema["name"], "read");
        assert_eq!(schema["input_schema"]["required"][0], "path");
        assert_eq!(
            schema["input_schema"]["properties"]["limit"]["type"],
            "integer"
        );
    }

    #[test]
    fn test_builtin_registry_is_complete() {
        let registry = ToolRegistry::builtin();
        let names = registry.names();
        for name in [
            "read", "write", "edit", "bash", "glob", "grep", "list", "webfetch", "todoread",
            "todowrite", "question",
        ] {
            assert!(names.contains(&name.to_string()), "missing tool {name}");
        }
    }

    #[test]
    fn test_permission_scope_extraction() {
        assert_eq!(
            permission_scope(PermissionKind::Bash, &json!({ "command": "git status" })),
            Some("git status".to_string())
        );
        assert_eq!(
            permission_scope(PermissionKind::Read, &json!({ "path": ".env" })),
            Some(".env".to_string())
        );
        assert_eq!(
            permission_scope(PermissionKind::Webfetch, &json!({ "url": "https://x.dev" })),
            Some("https://x.dev".to_string())
        );
        assert_eq!(permission_scope(PermissionKind::Question, &json!({})), None);
    }
}
