use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use super::{ExecContext, ParamType, ToolDef, ToolExecutor, ToolOutput, ToolParam};
use crate::permission::PermissionKind;

// ---------------------------------------------------------------------------
// Todo list, persisted per project under .ccode/todos.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TodoItem {
    text: String,
    done: bool,
}

fn todos_path(ctx: &ExecContext) -> std::path::PathBuf {
    crate::paths::project_dir(&ctx.worktree).join("todos.json")
}

fn load_todos(ctx: &ExecContext) -> Vec<TodoItem> {
    std::fs::read_to_string(todos_path(ctx))
        .ok()
        .and_then(|c| serde_json::from_str(&c).ok())
        .unwrap_or_default()
}

fn save_todos(ctx: &ExecContext, todos: &[TodoItem]) -> Result<()> {
    let path = todos_path(ctx);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(todos)?)?;
    Ok(())
}

fn render_todos(todos: &[TodoItem]) -> String {
    if todos.is_empty() {
        return "(no todos)".to_string();
    }
    todos
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{}. [{}] {}", i + 1, if t.done { "x" } else { " " }, t.text))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct TodoReadTool {
    def: ToolDef,
}

impl TodoReadTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "todoread".to_string(),
                description: "Read the current todo list".to_string(),
                kind: PermissionKind::Todoread,
                params: vec![],
                output_cap: 10_000,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for TodoReadTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn execute(
        &self,
        _args: JsonValue,
        ctx: ExecContext,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ToolOutput>> {
        async move { Ok(ToolOutput::text(render_todos(&load_todos(&ctx)))) }.boxed()
    }
}

pub struct TodoWriteTool {
    def: ToolDef,
}

impl TodoWriteTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "todowrite".to_string(),
                description: "Add a todo, or mark one done by 1-based index".to_string(),
                kind: PermissionKind::Todowrite,
                params: vec![
                    ToolParam::optional("add", ParamType::String, "Todo text to add", None),
                    ToolParam::optional(
                        "complete",
                        ParamType::Integer,
                        "1-based index to mark done",
                        None,
                    ),
                ],
                output_cap: 10_000,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for TodoWriteTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn execute(
        &self,
        args: JsonValue,
        ctx: ExecContext,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ToolOutput>> {
        async move {
            let mut todos = load_todos(&ctx);
            if let Some(text) = args.get("add").and_then(|v| v.as_str()) {
                todos.push(TodoItem {
                    text: text.to_string(),
                    done: false,
                });
            }
            if let Some(index) = args.get("complete").and_then(|v| v.as_i64()) {
                let idx = index as usize;
                if idx == 0 || idx > todos.len() {
                    return Ok(ToolOutput::error(format!("no todo at index {index}")));
                }
                todos[idx - 1].done = true;
            }
            save_todos(&ctx, &todos)?;
            Ok(ToolOutput::text(render_todos(&todos)))
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// question
// ---------------------------------------------------------------------------

/// Questions surface through the permission ask channel in interactive
/// frontends; the core tool just echoes what was asked so the transcript
/// records it.
pub struct QuestionTool {
    def: ToolDef,
}

impl QuestionTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "question".to_string(),
                description: "Ask the user a clarifying question".to_string(),
                kind: PermissionKind::Question,
                params: vec![ToolParam::required_string("question", "Question for the user")],
                output_cap: 4_000,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for QuestionTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn execute(
        &self,
        args: JsonValue,
        _ctx: ExecContext,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ToolOutput>> {
        async move {
            let question = args["question"].as_str().unwrap_or_default().to_string();
            Ok(ToolOutput::text(format!("Asked the user: {question}")))
        }
        .boxed()
    }
}
