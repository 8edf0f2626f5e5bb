use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use grep_regex::RegexMatcher;
use grep_searcher::sinks::UTF8;
use grep_searcher::Searcher;
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use super::{ExecContext, ParamType, ToolDef, ToolExecutor, ToolOutput, ToolParam};
use crate::permission::PermissionKind;

const MATCH_CAP: usize = 200;

/// Regex content search across the worktree, gitignore-aware.
pub struct GrepTool {
    def: ToolDef,
}

impl GrepTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "grep".to_string(),
                description: "Search file contents with a regex".to_string(),
                kind: PermissionKind::Grep,
                params: vec![
                    ToolParam::required_string("pattern", "Regex to search for"),
                    ToolParam::optional(
                        "path",
                        ParamType::String,
                        "Directory to search, relative to the worktree",
                        Some(json!(".")),
                    ),
                ],
                output_cap: 30_000,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for GrepTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn execute(
        &self,
        args: JsonValue,
        ctx: ExecContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ToolOutput>> {
        async move {
            let pattern = args["pattern"].as_str().unwrap_or_default().to_string();
            let subdir = args.get("path").and_then(|v| v.as_str()).unwrap_or(".").to_string();
            let matcher = match RegexMatcher::new(&pattern) {
                Ok(m) => m,
                Err(e) => return Ok(ToolOutput::error(format!("invalid regex: {e}"))),
            };
            let root = ctx.worktree.join(&subdir);
            let worktree = ctx.worktree.clone();

            let matches = tokio::task::spawn_blocking(move || {
                let mut out: Vec<String> = Vec::new();
                let mut searcher = Searcher::new();
                for entry in ignore::WalkBuilder::new(&root).build().flatten() {
                    if cancel.is_cancelled() || out.len() >= MATCH_CAP {
                        break;
                    }
                    if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                        continue;
                    }
                    let path = entry.path().to_path_buf();
                    let rel_path = path
                        .strip_prefix(&worktree)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .to_string();
                    let sink_display = rel_path.clone();
                    let result = searcher.search_path(
                        &matcher,
                        &path,
                        UTF8(|line_number, line| {
                            out.push(format!(
                                "{}:{}:{}",
                                sink_display,
                                line_number,
                                line.trim_end()
                            ));
                            Ok(out.len() < MATCH_CAP)
                        }),
                    );
                    if let Err(e) = result {
                        tracing::debug!("grep skipped {}: {}", rel_path, e);
                    }
                }
                out
            })
            .await?;

            if matches.is_empty() {
                return Ok(ToolOutput::text("(no matches)"));
            }
            Ok(ToolOutput::text(matches.join("\n")))
        }
        .boxed()
    }
}
