use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use globset::Glob;
use serde_json::{json, Value as JsonValue};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::{ExecContext, ParamType, ToolDef, ToolExecutor, ToolOutput, ToolParam};
use crate::memory::history::{EditedFile, FileOp};
use crate::permission::PermissionKind;

const READ_CAP: usize = 50_000;
const DEFAULT_READ_LIMIT: i64 = 2000;

/// Resolve a tool path argument against the worktree.
fn resolve(worktree: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        worktree.join(p)
    }
}

fn line_count(text: &str) -> usize {
    text.lines().count()
}

// ---------------------------------------------------------------------------
// read
// ---------------------------------------------------------------------------

pub struct ReadTool {
    def: ToolDef,
}

impl ReadTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "read".to_string(),
                description: "Read a file from the project, with optional offset and limit"
                    .to_string(),
                kind: PermissionKind::Read,
                params: vec![
                    ToolParam::required_string("path", "File path, relative to the worktree"),
                    ToolParam::optional("offset", ParamType::Integer, "First line (1-based)", None),
                    ToolParam::optional(
                        "limit",
                        ParamType::Integer,
                        "Maximum lines to return",
                        Some(json!(DEFAULT_READ_LIMIT)),
                    ),
                ],
                output_cap: READ_CAP,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for ReadTool {
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
            let path = args["path"].as_str().unwrap_or_default().to_string();
            let full = resolve(&ctx.worktree, &path);
            let content = match tokio::fs::read_to_string(&full).await {
                Ok(c) => c,
                Err(e) => return Ok(ToolOutput::error(format!("cannot read {path}: {e}"))),
            };
            let offset = args.get("offset").and_then(|v| v.as_i64()).unwrap_or(1).max(1) as usize;
            let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(DEFAULT_READ_LIMIT)
                as usize;
            let lines: Vec<&str> = content.lines().collect();
            let total = lines.len();
            let slice: Vec<String> = lines
                .iter()
                .enumerate()
                .skip(offset - 1)
                .take(limit)
                .map(|(i, line)| format!("{:>6}\t{}", i + 1, line))
                .collect();
            let mut out = slice.join("\n");
            if offset - 1 + limit < total {
                out.push_str(&format!("\n... ({total} lines total)"));
            }
            Ok(ToolOutput::text(out))
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// write
// ---------------------------------------------------------------------------

pub struct WriteTool {
    def: ToolDef,
}

impl WriteTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "write".to_string(),
                description: "Create or overwrite a file with the given content".to_string(),
                kind: PermissionKind::Edit,
                params: vec![
                    ToolParam::required_string("path", "File path, relative to the worktree"),
                    ToolParam::required_string("content", "Full file content"),
                ],
                output_cap: 4_000,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for WriteTool {
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
            if cancel.is_cancelled() {
                anyhow::bail!("Aborted");
            }
            let path = args["path"].as_str().unwrap_or_default().to_string();
            let content = args["content"].as_str().unwrap_or_default().to_string();
            let full = resolve(&ctx.worktree, &path);
            let existed = full.exists();
            let deletions = if existed {
                tokio::fs::read_to_string(&full)
                    .await
                    .map(|c| line_count(&c))
                    .unwrap_or(0)
            } else {
                0
            };
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, &content).await?;
            let op = if existed { FileOp::Update } else { FileOp::Create };
            let mut output = ToolOutput::text(format!(
                "Wrote {} ({} lines)",
                path,
                line_count(&content)
            ));
            output.edited_files.push(EditedFile {
                path,
                op,
                additions: line_count(&content),
                deletions,
                hash_before: None,
                hash_after: None,
            });
            Ok(output)
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// edit
// ---------------------------------------------------------------------------

pub struct EditTool {
    def: ToolDef,
}

impl EditTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "edit".to_string(),
                description: "Replace an exact string in a file".to_string(),
                kind: PermissionKind::Edit,
                params: vec![
                    ToolParam::required_string("path", "File path, relative to the worktree"),
                    ToolParam::required_string("old_string", "Exact text to replace"),
                    ToolParam::required_string("new_string", "Replacement text"),
                    ToolParam::optional(
                        "replace_all",
                        ParamType::Boolean,
                        "Replace every occurrence",
                        Some(json!(false)),
                    ),
                ],
                output_cap: 4_000,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for EditTool {
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
            if cancel.is_cancelled() {
                anyhow::bail!("Aborted");
            }
            let path = args["path"].as_str().unwrap_or_default().to_string();
            let old_string = args["old_string"].as_str().unwrap_or_default().to_string();
            let new_string = args["new_string"].as_str().unwrap_or_default().to_string();
            let replace_all = args.get("replace_all").and_then(|v| v.as_bool()).unwrap_or(false);

            let full = resolve(&ctx.worktree, &path);
            let content = match tokio::fs::read_to_string(&full).await {
                Ok(c) => c,
                Err(e) => return Ok(ToolOutput::error(format!("cannot read {path}: {e}"))),
            };
            let occurrences = content.matches(&old_string).count();
            if occurrences == 0 {
                return Ok(ToolOutput::error(format!(
                    "old_string not found in {path}"
                )));
            }
            if occurrences > 1 && !replace_all {
                return Ok(ToolOutput::error(format!(
                    "old_string matches {occurrences} times in {path}; pass replace_all or make it unique"
                )));
            }
            let updated = if replace_all {
                content.replace(&old_string, &new_string)
            } else {
                content.replacen(&old_string, &new_string, 1)
            };
            tokio::fs::write(&full, &updated).await?;

            let mut output = ToolOutput::text(format!(
                "Edited {path} ({occurrences} replacement{})",
                if occurrences == 1 { "" } else { "s" }
            ));
            output.edited_files.push(EditedFile {
                path,
                op: FileOp::Update,
                additions: line_count(&new_string) * occurrences,
                deletions: line_count(&old_string) * occurrences,
                hash_before: None,
                hash_after: None,
            });
            Ok(output)
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

pub struct ListTool {
    def: ToolDef,
}

impl ListTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "list".to_string(),
                description: "List directory entries".to_string(),
                kind: PermissionKind::List,
                params: vec![ToolParam::optional(
                    "path",
                    ParamType::String,
                    "Directory, relative to the worktree",
                    Some(json!(".")),
                )],
                output_cap: 20_000,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for ListTool {
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
            let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".").to_string();
            let full = resolve(&ctx.worktree, &path);
            let mut read_dir = match tokio::fs::read_dir(&full).await {
                Ok(rd) => rd,
                Err(e) => return Ok(ToolOutput::error(format!("cannot list {path}: {e}"))),
            };
            let mut entries = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                entries.push(if is_dir { format!("{name}/") } else { name });
            }
            entries.sort();
            Ok(ToolOutput::text(entries.join("\n")))
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// glob
// ---------------------------------------------------------------------------

const GLOB_RESULT_CAP: usize = 200;

pub struct GlobTool {
    def: ToolDef,
}

impl GlobTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "glob".to_string(),
                description: "Find files matching a glob pattern, gitignore-aware".to_string(),
                kind: PermissionKind::Glob,
                params: vec![ToolParam::required_string(
                    "pattern",
                    "Glob pattern, e.g. src/**/*.rs",
                )],
                output_cap: 20_000,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for GlobTool {
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
            let matcher = match Glob::new(&pattern) {
                Ok(glob) => glob.compile_matcher(),
                Err(e) => return Ok(ToolOutput::error(format!("invalid glob: {e}"))),
            };
            let worktree = ctx.worktree.clone();
            // Walks honor .gitignore the way the rest of the tooling does.
            let result = tokio::task::spawn_blocking(move || {
                let mut matches = Vec::new();
                for entry in ignore::WalkBuilder::new(&worktree).build().flatten() {
                    if cancel.is_cancelled() || matches.len() >= GLOB_RESULT_CAP {
                        break;
                    }
                    if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                        continue;
                    }
                    let relative = entry
                        .path()
                        .strip_prefix(&worktree)
                        .unwrap_or(entry.path());
                    if matcher.is_match(relative) {
                        matches.push(relative.to_string_lossy().to_string());
                    }
                }
                matches.sort();
                matches
            })
            .await?;
            if result.is_empty() {
                return Ok(ToolOutput::text("(no matches)"));
            }
            Ok(ToolOutput::text(result.join("\n")))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> (tempfile::TempDir, ExecContext) {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExecContext {
            worktree: tmp.path().to_path_buf(),
        };
        (tmp, ctx)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_tmp, ctx) = ctx();
        let write = WriteTool::new();
        let out = write
            .execute(
                json!({ "path": "src/lib.rs", "content": "fn a() {}\nfn b() {}\n" }),
                ctx.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.edited_files[0].op, FileOp::Create);
        assert_eq!(out.edited_files[0].additions, 2);

        let read = ReadTool::new();
        let out = read
            .execute(
                json!({ "path": "src/lib.rs" }),
                ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.content.contains("fn a() {}"));
        assert!(out.content.contains("     1\t"));
    }

    #[tokio::test]
    async fn test_read_missing_is_tool_error() {
        let (_tmp, ctx) = ctx();
        let read = ReadTool::new();
        let out = read
            .execute(json!({ "path": "nope.rs" }), ctx, CancellationToken::new())
            .await
            .unwrap();
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn test_edit_unique_and_ambiguous() {
        let (_tmp, ctx) = ctx();
        std::fs::write(ctx.worktree.join("a.txt"), "one two one").unwrap();
        let edit = EditTool::new();

        let ambiguous = edit
            .execute(
                json!({ "path": "a.txt", "old_string": "one", "new_string": "1" }),
                ctx.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(ambiguous.is_error);

        let all = edit
            .execute(
                json!({ "path": "a.txt", "old_string": "one", "new_string": "1", "replace_all": true }),
                ctx.clone(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!all.is_error);
        assert_eq!(
            std::fs::read_to_string(ctx.worktree.join("a.txt")).unwrap(),
            "1 two 1"
        );

        let missing = edit
            .execute(
                json!({ "path": "a.txt", "old_string": "ghost", "new_string": "x" }),
                ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(missing.is_error);
    }

    #[tokio::test]
    async fn test_list_and_glob() {
        let (_tmp, ctx) = ctx();
        std::fs::create_dir_all(ctx.worktree.join("src")).unwrap();
        std::fs::write(ctx.worktree.join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(ctx.worktree.join("README.md"), "# hi").unwrap();

        let list = ListTool::new();
        let out = list
            .execute(json!({}), ctx.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert!(out.content.contains("src/"));
        assert!(out.content.contains("README.md"));

        let glob = GlobTool::new();
        let out = glob
            .execute(
                json!({ "pattern": "**/*.rs" }),
                ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "src/main.rs");
    }

    #[tokio::test]
    async fn test_cancelled_write_aborts() {
        let (_tmp, ctx) = ctx();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let write = WriteTool::new();
        let err = write
            .execute(
                json!({ "path": "x.txt", "content": "data" }),
                ctx.clone(),
                cancel,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Aborted"));
        assert!(!ctx.worktree.join("x.txt").exists());
    }
}
