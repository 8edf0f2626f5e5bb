use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value as JsonValue};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::{ExecContext, ParamType, ToolDef, ToolExecutor, ToolOutput, ToolParam};
use crate::permission::PermissionKind;

const DEFAULT_TIMEOUT_SECS: i64 = 120;
const OUTPUT_CAP: usize = 30_000;

/// Shell command execution in the worktree. The child is killed on
/// cancellation or timeout; non-zero exit is a tool error, not a crash.
pub struct BashTool {
    def: ToolDef,
}

impl BashTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "bash".to_string(),
                description: "Run a shell command in the worktree".to_string(),
                kind: PermissionKind::Bash,
                params: vec![
                    ToolParam::required_string("command", "Command to execute"),
                    ToolParam::optional(
                        "timeout_secs",
                        ParamType::Integer,
                        "Executor timeout in seconds",
                        Some(json!(DEFAULT_TIMEOUT_SECS)),
                    ),
                ],
                output_cap: OUTPUT_CAP,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for BashTool {
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
            let command = args["command"].as_str().unwrap_or_default().to_string();
            let timeout_secs = args
                .get("timeout_secs")
                .and_then(|v| v.as_i64())
                .unwrap_or(DEFAULT_TIMEOUT_SECS)
                .max(1) as u64;

            let mut child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .current_dir(&ctx.worktree)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            let mut stdout = child.stdout.take().expect("piped stdout");
            let mut stderr = child.stderr.take().expect("piped stderr");
            let drain = tokio::spawn(async move {
                let mut out = String::new();
                let mut err = String::new();
                let _ = stdout.read_to_string(&mut out).await;
                let _ = stderr.read_to_string(&mut err).await;
                (out, err)
            });

            enum WaitOutcome {
                Finished(std::process::ExitStatus),
                Cancelled,
                TimedOut,
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => WaitOutcome::Cancelled,
                _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => WaitOutcome::TimedOut,
                status = child.wait() => WaitOutcome::Finished(status?),
            };
            match outcome {
                WaitOutcome::Cancelled => {
                    let _ = child.kill().await;
                    drain.abort();
                    anyhow::bail!("Aborted");
                }
                WaitOutcome::TimedOut => {
                    let _ = child.kill().await;
                    drain.abort();
                    Ok(ToolOutput::error(format!(
                        "command timed out after {timeout_secs}s: {command}"
                    )))
                }
                WaitOutcome::Finished(status) => {
                    let (out, err) = drain.await.unwrap_or_default();
                    let mut content = out;
                    if !err.is_empty() {
                        if !content.is_empty() {
                            content.push('\n');
                        }
                        content.push_str(&err);
                    }
                    if status.success() {
                        Ok(ToolOutput::text(content))
                    } else {
                        let code = status.code().unwrap_or(-1);
                        Ok(ToolOutput::error(format!("exit {code}\n{content}")))
                    }
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (tempfile::TempDir, ExecContext) {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExecContext {
            worktree: tmp.path().to_path_buf(),
        };
        (tmp, ctx)
    }

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let (_tmp, ctx) = ctx();
        let bash = BashTool::new();
        let out = bash
            .execute(
                json!({ "command": "echo hello" }),
                ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_error() {
        let (_tmp, ctx) = ctx();
        let bash = BashTool::new();
        let out = bash
            .execute(
                json!({ "command": "echo oops >&2; exit 3" }),
                ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("exit 3"));
        assert!(out.content.contains("oops"));
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let (_tmp, ctx) = ctx();
        let bash = BashTool::new();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel2.cancel();
        });
        let err = bash
            .execute(json!({ "command": "sleep 30" }), ctx, cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Aborted"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (_tmp, ctx) = ctx();
        let bash = BashTool::new();
        let out = bash
            .execute(
                json!({ "command": "sleep 30", "timeout_secs": 1 }),
                ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("timed out"));
    }
}
