use serde_json::Value as JsonValue;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::tools::{extract_command, extract_path, permission_scope, ExecContext};
use super::types::Engine;
use crate::agents::AgentInfo;
use crate::bus::Event;
use crate::hooks::{HookEvent, HookInput};
use crate::memory::causal::{action_type_for_tool, OutcomeStatus};
use crate::permission::requests::{PermissionReply, PermissionRequest};
use crate::permission::{CompiledRule, PermissionAction, Ruleset, RuleSource};
use crate::session::MessagePart;
use crate::util;

const DENY_MESSAGE: &str = "Permission denied by policy";

/// Outcome of one dispatched tool call, folded into a ToolResult part.
pub(crate) struct DispatchOutcome {
    pub output: String,
    pub is_error: bool,
    /// The turn ends as aborted after this result is recorded.
    pub aborted: bool,
}

impl Engine {
    /// The seven-step dispatch: PreToolUse hooks → permission verdict →
    /// execution under the session's cancel token → output truncation →
    /// PostToolUse hooks → causal nodes → edit record.
    pub(crate) async fn dispatch_tool(
        &self,
        session_id: &str,
        agent: &AgentInfo,
        call_id: &str,
        tool_name: &str,
        raw_input: &JsonValue,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let Some(executor) = self.tools.get(tool_name) else {
            return DispatchOutcome {
                output: format!("unknown tool: {tool_name}"),
                is_error: true,
                aborted: false,
            };
        };
        let def = executor.def().clone();

        // Model-provided JSON is validated against the schema first; parse
        // failure is a tool error the model can react to.
        let args = match def.validate_args(raw_input) {
            Ok(args) => args,
            Err(e) => {
                return DispatchOutcome {
                    output: format!("invalid input: {e}"),
                    is_error: true,
                    aborted: false,
                }
            }
        };

        let file_path = extract_path(&args);
        let command = extract_command(&args);
        let pre_text = args.to_string();

        // 1. PreToolUse hooks; a block synthesizes an error result.
        let pre = self.hooks.evaluate(
            HookEvent::PreToolUse,
            &HookInput {
                tool: tool_name,
                file_path: file_path.as_deref(),
                command: command.as_deref(),
                text: &pre_text,
            },
        );
        if pre.blocked {
            info!("Hook {:?} blocked {}", pre.hook_name, tool_name);
            return DispatchOutcome {
                output: pre.message.unwrap_or_else(|| "blocked by hook".to_string()),
                is_error: true,
                aborted: false,
            };
        }

        // 2. Permission verdict; `ask` suspends the turn until replied.
        let ruleset = self.effective_ruleset(session_id, agent);
        let scope = permission_scope(def.kind, &args);
        let verdict = match &scope {
            Some(value) if def.kind.is_path_scoped() => {
                ruleset.decide_path(def.kind, value, &self.cfg.worktree)
            }
            other => ruleset.decide(def.kind, other.as_deref()),
        };
        match verdict {
            PermissionAction::Allow => {}
            PermissionAction::Deny => {
                return DispatchOutcome {
                    output: DENY_MESSAGE.to_string(),
                    is_error: true,
                    aborted: false,
                }
            }
            PermissionAction::Ask => {
                let request =
                    PermissionRequest::new(session_id, message_id, tool_name, def.kind, args.clone());
                let patterns = request.patterns.clone();
                let rx = match self.asks.submit(request).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        return DispatchOutcome {
                            output: format!("permission request failed: {e}"),
                            is_error: true,
                            aborted: false,
                        }
                    }
                };
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => {
                        return DispatchOutcome {
                            output: "Aborted".to_string(),
                            is_error: true,
                            aborted: true,
                        }
                    }
                    reply = rx => reply,
                };
                match outcome {
                    Ok(reply) => match reply.reply {
                        PermissionReply::AllowOnce => {}
                        PermissionReply::AllowAlways => {
                            self.append_session_rules(session_id, &ruleset, def.kind, &patterns);
                        }
                        PermissionReply::Deny => {
                            return DispatchOutcome {
                                output: reply
                                    .message
                                    .unwrap_or_else(|| DENY_MESSAGE.to_string()),
                                is_error: true,
                                aborted: false,
                            }
                        }
                    },
                    // Closed reply channel (session cleanup) reads as deny.
                    Err(_) => {
                        return DispatchOutcome {
                            output: DENY_MESSAGE.to_string(),
                            is_error: true,
                            aborted: false,
                        }
                    }
                }
            }
        }

        // 3. Execute with the session's cancellation signal.
        self.bus.publish(Event::ToolExecutionStarted {
            session_id: session_id.to_string(),
            call_id: call_id.to_string(),
            tool: tool_name.to_string(),
        });
        let started = Instant::now();
        let exec_result = executor
            .execute(
                args.clone(),
                ExecContext {
                    worktree: self.cfg.worktree.clone(),
                },
                cancel.clone(),
            )
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (mut output, aborted) = match exec_result {
            Ok(output) => (output, false),
            Err(e) if e.to_string().contains("Aborted") => (
                super::tools::ToolOutput::error("Aborted"),
                true,
            ),
            Err(e) => (super::tools::ToolOutput::error(e.to_string()), false),
        };

        // 4. Truncate oversized output into the reserved directory.
        if output.content.chars().count() > def.output_cap {
            output.content = self.truncate_output(tool_name, &output.content, def.output_cap);
        }

        // 5. PostToolUse hooks; a block replaces the result body.
        if !aborted {
            let post = self.hooks.evaluate(
                HookEvent::PostToolUse,
                &HookInput {
                    tool: tool_name,
                    file_path: file_path.as_deref(),
                    command: command.as_deref(),
                    text: &output.content,
                },
            );
            if post.blocked {
                output.content = post
                    .message
                    .unwrap_or_else(|| "blocked by hook".to_string());
                output.is_error = true;
                output.edited_files.clear();
            }
        }

        self.bus.publish(Event::ToolExecutionCompleted {
            session_id: session_id.to_string(),
            call_id: call_id.to_string(),
            tool: tool_name.to_string(),
            duration_ms,
            ok: !output.is_error,
        });

        // 6. Causal action + outcome under the session's active decision.
        if let Some(decision_id) = self.memory.causal.active_decision(session_id) {
            let description = describe_call(tool_name, &args);
            let action = self
                .memory
                .causal
                .record_action(
                    &decision_id,
                    action_type_for_tool(tool_name),
                    &description,
                    args.clone(),
                    serde_json::json!({ "error": output.is_error }),
                    duration_ms,
                )
                .await;
            match action {
                Ok(action) => {
                    let status = if output.is_error {
                        OutcomeStatus::Failure
                    } else {
                        OutcomeStatus::Success
                    };
                    if let Err(e) = self
                        .memory
                        .causal
                        .record_outcome(
                            &action.id,
                            status,
                            &util::truncate_chars(&output.content, 120),
                            serde_json::json!({ "duration_ms": duration_ms }),
                            None,
                        )
                        .await
                    {
                        warn!("causal outcome not recorded: {e}");
                    }
                }
                Err(e) => warn!("causal action not recorded: {e}"),
            }
        }

        // 7. Edit record for successful write-class calls. An aborted tool
        // never reaches here with edited files.
        if !output.is_error && !output.edited_files.is_empty() {
            if let Err(e) = self.memory.edits.append(
                session_id,
                output.edited_files.clone(),
                &agent.name,
                &self.cfg.model,
                0,
                duration_ms,
            ) {
                warn!("edit record not written: {e}");
            }
        }

        DispatchOutcome {
            output: output.content,
            is_error: output.is_error,
            aborted,
        }
    }

    /// Session layer over the agent's compiled ruleset; `allow_always`
    /// swaps in a new snapshot (readers keep theirs).
    pub(crate) fn effective_ruleset(
        &self,
        session_id: &str,
        agent: &AgentInfo,
    ) -> std::sync::Arc<Ruleset> {
        self.session_rules
            .read()
            .expect("session rules lock")
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| std::sync::Arc::new(agent.permission.clone()))
    }

    fn append_session_rules(
        &self,
        session_id: &str,
        current: &Ruleset,
        kind: crate::permission::PermissionKind,
        patterns: &[String],
    ) {
        let mut next = current.clone();
        for pattern in patterns {
            next = next.with_rule(CompiledRule::new(
                kind,
                pattern,
                PermissionAction::Allow,
                RuleSource::Session,
            ));
        }
        self.session_rules
            .write()
            .expect("session rules lock")
            .insert(session_id.to_string(), std::sync::Arc::new(next));
    }

    /// Write the full output to the reserved truncation directory and
    /// return the capped content with a pointer to the overflow file.
    fn truncate_output(&self, tool: &str, content: &str, cap: usize) -> String {
        let dir = crate::paths::truncation_dir(&self.cfg.worktree);
        let file = dir.join(format!("{tool}-{}.txt", util::now_ts_millis()));
        let pointer = match std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::write(&file, content))
        {
            Ok(()) => format!("full output: {}", file.display()),
            Err(e) => {
                warn!("overflow file not written: {e}");
                "full output unavailable".to_string()
            }
        };
        format!(
            "{}\n... (output truncated; {pointer})",
            util::truncate_chars(content, cap)
        )
    }
}

/// Short human description of a call: last two path segments, truncated
/// command, or the tool name.
pub(crate) fn describe_call(tool: &str, args: &JsonValue) -> String {
    if let Some(path) = extract_path(args) {
        return format!("{tool} {}", util::short_path(&path));
    }
    if let Some(command) = extract_command(args) {
        return format!("{tool} {}", util::truncate_chars(&command, 60));
    }
    tool.to_string()
}

/// Build the ToolResult part for a dispatch outcome.
pub(crate) fn tool_result_part(call_id: &str, tool: &str, outcome: &DispatchOutcome) -> MessagePart {
    MessagePart::ToolResult {
        call_id: call_id.to_string(),
        tool: tool.to_string(),
        output: outcome.output.clone(),
        is_error: outcome.is_error,
        tokens: crate::session::estimate_tokens(&outcome.output),
    }
}
