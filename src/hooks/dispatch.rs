use regex::Regex;
use tracing::{info, warn};

use super::{HookAction, HookEvent, HookPipeline};

/// Everything a hook can look at for one tool event.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookInput<'a> {
    pub tool: &'a str,
    /// Target path extracted from the tool input, when the tool has one.
    pub file_path: Option<&'a str>,
    /// Command string for shell-class tools.
    pub command: Option<&'a str>,
    /// Scanned text: the tool input on PreToolUse, the output on PostToolUse.
    pub text: &'a str,
}

/// The only shape the runtime consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookOutcome {
    pub blocked: bool,
    pub hook_name: Option<String>,
    pub message: Option<String>,
}

impl HookOutcome {
    fn pass() -> Self {
        Self::default()
    }

    fn block(hook_name: &str, message: String) -> Self {
        Self {
            blocked: true,
            hook_name: Some(hook_name.to_string()),
            message: Some(message),
        }
    }
}

impl HookPipeline {
    /// Walk matching hooks and their actions in declared order.
    /// The first blocking action wins; remaining hooks are not evaluated.
    /// Action runtime errors never block (logged instead).
    pub fn evaluate(&self, event: HookEvent, input: &HookInput<'_>) -> HookOutcome {
        self.with_hooks(|hooks| {
            for hook in hooks {
                if hook.event != event {
                    continue;
                }
                if !hook.tool_pattern.is_match(input.tool) {
                    continue;
                }
                if let Some(file_re) = &hook.file_pattern {
                    match input.file_path {
                        Some(path) if file_re.is_match(path) => {}
                        _ => continue,
                    }
                }
                for action in &hook.actions {
                    if let Some(outcome) = evaluate_action(&hook.name, action, input) {
                        return outcome;
                    }
                }
            }
            HookOutcome::pass()
        })
    }
}

/// Returns `Some` only for a blocking result; non-blocking actions fall
/// through to the next action.
fn evaluate_action(
    hook_name: &str,
    action: &HookAction,
    input: &HookInput<'_>,
) -> Option<HookOutcome> {
    match action {
        HookAction::Scan {
            patterns,
            message,
            block,
        } => {
            for pattern in patterns {
                let re = match Regex::new(pattern) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Hook '{}' scan pattern error: {}", hook_name, e);
                        continue;
                    }
                };
                if let Some(found) = re.find(input.text) {
                    let rendered = message
                        .clone()
                        .unwrap_or_else(|| "Sensitive pattern detected: {match}".to_string())
                        .replace("{match}", found.as_str());
                    if *block {
                        return Some(HookOutcome::block(hook_name, rendered));
                    }
                    info!("Hook '{}' matched (non-blocking): {}", hook_name, rendered);
                }
            }
            None
        }
        HookAction::NotifyOnly { message } => {
            info!(
                "Hook '{}' notification: {}",
                hook_name,
                message.as_deref().unwrap_or("(no message)")
            );
            None
        }
        HookAction::CheckEnv {
            variable,
            command_pattern,
            message,
        } => {
            if std::env::var_os(variable).is_some() {
                return None;
            }
            let command_matches = match (command_pattern, input.command) {
                (Some(pattern), Some(command)) => match Regex::new(pattern) {
                    Ok(re) => re.is_match(command),
                    Err(e) => {
                        warn!("Hook '{}' command pattern error: {}", hook_name, e);
                        false
                    }
                },
                (Some(_), None) => false,
                (None, _) => true,
            };
            if command_matches {
                let rendered = message
                    .clone()
                    .unwrap_or_else(|| format!("required environment variable {variable} is unset"));
                return Some(HookOutcome::block(hook_name, rendered));
            }
            None
        }
    }
}
