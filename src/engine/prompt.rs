use std::collections::HashSet;

use super::types::Engine;
use crate::agents::AgentInfo;
use crate::memory::context::{formatted_within, ContextOptions};
use crate::provider::{ChatMessage, ProviderRequest};
use crate::session::{estimate_tokens, Message, MessageMode, MessagePart, Role};

impl Engine {
    /// Compose the provider request for a turn: system headers, the agent's
    /// prompt, the memory-context addition under its token budget, then the
    /// session history with compacted spans replaced by their summaries.
    pub(crate) fn compose(
        &self,
        agent: &AgentInfo,
        messages: &[Message],
        task: Option<&str>,
    ) -> ProviderRequest {
        let mut system = String::from("You are CodeCoder, a coding assistant operating on a local project.\n");
        match &agent.prompt {
            Some(prompt) => system.push_str(prompt),
            None => system.push_str(&default_prompt(&agent.name)),
        }
        let context = self.memory.context.build(&ContextOptions {
            task: task.map(str::to_string),
            ..Default::default()
        });
        let addition = formatted_within(&context, self.cfg.context_budget);
        if !addition.is_empty() {
            system.push_str("\n\n");
            system.push_str(&addition);
        }

        ProviderRequest {
            model: agent.model.clone().unwrap_or_else(|| self.cfg.model.clone()),
            system,
            messages: render_transcript(messages),
            tools: self.tools.schemas(),
            temperature: agent.temperature,
            top_p: agent.top_p,
        }
    }

    /// Estimated tokens the next request will carry.
    pub(crate) fn projected_tokens(&self, messages: &[Message]) -> u64 {
        let pruned = pruned_seq_set(messages);
        messages
            .iter()
            .filter(|m| !pruned.contains(&m.seq))
            .map(message_tokens)
            .sum()
    }
}

pub(crate) fn default_prompt(agent_name: &str) -> String {
    match agent_name {
        "plan" => "Survey the project and produce a concrete plan before any edit. \
                   Write plans as markdown files; do not modify source files."
            .to_string(),
        "explore" => "Answer questions about the codebase quickly; read, never write.".to_string(),
        "code-reviewer" => "Review the presented changes for correctness and style.".to_string(),
        "compaction" => "Summarize the conversation span you are given, preserving decisions, \
                         file paths, and unresolved questions."
            .to_string(),
        "title" => "Produce a short title (max 8 words) for this conversation.".to_string(),
        "summary" => "Summarize this conversation in a few sentences.".to_string(),
        _ => "Work on the user's task using the available tools. Prefer small, verifiable steps."
            .to_string(),
    }
}

pub(crate) fn message_tokens(message: &Message) -> u64 {
    if message.tokens > 0 {
        return message.tokens;
    }
    message
        .parts
        .iter()
        .map(|p| match p {
            MessagePart::Text { text, .. } | MessagePart::Reasoning { text, .. } => {
                estimate_tokens(text)
            }
            MessagePart::ToolCall { input, .. } => estimate_tokens(&input.to_string()),
            MessagePart::ToolResult { output, .. } => estimate_tokens(output),
        })
        .sum()
}

/// Seqs removed from the live transcript by prior compactions.
pub(crate) fn pruned_seq_set(messages: &[Message]) -> HashSet<u64> {
    messages
        .iter()
        .filter(|m| m.mode == MessageMode::Compaction)
        .flat_map(|m| m.pruned_seqs.iter().copied())
        .collect()
}

/// Map stored messages to provider chat messages, in order. Tool calls and
/// results are rendered as tagged text; the provider-neutral transport does
/// not carry structured tool blocks.
pub(crate) fn render_transcript(messages: &[Message]) -> Vec<ChatMessage> {
    let pruned = pruned_seq_set(messages);
    let mut out = Vec::new();
    for message in messages {
        if pruned.contains(&message.seq) {
            continue;
        }
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = match message.mode {
            MessageMode::Compaction => {
                format!("[Conversation summary]\n{}", message.text())
            }
            MessageMode::Continue | MessageMode::Normal => render_parts(&message.parts),
        };
        if content.is_empty() {
            continue;
        }
        out.push(ChatMessage::new(role, content));
    }
    out
}

fn render_parts(parts: &[MessagePart]) -> String {
    let mut out = String::new();
    for part in parts {
        match part {
            MessagePart::Text { text, .. } => {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
            // Reasoning stays internal; it is not replayed to the provider.
            MessagePart::Reasoning { .. } => {}
            MessagePart::ToolCall { call_id, tool, input, .. } => {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&format!("<tool_call id=\"{call_id}\" tool=\"{tool}\">{input}</tool_call>"));
            }
            MessagePart::ToolResult { call_id, output, is_error, .. } => {
                if !out.is_empty() {
                    out.push('\n');
                }
                let tag = if *is_error { " error=\"true\"" } else { "" };
                out.push_str(&format!("<tool_result id=\"{call_id}\"{tag}>{output}</tool_result>"));
            }
        }
    }
    out
}
