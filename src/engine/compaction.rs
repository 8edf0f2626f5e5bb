use anyhow::Result;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::prompt::{message_tokens, pruned_seq_set};
use super::types::Engine;
use crate::provider::{ChatMessage, ProviderRequest};
use crate::session::{estimate_tokens, Message, MessageMode, MessagePart, Role, Session};

/// Compaction never prunes less than this many tokens once it runs.
pub const MIN_PRUNE_TOKENS: u64 = 20_000;

pub(crate) struct CompactionPlan {
    pub pruned_seqs: Vec<u64>,
    pub pruned_tokens: u64,
    /// Rendered pruned span fed to the summarizer.
    pub seed: String,
}

impl Engine {
    /// Select what to prune for a given token excess. Protected and never
    /// selected: non-normal messages, the most recent token window, the
    /// latest tool exchange (pending call and its result), and results of
    /// compaction-protected tools. Among the rest, completed tool
    /// exchanges go first, then the oldest messages in creation order.
    pub(crate) fn plan_compaction(&self, messages: &[Message], excess: u64) -> Option<CompactionPlan> {
        let target = MIN_PRUNE_TOKENS.max(excess);
        let already_pruned = pruned_seq_set(messages);
        let live: Vec<&Message> = messages
            .iter()
            .filter(|m| !already_pruned.contains(&m.seq))
            .collect();

        let mut protected: HashSet<u64> = HashSet::new();
        // Recent window, newest first.
        let mut window = 0u64;
        for message in live.iter().rev() {
            protected.insert(message.seq);
            window += message_tokens(message);
            if window >= self.cfg.protected_recent_tokens {
                break;
            }
        }
        // Latest tool exchange stays with the turn.
        if let Some(last_call) = live
            .iter()
            .rev()
            .find(|m| m.parts.iter().any(|p| matches!(p, MessagePart::ToolCall { .. })))
        {
            protected.insert(last_call.seq);
        }
        for message in &live {
            let skill_protected = message.parts.iter().any(|p| match p {
                MessagePart::ToolCall { tool, .. } | MessagePart::ToolResult { tool, .. } => {
                    self.tools.is_compaction_protected(tool)
                }
                _ => false,
            });
            if skill_protected || message.mode != MessageMode::Normal {
                protected.insert(message.seq);
            }
        }

        let is_tool_exchange = |m: &Message| {
            m.parts
                .iter()
                .any(|p| matches!(p, MessagePart::ToolCall { .. } | MessagePart::ToolResult { .. }))
        };
        let mut pruned_seqs = Vec::new();
        let mut pruned_tokens = 0u64;
        let mut seed = String::new();
        let mut take = |m: &Message, pruned_seqs: &mut Vec<u64>, pruned_tokens: &mut u64, seed: &mut String| {
            pruned_seqs.push(m.seq);
            *pruned_tokens += message_tokens(m);
            seed.push_str(&format!("[{:?} {}] {}\n", m.role, m.seq, m.text()));
            for part in &m.parts {
                if let MessagePart::ToolResult { tool, output, .. } = part {
                    seed.push_str(&format!("  {tool} -> {}\n", crate::util::truncate_chars(output, 200)));
                }
            }
        };

        // Oldest completed tool exchanges first.
        for message in &live {
            if pruned_tokens >= target {
                break;
            }
            if protected.contains(&message.seq) || !is_tool_exchange(message) {
                continue;
            }
            take(message, &mut pruned_seqs, &mut pruned_tokens, &mut seed);
        }
        // Then the oldest remaining messages in creation order.
        for message in &live {
            if pruned_tokens >= target {
                break;
            }
            if protected.contains(&message.seq) || pruned_seqs.contains(&message.seq) {
                continue;
            }
            take(message, &mut pruned_seqs, &mut pruned_tokens, &mut seed);
        }

        if pruned_seqs.is_empty() {
            return None;
        }
        pruned_seqs.sort_unstable();
        Some(CompactionPlan {
            pruned_seqs,
            pruned_tokens,
            seed,
        })
    }

    /// Run one compaction cycle: summarize the pruned span with the hidden
    /// compaction agent, then splice a compaction message and a continue
    /// message into the session. The caller re-enters streaming after.
    pub(crate) async fn run_compaction(
        &self,
        session: &mut Session,
        excess: u64,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let messages = self.sessions.messages(&session.id)?;
        let Some(plan) = self.plan_compaction(&messages, excess) else {
            return Ok(false);
        };
        info!(
            "Compacting session {}: pruning {} messages ({} tokens)",
            session.id,
            plan.pruned_seqs.len(),
            plan.pruned_tokens
        );

        let summary = self.summarize_span(&plan, cancel).await;

        let mut compaction = Message::new(
            &session.id,
            Role::User,
            MessageMode::Compaction,
            vec![MessagePart::Text {
                tokens: estimate_tokens(&summary),
                text: summary,
            }],
        );
        compaction.pruned_seqs = plan.pruned_seqs;
        self.sessions.append_message(session, compaction)?;

        let continue_text =
            "Continue from the summary above; earlier messages were compacted away.";
        let continue_message = Message::new(
            &session.id,
            Role::User,
            MessageMode::Continue,
            vec![MessagePart::Text {
                text: continue_text.to_string(),
                tokens: estimate_tokens(continue_text),
            }],
        );
        self.sessions.append_message(session, continue_message)?;
        Ok(true)
    }

    /// Dedicated summarization request (mode = compaction). Provider
    /// failure degrades to a mechanical summary rather than failing the
    /// outer turn.
    async fn summarize_span(&self, plan: &CompactionPlan, cancel: &CancellationToken) -> String {
        let agent = match self.registry.get("compaction") {
            Some(agent) => agent,
            None => return mechanical_summary(plan),
        };
        let request = ProviderRequest {
            model: agent.model.clone().unwrap_or_else(|| self.cfg.model.clone()),
            system: agent
                .prompt
                .clone()
                .unwrap_or_else(|| "Summarize the conversation span below.".to_string()),
            messages: vec![ChatMessage::new(
                "user",
                format!(
                    "Summarize this span. Keep decisions, file paths, and open questions.\n\n{}",
                    plan.seed
                ),
            )],
            tools: Vec::new(),
            temperature: agent.temperature,
            top_p: agent.top_p,
        };
        match self.collect_stream(request, cancel).await {
            Ok(reply) => {
                let text: String = reply
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        MessagePart::Text { text, .. } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                if text.trim().is_empty() {
                    mechanical_summary(plan)
                } else {
                    text
                }
            }
            Err(failure) => {
                tracing::warn!("compaction summarizer failed: {}", failure.error);
                mechanical_summary(plan)
            }
        }
    }
}

fn mechanical_summary(plan: &CompactionPlan) -> String {
    format!(
        "Earlier context was compacted ({} tokens pruned). Span digest:\n{}",
        plan.pruned_tokens,
        crate::util::truncate_chars(&plan.seed, 2000)
    )
}
