use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::types::{Engine, EngineError};
use crate::provider::{ChatMessage, ProviderRequest};
use crate::session::{MessagePart, Session};
use crate::util;

/// A generated agent definition, ready to be added to user config.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefinition {
    pub identifier: String,
    pub when_to_use: String,
    pub prompt: String,
}

impl Engine {
    /// After the first assistant reply, spawn the hidden `title` agent to
    /// name the session. Best-effort: failures only log.
    pub(crate) async fn maybe_generate_title(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) {
        if session.title != "New session" {
            return;
        }
        match self.hidden_generation("title", &self.transcript_snippet(session), cancel).await {
            Ok(text) => {
                let title = util::truncate_chars(text.lines().next().unwrap_or("").trim(), 80);
                if !title.is_empty() {
                    if let Err(e) = self.sessions.set_title(session, &title) {
                        warn!("title not persisted: {e}");
                    }
                }
            }
            Err(e) => warn!("title generation failed: {e}"),
        }
    }

    /// On-demand session summary via the hidden `summary` agent.
    pub async fn generate_summary(&self, session_id: &str) -> Result<String, EngineError> {
        let mut session = self
            .sessions
            .find(session_id)
            .map_err(|e| EngineError::Unrecoverable(e.to_string()))?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let summary = self
            .hidden_generation(
                "summary",
                &self.transcript_snippet(&session),
                &CancellationToken::new(),
            )
            .await
            .map_err(EngineError::ModelUnavailable)?;
        self.sessions
            .set_summary(&mut session, &summary)
            .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
        Ok(summary)
    }

    /// Produce a new agent definition from a user description. Duplicates
    /// of existing agent names are rejected.
    pub async fn generate_agent(&self, description: &str) -> Result<AgentDefinition, EngineError> {
        let prompt = format!(
            "Design an agent for this need and answer with JSON only, using the keys \
             identifier (kebab-case), when_to_use, prompt.\n\nNeed: {description}"
        );
        let text = self
            .hidden_generation("summary", &prompt, &CancellationToken::new())
            .await
            .map_err(EngineError::ModelUnavailable)?;
        let json_slice = extract_json_object(&text)
            .ok_or_else(|| EngineError::Unrecoverable("agent generator returned no JSON".into()))?;
        let definition: AgentDefinition = serde_json::from_str(json_slice)
            .map_err(|e| EngineError::Unrecoverable(format!("agent definition unparsable: {e}")))?;
        if definition.identifier.trim().is_empty() {
            return Err(EngineError::Unrecoverable(
                "agent definition missing identifier".into(),
            ));
        }
        if self.registry.get(&definition.identifier).is_some() {
            return Err(EngineError::DuplicateAgent(definition.identifier));
        }
        Ok(definition)
    }

    /// One-shot generation through a hidden agent with no tools.
    async fn hidden_generation(
        &self,
        agent_name: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        let agent = self
            .registry
            .get(agent_name)
            .ok_or_else(|| format!("hidden agent {agent_name} unavailable"))?;
        let request = ProviderRequest {
            model: agent.model.clone().unwrap_or_else(|| self.cfg.model.clone()),
            system: agent
                .prompt
                .clone()
                .unwrap_or_else(|| super::prompt::default_prompt(agent_name)),
            messages: vec![ChatMessage::new("user", input.to_string())],
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
                Ok(text)
            }
            Err(failure) => Err(failure.error.to_string()),
        }
    }

    fn transcript_snippet(&self, session: &Session) -> String {
        let messages = self.sessions.messages(&session.id).unwrap_or_default();
        let mut out = String::new();
        for message in messages.iter().take(6) {
            let text = message.text();
            if text.is_empty() {
                continue;
            }
            out.push_str(&format!("{:?}: {}\n", message.role, util::truncate_chars(&text, 300)));
        }
        out
    }
}

/// First balanced `{...}` object in a model reply.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (i, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
