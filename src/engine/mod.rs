mod ancillary;
mod compaction;
mod dispatch;
mod prompt;
pub mod tools;
mod types;

pub use ancillary::AgentDefinition;
pub use types::{Engine, EngineConfig, EngineError, TurnState};

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{AgentInfo, AgentRegistry};
use crate::bus::{Bus, Event};
use crate::hooks::HookPipeline;
use crate::memory::Memory;
use crate::permission::requests::AskBroker;
use crate::provider::retry::RetryPolicy;
use crate::provider::{ModelProvider, ProviderError, ProviderRequest, StopReason, StreamDelta};
use crate::session::{estimate_tokens, Message, MessageMode, MessagePart, Role, Session, SessionStore};
use crate::util;
use types::{StreamFailure, StreamedReply};

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        provider: Arc<dyn ModelProvider>,
        registry: Arc<AgentRegistry>,
        tools: Arc<tools::ToolRegistry>,
        sessions: Arc<SessionStore>,
        bus: Arc<Bus>,
        hooks: Arc<HookPipeline>,
        asks: Arc<AskBroker>,
        memory: Arc<Memory>,
    ) -> Self {
        Self {
            cfg,
            provider,
            registry,
            tools,
            sessions,
            bus,
            hooks,
            asks,
            memory,
            retry: RetryPolicy::default(),
            turns: std::sync::Mutex::new(HashMap::new()),
            session_rules: std::sync::RwLock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Drive one turn: user input in, final assistant message out, with
    /// tool calls, retries, and compaction in between.
    pub async fn prompt(
        &self,
        session_id: &str,
        agent_name: &str,
        text: &str,
    ) -> Result<Message, EngineError> {
        let agent = self
            .registry
            .get(agent_name)
            .ok_or_else(|| EngineError::AgentNotFound(agent_name.to_string()))?;
        let mut session = self
            .sessions
            .find(session_id)
            .map_err(|e| EngineError::Unrecoverable(e.to_string()))?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let cancel = CancellationToken::new();
        self.turns
            .lock()
            .expect("turns lock")
            .insert(session_id.to_string(), cancel.clone());

        let result = self.run_turn(&mut session, &agent, text, &cancel).await;

        self.turns.lock().expect("turns lock").remove(session_id);
        match &result {
            Ok(_) => self.bus.publish(Event::SessionIdle {
                session_id: session_id.to_string(),
            }),
            Err(e) => self.bus.publish(Event::SessionError {
                session_id: session_id.to_string(),
                error: util::mask_secrets(&e.to_string()),
            }),
        }
        result
    }

    /// Signal the session's running turn to stop. Idempotent; a session
    /// with no running turn is a no-op.
    pub fn abort(&self, session_id: &str) {
        if let Some(token) = self.turns.lock().expect("turns lock").get(session_id) {
            token.cancel();
        }
    }

    /// Force a compaction cycle regardless of context pressure.
    pub async fn compact(&self, session_id: &str) -> Result<(), EngineError> {
        let mut session = self
            .sessions
            .find(session_id)
            .map_err(|e| EngineError::Unrecoverable(e.to_string()))?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        self.run_compaction(&mut session, 0, &CancellationToken::new())
            .await
            .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
        Ok(())
    }

    /// Fork a session at a message; returns the new session id.
    pub fn fork(&self, session_id: &str, at_message_id: &str) -> Result<String, EngineError> {
        let session = self
            .sessions
            .find(session_id)
            .map_err(|e| EngineError::Unrecoverable(e.to_string()))?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let forked = self
            .sessions
            .fork(&session, at_message_id)
            .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
        Ok(forked.id)
    }

    // ------------------------------------------------------------------
    // Turn loop
    // ------------------------------------------------------------------

    async fn run_turn(
        &self,
        session: &mut Session,
        agent: &AgentInfo,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Message, EngineError> {
        let mut state = TurnState::Composing;
        debug!("turn {}: {}", session.id, state);

        let user_message = Message::user_text(&session.id, text);
        let user = self
            .sessions
            .append_message(session, user_message)
            .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
        self.publish_message(&session.id, &user);

        // The turn's decision anchors all causal actions it takes.
        if let Err(e) = self
            .memory
            .causal
            .record_decision(&session.id, &agent.name, text, "user request", 0.8)
            .await
        {
            warn!("decision not recorded: {e}");
        }

        for _step in 0..self.cfg.max_steps {
            if cancel.is_cancelled() {
                return Err(EngineError::Aborted);
            }

            // Context pressure check between requests.
            let messages = self
                .sessions
                .messages(&session.id)
                .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
            let projected = self.projected_tokens(&messages);
            if projected > self.cfg.context_limit {
                state = TurnState::Compacting;
                debug!("turn {}: {} (projected {projected})", session.id, state);
                self.run_compaction(session, projected - self.cfg.context_limit, cancel)
                    .await
                    .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
            }

            let messages = self
                .sessions
                .messages(&session.id)
                .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
            let request = self.compose(agent, &messages, Some(text));

            state = TurnState::Streaming;
            debug!("turn {}: {}", session.id, state);
            match self.stream_with_retries(request, cancel).await {
                Ok(reply) => {
                    debug!(
                        "provider usage: {} in, {} out",
                        reply.input_tokens, reply.output_tokens
                    );
                    let reply_message =
                        Message::new(&session.id, Role::Assistant, MessageMode::Normal, reply.parts);
                    let assistant = self
                        .sessions
                        .append_message(session, reply_message)
                        .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
                    self.publish_message(&session.id, &assistant);

                    let tool_calls: Vec<(String, String, serde_json::Value)> = assistant
                        .parts
                        .iter()
                        .filter_map(|p| match p {
                            MessagePart::ToolCall { call_id, tool, input, .. } => {
                                Some((call_id.clone(), tool.clone(), input.clone()))
                            }
                            _ => None,
                        })
                        .collect();

                    if reply.end_turn || tool_calls.is_empty() {
                        state = TurnState::Finalizing;
                        debug!("turn {}: {}", session.id, state);
                        self.maybe_generate_title(session, cancel).await;
                        return Ok(assistant);
                    }

                    state = TurnState::AwaitingTool;
                    debug!("turn {}: {}", session.id, state);
                    // Side effects preserve the model's emission order.
                    let mut result_parts = Vec::with_capacity(tool_calls.len());
                    let mut turn_aborted = false;
                    for (call_id, tool, input) in &tool_calls {
                        let outcome = self
                            .dispatch_tool(
                                &session.id,
                                agent,
                                call_id,
                                tool,
                                input,
                                &assistant.id,
                                cancel,
                            )
                            .await;
                        turn_aborted = outcome.aborted;
                        result_parts.push(dispatch::tool_result_part(call_id, tool, &outcome));
                        if turn_aborted {
                            break;
                        }
                    }
                    let results_message =
                        Message::new(&session.id, Role::User, MessageMode::Normal, result_parts);
                    let results = self
                        .sessions
                        .append_message(session, results_message)
                        .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
                    self.publish_message(&session.id, &results);
                    if turn_aborted {
                        return Err(EngineError::Aborted);
                    }
                }
                Err(failure) => {
                    // Partial output is preserved in the message.
                    if !failure.partial.is_empty() {
                        let partial_message = Message::new(
                            &session.id,
                            Role::Assistant,
                            MessageMode::Normal,
                            failure.partial,
                        );
                        if let Ok(partial) = self.sessions.append_message(session, partial_message) {
                            self.publish_message(&session.id, &partial);
                        }
                    }
                    if cancel.is_cancelled() {
                        return Err(EngineError::Aborted);
                    }
                    let message = util::mask_secrets(&describe_provider_error(&failure.error));
                    return Err(match failure.error {
                        ProviderError::Auth(_) | ProviderError::BadRequest(_) => {
                            EngineError::ModelUnavailable(message)
                        }
                        _ => EngineError::Unrecoverable(message),
                    });
                }
            }
        }
        Err(EngineError::Unrecoverable(format!(
            "tool loop exceeded {} steps",
            self.cfg.max_steps
        )))
    }

    // ------------------------------------------------------------------
    // Streaming with retries
    // ------------------------------------------------------------------

    async fn stream_with_retries(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<StreamedReply, StreamFailure> {
        let mut attempt: u32 = 0;
        loop {
            match self.collect_stream(request.clone(), cancel).await {
                Ok(reply) => return Ok(reply),
                Err(failure) => {
                    if cancel.is_cancelled() || !self.retry.should_retry(attempt, &failure.error) {
                        return Err(failure);
                    }
                    let delay = self.retry.delay_for(attempt, &failure.error);
                    info!(
                        "provider error (attempt {}): {} — retrying in {:?}",
                        attempt + 1,
                        failure.error,
                        delay
                    );
                    // No retry is started after an abort.
                    if !self.retry.wait(delay, cancel).await {
                        return Err(failure);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Open one stream and drain it into message parts. Mid-stream errors
    /// return the partial output alongside the error.
    pub(crate) async fn collect_stream(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<StreamedReply, StreamFailure> {
        let mut rx = match self.provider.stream_chat(request, cancel.clone()).await {
            Ok(rx) => rx,
            Err(error) => {
                return Err(StreamFailure {
                    error,
                    partial: Vec::new(),
                })
            }
        };

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_parts: Vec<MessagePart> = Vec::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut end_turn = true;
        loop {
            let delta = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(StreamFailure {
                        error: ProviderError::Stream("aborted".into()),
                        partial: assemble_parts(text, reasoning, tool_parts),
                    })
                }
                delta = rx.recv() => delta,
            };
            match delta {
                Some(Ok(StreamDelta::Text(chunk))) => text.push_str(&chunk),
                Some(Ok(StreamDelta::Reasoning(chunk))) => reasoning.push_str(&chunk),
                Some(Ok(StreamDelta::ToolCall { call_id, tool, input })) => {
                    let tokens = estimate_tokens(&input.to_string());
                    tool_parts.push(MessagePart::ToolCall {
                        call_id,
                        tool,
                        input,
                        tokens,
                    });
                }
                Some(Ok(StreamDelta::Usage {
                    input_tokens: it,
                    output_tokens: ot,
                })) => {
                    input_tokens = it;
                    output_tokens = ot;
                }
                Some(Ok(StreamDelta::Done(stop))) => {
                    end_turn = stop == StopReason::EndTurn;
                    break;
                }
                Some(Err(error)) => {
                    return Err(StreamFailure {
                        error,
                        partial: assemble_parts(text, reasoning, tool_parts),
                    })
                }
                // Channel closed without Done: transient stream error.
                None => {
                    return Err(StreamFailure {
                        error: ProviderError::Stream("stream ended unexpectedly".into()),
                        partial: assemble_parts(text, reasoning, tool_parts),
                    })
                }
            }
        }
        Ok(StreamedReply {
            parts: assemble_parts(text, reasoning, tool_parts),
            input_tokens,
            output_tokens,
            end_turn,
        })
    }

    fn publish_message(&self, session_id: &str, message: &Message) {
        for (index, part) in message.parts.iter().enumerate() {
            self.bus.publish(Event::SessionMessagePartUpdated {
                session_id: session_id.to_string(),
                message_id: message.id.clone(),
                part_index: index,
                part: serde_json::to_value(part).unwrap_or_default(),
            });
        }
        self.bus.publish(Event::SessionMessageUpdated {
            session_id: session_id.to_string(),
            message_id: message.id.clone(),
        });
    }
}

fn assemble_parts(
    text: String,
    reasoning: String,
    tool_parts: Vec<MessagePart>,
) -> Vec<MessagePart> {
    let mut parts = Vec::new();
    if !reasoning.is_empty() {
        parts.push(MessagePart::Reasoning {
            tokens: estimate_tokens(&reasoning),
            text: reasoning,
        });
    }
    if !text.is_empty() {
        parts.push(MessagePart::Text {
            tokens: estimate_tokens(&text),
            text,
        });
    }
    parts.extend(tool_parts);
    parts
}

/// User-facing provider error line. Rate limits mention the backoff and
/// any Retry-After the server supplied.
fn describe_provider_error(error: &ProviderError) -> String {
    match error {
        ProviderError::Http { status: 429, retry_after, .. } => match retry_after {
            Some(after) => format!(
                "rate limited (HTTP 429); server asked to retry after {}s; retries exhausted",
                after.as_secs()
            ),
            None => "rate limited (HTTP 429); exponential backoff exhausted".to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRegistry;
    use crate::config::ProjectConfig;
    use crate::provider::scripted::{ScriptedProvider, ScriptedTurn};
    use crate::storage::Storage;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        engine: Arc<Engine>,
        provider: Arc<ScriptedProvider>,
        session_id: String,
        worktree: std::path::PathBuf,
    }

    fn fixture_with(turns: Vec<ScriptedTurn>, hooks_json: Option<&str>, config: ProjectConfig) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tmp.path().join("repo");
        std::fs::create_dir_all(&worktree).unwrap();
        let data_root = tmp.path().join("data");

        let storage = Arc::new(Storage::open(crate::paths::memory_dir(&data_root)).unwrap());
        let memory = Arc::new(crate::memory::Memory::open(&data_root, "proj-test").unwrap());
        let bus = Arc::new(Bus::new());
        let sessions = Arc::new(SessionStore::new(storage.clone()));
        let asks = Arc::new(AskBroker::new(storage, bus.clone()));
        let registry = Arc::new(AgentRegistry::build(&config).unwrap());
        let provider = Arc::new(ScriptedProvider::new(turns));
        let hooks = match hooks_json {
            Some(json) => {
                let path = worktree.join("hooks.json");
                std::fs::write(&path, json).unwrap();
                Arc::new(HookPipeline::with_files(vec![path]))
            }
            None => Arc::new(HookPipeline::with_files(vec![])),
        };

        let session = sessions.create("proj-test", None).unwrap();
        let engine = Arc::new(Engine::new(
            EngineConfig::new(worktree.clone(), "test-model"),
            provider.clone(),
            registry,
            Arc::new(tools::ToolRegistry::builtin()),
            sessions,
            bus,
            hooks,
            asks,
            memory,
        ));
        Fixture {
            _tmp: tmp,
            engine,
            provider,
            session_id: session.id,
            worktree,
        }
    }

    fn fixture(turns: Vec<ScriptedTurn>) -> Fixture {
        fixture_with(turns, None, allow_all_config())
    }

    /// Project config that allows everything, so tool tests don't suspend.
    fn allow_all_config() -> ProjectConfig {
        let mut config = ProjectConfig::default();
        let mut permission = crate::permission::PermissionConfig::new();
        for kind in crate::permission::PermissionKind::ALL {
            permission.insert(
                kind.as_str().to_string(),
                crate::permission::PermissionValue::Action(crate::permission::PermissionAction::Allow),
            );
        }
        config.permission = permission;
        config
    }

    #[tokio::test]
    async fn test_plain_text_turn() {
        // Second scripted turn feeds the title generation.
        let f = fixture(vec![
            ScriptedTurn::text("All done."),
            ScriptedTurn::text("Session title"),
        ]);
        let message = f
            .engine
            .prompt(&f.session_id, "build", "say hi")
            .await
            .unwrap();
        assert_eq!(message.text(), "All done.");
        let session = f.engine.sessions.find(&f.session_id).unwrap().unwrap();
        assert_eq!(session.title, "Session title");
    }

    #[tokio::test]
    async fn test_agent_not_found() {
        let f = fixture(vec![]);
        match f.engine.prompt(&f.session_id, "ghost", "hi").await {
            Err(EngineError::AgentNotFound(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected AgentNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_loop_writes_file_and_records_edit() {
        let f = fixture(vec![
            ScriptedTurn::tool_call(
                "c1",
                "write",
                json!({ "path": "notes.txt", "content": "hello\n" }),
            ),
            ScriptedTurn::text("Wrote the file."),
            ScriptedTurn::text("title"),
        ]);
        let message = f
            .engine
            .prompt(&f.session_id, "build", "create notes.txt")
            .await
            .unwrap();
        assert_eq!(message.text(), "Wrote the file.");
        assert_eq!(
            std::fs::read_to_string(f.worktree.join("notes.txt")).unwrap(),
            "hello\n"
        );
        // Edit record landed.
        let edits = f.engine.memory.edits.for_session(&f.session_id).unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].files[0].path, "notes.txt");
        // Causal chain: decision -> action -> success outcome.
        let chains = f
            .engine
            .memory
            .causal
            .get_causal_chains_for_session(&f.session_id)
            .unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].actions.len(), 1);
        assert!(chains[0].actions[0].1.is_some());
    }

    #[tokio::test]
    async fn test_secret_blocking_hook_prevents_write() {
        // Scenario: scan hook on edit-class tools blocks sk_live keys.
        let hooks = r#"{ "hooks": { "PreToolUse": { "secret-scan": {
            "pattern": "write|edit",
            "actions": [ { "type": "scan",
                           "patterns": ["sk_live_[a-zA-Z0-9]+"],
                           "message": "Sensitive pattern detected: {match}",
                           "block": true } ] } } } }"#;
        let f = fixture_with(
            vec![
                ScriptedTurn::tool_call(
                    "c1",
                    "write",
                    json!({ "path": "config.ts", "content": "API_KEY = \"sk_live_abcdefghij1234567890\"" }),
                ),
                ScriptedTurn::text("Could not write the secret."),
                ScriptedTurn::text("title"),
            ],
            Some(hooks),
            allow_all_config(),
        );
        let message = f
            .engine
            .prompt(&f.session_id, "build", "write the key")
            .await
            .unwrap();
        // Turn continued to a final message.
        assert_eq!(message.text(), "Could not write the secret.");
        // No file write occurred.
        assert!(!f.worktree.join("config.ts").exists());
        // The tool result carries the hook message.
        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        let result_text: String = messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                MessagePart::ToolResult { output, is_error: true, .. } => Some(output.clone()),
                _ => None,
            })
            .collect();
        assert!(result_text
            .contains("Sensitive pattern detected: sk_live_abcdefghij1234567890"));
    }

    #[tokio::test]
    async fn test_permission_ask_flow_allow_and_deny() {
        // Scenario: read .env is `ask` by default.
        let mut config = allow_all_config();
        config.permission.insert(
            "read".to_string(),
            crate::permission::PermissionValue::Scoped(std::collections::HashMap::from([(
                "*.env".to_string(),
                crate::permission::PermissionAction::Ask,
            )])),
        );
        let f = fixture_with(
            vec![
                ScriptedTurn::tool_call("c1", "read", json!({ "path": ".env" })),
                ScriptedTurn::text("Read it."),
                ScriptedTurn::text("title"),
            ],
            None,
            config,
        );
        std::fs::write(f.worktree.join(".env"), "SECRET=1\n").unwrap();

        // Reply from a second task once the request lands on the bus.
        let mut rx = f.engine.bus.subscribe();
        let engine = f.engine.clone();
        let replier = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::PermissionUpdated { request }) => {
                        engine
                            .asks
                            .reply(
                                &request.id,
                                crate::permission::requests::PermissionReply::AllowOnce,
                                None,
                            )
                            .await
                            .unwrap();
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        });
        let message = f
            .engine
            .prompt(&f.session_id, "build", "read the env file")
            .await
            .unwrap();
        replier.await.unwrap();
        assert_eq!(message.text(), "Read it.");
        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        let outputs: Vec<String> = messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                MessagePart::ToolResult { output, .. } => Some(output.clone()),
                _ => None,
            })
            .collect();
        assert!(outputs.iter().any(|o| o.contains("SECRET=1")));

        // Deny path: the reply message becomes the tool result body.
        f.provider
            .push(ScriptedTurn::tool_call("c2", "read", json!({ "path": ".env" })));
        f.provider.push(ScriptedTurn::text("Understood."));
        let mut rx = f.engine.bus.subscribe();
        let engine = f.engine.clone();
        let replier = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::PermissionUpdated { request }) => {
                        engine
                            .asks
                            .reply(
                                &request.id,
                                crate::permission::requests::PermissionReply::Deny,
                                Some("nope".to_string()),
                            )
                            .await
                            .unwrap();
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        });
        let message = f
            .engine
            .prompt(&f.session_id, "build", "read it again")
            .await
            .unwrap();
        replier.await.unwrap();
        assert_eq!(message.text(), "Understood.");
        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        let denied: Vec<String> = messages
            .iter()
            .flat_map(|m| m.parts.iter())
            .filter_map(|p| match p {
                MessagePart::ToolResult { output, is_error: true, .. } => Some(output.clone()),
                _ => None,
            })
            .collect();
        assert!(denied.iter().any(|o| o.as_str() == "nope"));
    }

    #[tokio::test]
    async fn test_allow_always_appends_session_rule() {
        let mut config = allow_all_config();
        config.permission.insert(
            "bash".to_string(),
            crate::permission::PermissionValue::Action(crate::permission::PermissionAction::Ask),
        );
        let f = fixture_with(
            vec![
                ScriptedTurn::tool_call("c1", "bash", json!({ "command": "echo one" })),
                ScriptedTurn::tool_call("c2", "bash", json!({ "command": "echo two" })),
                ScriptedTurn::text("Ran both."),
                ScriptedTurn::text("title"),
            ],
            None,
            config,
        );
        let mut rx = f.engine.bus.subscribe();
        let engine = f.engine.clone();
        let replier = tokio::spawn(async move {
            let mut replies = 0;
            loop {
                match rx.recv().await {
                    Ok(Event::PermissionUpdated { request }) => {
                        engine
                            .asks
                            .reply(
                                &request.id,
                                crate::permission::requests::PermissionReply::AllowAlways,
                                None,
                            )
                            .await
                            .unwrap();
                        replies += 1;
                    }
                    Ok(Event::SessionIdle { .. }) => break replies,
                    Ok(_) => continue,
                    Err(_) => break replies,
                }
            }
        });
        let message = f
            .engine
            .prompt(&f.session_id, "build", "echo twice")
            .await
            .unwrap();
        assert_eq!(message.text(), "Ran both.");
        // allow_always on `echo *` covered the second call: only one ask.
        assert_eq!(replier.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_retry_after() {
        // Scenario: 429 with Retry-After: 2 waits ~2000 ms, then succeeds.
        let f = fixture(vec![
            ScriptedTurn::Fail(ProviderError::Http {
                status: 429,
                body: "rate limited".into(),
                retry_after: Some(Duration::from_secs(2)),
            }),
            ScriptedTurn::text("Recovered."),
            ScriptedTurn::text("title"),
        ]);
        let started = tokio::time::Instant::now();
        let message = f
            .engine
            .prompt(&f.session_id, "build", "hello")
            .await
            .unwrap();
        let waited = started.elapsed();
        assert_eq!(message.text(), "Recovered.");
        // Paused-clock time advances exactly by the sleeps taken.
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_turn() {
        let f = fixture(vec![ScriptedTurn::Fail(ProviderError::Auth(
            "bad key sk-proj-aaaabbbbcccc".into(),
        ))]);
        match f.engine.prompt(&f.session_id, "build", "hello").await {
            Err(EngineError::ModelUnavailable(message)) => {
                // Secrets are masked before surfacing.
                assert!(message.contains("sk-***"));
                assert!(!message.contains("aaaabbbb"));
            }
            other => panic!("expected ModelUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure_preserves_partial_text() {
        let f = fixture(vec![ScriptedTurn::FailMidStream {
            deltas: vec![StreamDelta::Text("partial thought".into())],
            error: ProviderError::BadRequest("schema".into()),
        }]);
        let result = f.engine.prompt(&f.session_id, "build", "hello").await;
        assert!(result.is_err());
        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        assert!(messages
            .iter()
            .any(|m| m.role == Role::Assistant && m.text() == "partial thought"));
    }

    #[tokio::test]
    async fn test_compaction_cycle_inserts_pair_and_resumes() {
        // Lower limits so a modest transcript triggers compaction. The
        // summarizer's scripted turn is consumed first, then the main
        // reply, then the title.
        let mut f = fixture(vec![]);
        {
            let engine = Arc::get_mut(&mut f.engine).unwrap();
            engine.cfg.context_limit = 2_000;
            engine.cfg.protected_recent_tokens = 500;
        }
        let mut session = f.engine.sessions.find(&f.session_id).unwrap().unwrap();
        for i in 0..30 {
            let filler = format!("message {i}: {}", "x".repeat(600));
            let filler_message = Message::user_text(&session.id, &filler);
            f.engine
                .sessions
                .append_message(&mut session, filler_message)
                .unwrap();
        }
        f.provider.push(ScriptedTurn::text("Summary of early filler."));
        f.provider.push(ScriptedTurn::text("Done after compaction."));
        f.provider.push(ScriptedTurn::text("title"));

        let message = f
            .engine
            .prompt(&f.session_id, "build", "continue the work")
            .await
            .unwrap();
        assert_eq!(message.text(), "Done after compaction.");

        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        let compactions: Vec<&Message> = messages
            .iter()
            .filter(|m| m.mode == MessageMode::Compaction)
            .collect();
        let continues: Vec<&Message> = messages
            .iter()
            .filter(|m| m.mode == MessageMode::Continue)
            .collect();
        // Invariant: compaction and continue messages pair up.
        assert_eq!(compactions.len(), continues.len());
        assert_eq!(compactions.len(), 1);
        // The pruned span meets the 20k-token floor or covers all candidates.
        assert!(!compactions[0].pruned_seqs.is_empty());
        // Recent messages survive.
        let pruned = &compactions[0].pruned_seqs;
        let max_seq = messages.iter().map(|m| m.seq).max().unwrap();
        assert!(!pruned.contains(&max_seq));
    }

    #[tokio::test]
    async fn test_no_compaction_at_exact_limit() {
        // Projected tokens equal to the limit must not trigger compaction;
        // run_turn only compacts when projected exceeds it.
        let mut f = fixture(vec![ScriptedTurn::text("ok"), ScriptedTurn::text("title")]);
        let mut session = f.engine.sessions.find(&f.session_id).unwrap().unwrap();
        for _ in 0..5 {
            let filler_message = Message::user_text(&session.id, &"y".repeat(400));
            f.engine
                .sessions
                .append_message(&mut session, filler_message)
                .unwrap();
        }
        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        let projected = f.engine.projected_tokens(&messages);
        {
            let engine = Arc::get_mut(&mut f.engine).unwrap();
            // The turn adds one user message and one reply; leave room for
            // exactly that so the projection never exceeds the limit.
            engine.cfg.context_limit = projected + estimate_tokens("go on") + 1;
        }
        f.engine.prompt(&f.session_id, "build", "go on").await.unwrap();
        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        assert!(messages.iter().all(|m| m.mode != MessageMode::Compaction));
    }

    #[tokio::test]
    async fn test_compaction_plan_floor_and_protected_window() {
        let mut f = fixture(vec![]);
        {
            let engine = Arc::get_mut(&mut f.engine).unwrap();
            engine.cfg.protected_recent_tokens = 500;
        }
        let mut session = f.engine.sessions.find(&f.session_id).unwrap().unwrap();
        for i in 0..40 {
            let filler = format!("filler {i}: {}", "z".repeat(4000));
            let filler_message = Message::user_text(&session.id, &filler);
            f.engine
                .sessions
                .append_message(&mut session, filler_message)
                .unwrap();
        }
        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        // Tiny excess still prunes at least the 20k floor.
        let plan = f.engine.plan_compaction(&messages, 1).unwrap();
        assert!(plan.pruned_tokens >= 20_000);
        // The most recent window survives even though it would fit the target.
        let max_seq = messages.iter().map(|m| m.seq).max().unwrap();
        assert!(!plan.pruned_seqs.contains(&max_seq));
        // A large excess raises the target past the floor.
        let plan = f.engine.plan_compaction(&messages, 30_000).unwrap();
        assert!(plan.pruned_tokens >= 30_000);
    }

    #[tokio::test]
    async fn test_abort_mid_tool_no_partial_edit_record() {
        let f = fixture(vec![ScriptedTurn::tool_call(
            "c1",
            "bash",
            json!({ "command": "sleep 30" }),
        )]);
        let engine = f.engine.clone();
        let session_id = f.session_id.clone();
        let aborter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            engine.abort(&session_id);
        });
        let result = f.engine.prompt(&f.session_id, "build", "run it").await;
        aborter.await.unwrap();
        assert!(matches!(result, Err(EngineError::Aborted)));
        // Tool result states Aborted; no edit record exists.
        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        let aborted_result = messages.iter().flat_map(|m| m.parts.iter()).any(|p| {
            matches!(p, MessagePart::ToolResult { output, is_error: true, .. } if output == "Aborted")
        });
        assert!(aborted_result);
        assert!(f.engine.memory.edits.for_session(&f.session_id).unwrap().is_empty());
        // abort is idempotent after the turn ended.
        f.engine.abort(&f.session_id);
    }

    #[tokio::test]
    async fn test_fork_copies_prefix() {
        let f = fixture(vec![
            ScriptedTurn::text("a1"),
            ScriptedTurn::text("title"),
            ScriptedTurn::text("a2"),
        ]);
        f.engine.prompt(&f.session_id, "build", "u1").await.unwrap();
        f.engine.prompt(&f.session_id, "build", "u2").await.unwrap();

        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        // [u1, a1, u2, a2] — fork at u2.
        let u2 = messages
            .iter()
            .find(|m| m.role == Role::User && m.text() == "u2")
            .unwrap();
        let forked_id = f.engine.fork(&f.session_id, &u2.id).unwrap();
        let forked = f.engine.sessions.find(&forked_id).unwrap().unwrap();
        assert_eq!(forked.forked_from.as_deref(), Some(f.session_id.as_str()));
        let forked_messages = f.engine.sessions.messages(&forked_id).unwrap();
        assert_eq!(
            forked_messages.iter().map(Message::text).collect::<Vec<_>>(),
            vec!["u1", "a1", "u2"]
        );
    }

    #[tokio::test]
    async fn test_output_truncation_overflows_to_reserved_dir() {
        let mut f = fixture(vec![
            ScriptedTurn::tool_call("c1", "bash", json!({ "command": "yes x | head -c 100000" })),
            ScriptedTurn::text("done"),
            ScriptedTurn::text("title"),
        ]);
        {
            let engine = Arc::get_mut(&mut f.engine).unwrap();
            engine.cfg.context_limit = 10_000_000;
        }
        f.engine
            .prompt(&f.session_id, "build", "spam output")
            .await
            .unwrap();
        let dir = crate::paths::truncation_dir(&f.worktree);
        let overflow: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert!(!overflow.is_empty());
        let messages = f.engine.sessions.messages(&f.session_id).unwrap();
        let truncated = messages.iter().flat_map(|m| m.parts.iter()).any(|p| {
            matches!(p, MessagePart::ToolResult { output, .. } if output.contains("output truncated"))
        });
        assert!(truncated);
    }
}
