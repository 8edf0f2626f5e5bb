//! Deterministic provider used by tests and offline runs: each call pops
//! the next scripted response, either a delta sequence or an error.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    DeltaReceiver, ModelProvider, ProviderError, ProviderRequest, StopReason, StreamDelta,
};

pub enum ScriptedTurn {
    /// Stream these deltas, then `Done(stop)`.
    Reply {
        deltas: Vec<StreamDelta>,
        stop: StopReason,
    },
    /// Fail the request before any delta.
    Fail(ProviderError),
    /// Stream some deltas then fail mid-stream.
    FailMidStream {
        deltas: Vec<StreamDelta>,
        error: ProviderError,
    },
}

impl ScriptedTurn {
    pub fn text(text: &str) -> Self {
        ScriptedTurn::Reply {
            deltas: vec![StreamDelta::Text(text.to_string())],
            stop: StopReason::EndTurn,
        }
    }

    pub fn tool_call(call_id: &str, tool: &str, input: serde_json::Value) -> Self {
        ScriptedTurn::Reply {
            deltas: vec![StreamDelta::ToolCall {
                call_id: call_id.to_string(),
                tool: tool.to_string(),
                input,
            }],
            stop: StopReason::ToolUse,
        }
    }
}

pub struct ScriptedProvider {
    id: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    /// Requests observed, for assertions.
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            id: "scripted".to_string(),
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().expect("scripted turns lock").push_back(turn);
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().expect("scripted turns lock").len()
    }
}

impl ModelProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn stream_chat(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<DeltaReceiver, ProviderError>> {
        self.requests
            .lock()
            .expect("scripted requests lock")
            .push(request);
        let turn = self.turns.lock().expect("scripted turns lock").pop_front();
        async move {
            let turn = turn.ok_or_else(|| {
                ProviderError::BadRequest("scripted provider exhausted".to_string())
            })?;
            match turn {
                ScriptedTurn::Fail(error) => Err(error),
                ScriptedTurn::Reply { deltas, stop } => {
                    let (tx, rx) = mpsc::channel(64);
                    tokio::spawn(async move {
                        for delta in deltas {
                            if cancel.is_cancelled() {
                                return;
                            }
                            if tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(Ok(StreamDelta::Done(stop))).await;
                    });
                    Ok(rx)
                }
                ScriptedTurn::FailMidStream { deltas, error } => {
                    let (tx, rx) = mpsc::channel(64);
                    tokio::spawn(async move {
                        for delta in deltas {
                            if tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(Err(error)).await;
                    });
                    Ok(rx)
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "test".into(),
            system: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            temperature: None,
            top_p: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_reply() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::text("hello")]);
        let mut rx = provider
            .stream_chat(request(), CancellationToken::new())
            .await
            .unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert!(matches!(first, StreamDelta::Text(t) if t == "hello"));
        let done = rx.recv().await.unwrap().unwrap();
        assert!(matches!(done, StreamDelta::Done(StopReason::EndTurn)));
    }

    #[tokio::test]
    async fn test_exhausted_script_errors() {
        let provider = ScriptedProvider::new(vec![]);
        let err = provider
            .stream_chat(request(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(!err.is_retryable());
    }
}
