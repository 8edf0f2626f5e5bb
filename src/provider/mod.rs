pub mod retry;
pub mod scripted;

use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Requests and stream deltas
// ---------------------------------------------------------------------------

/// One chat message as the provider sees it. Tool results are folded into
/// user-role messages by the prompt composer.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    /// Tool schemas in provider-neutral JSON.
    pub tools: Vec<JsonValue>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
}

/// Incremental output from a streaming chat request.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Text(String),
    Reasoning(String),
    ToolCall {
        call_id: String,
        tool: String,
        input: JsonValue,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    Done(StopReason),
}

pub type DeltaReceiver = mpsc::Receiver<Result<StreamDelta, ProviderError>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ProviderError {
    /// HTTP status from the endpoint, with any `Retry-After` it supplied.
    Http {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    /// Explicit overloaded signal in the response body.
    Overloaded { retry_after: Option<Duration> },
    /// Connection reset, refused, or other transport failure.
    Network(String),
    Timeout,
    /// Transient mid-stream failure (truncated SSE, decode error).
    Stream(String),
    Auth(String),
    BadRequest(String),
}

impl ProviderError {
    /// Retryable conditions: HTTP 5xx, 429, overloaded, network
    /// reset/timeout, transient stream errors. Auth and bad-request are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Overloaded { .. }
            | ProviderError::Network(_)
            | ProviderError::Timeout
            | ProviderError::Stream(_) => true,
            ProviderError::Auth(_) | ProviderError::BadRequest(_) => false,
        }
    }

    /// Server-supplied wait, used instead of computed backoff when present.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Http { retry_after, .. }
            | ProviderError::Overloaded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Http { status, body, .. } => {
                write!(f, "provider returned HTTP {status}: {}", crate::util::truncate_chars(body, 200))
            }
            ProviderError::Overloaded { .. } => write!(f, "provider overloaded"),
            ProviderError::Network(e) => write!(f, "network error: {e}"),
            ProviderError::Timeout => write!(f, "provider request timed out"),
            ProviderError::Stream(e) => write!(f, "stream error: {e}"),
            ProviderError::Auth(e) => write!(f, "authentication failed: {e}"),
            ProviderError::BadRequest(e) => write!(f, "bad request: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Streaming chat transport. HTTP/SSE implementations live outside the
/// core; the scripted provider in this crate drives tests.
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Open a streaming request. The receiver yields deltas until
    /// `Done` or an error; cancellation must stop the stream promptly.
    fn stream_chat(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<DeltaReceiver, ProviderError>>;
}
