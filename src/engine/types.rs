use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::agents::AgentRegistry;
use crate::bus::Bus;
use crate::hooks::HookPipeline;
use crate::memory::Memory;
use crate::permission::requests::AskBroker;
use crate::permission::Ruleset;
use crate::provider::retry::RetryPolicy;
use crate::provider::ModelProvider;
use crate::session::{MessagePart, SessionStore};

// ---------------------------------------------------------------------------
// Turn state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Composing,
    Streaming,
    AwaitingTool,
    AwaitingPermission,
    Retrying,
    Compacting,
    Finalizing,
    Done,
    Failed,
    Aborted,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnState::Idle => "idle",
            TurnState::Composing => "composing",
            TurnState::Streaming => "streaming",
            TurnState::AwaitingTool => "awaiting_tool",
            TurnState::AwaitingPermission => "awaiting_permission",
            TurnState::Retrying => "retrying",
            TurnState::Compacting => "compacting",
            TurnState::Finalizing => "finalizing",
            TurnState::Done => "done",
            TurnState::Failed => "failed",
            TurnState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Errors surfaced by `prompt`
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum EngineError {
    AgentNotFound(String),
    SessionNotFound(String),
    ModelUnavailable(String),
    Aborted,
    PermissionDenied(String),
    DuplicateAgent(String),
    Unrecoverable(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::AgentNotFound(name) => write!(f, "agent not found: {name}"),
            EngineError::SessionNotFound(id) => write!(f, "session not found: {id}"),
            EngineError::ModelUnavailable(e) => write!(f, "model unavailable: {e}"),
            EngineError::Aborted => write!(f, "turn aborted"),
            EngineError::PermissionDenied(tool) => write!(f, "permission denied: {tool}"),
            EngineError::DuplicateAgent(name) => {
                write!(f, "an agent named '{name}' already exists")
            }
            EngineError::Unrecoverable(e) => write!(f, "unrecoverable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

// ---------------------------------------------------------------------------
// Engine configuration and composition
// ---------------------------------------------------------------------------

pub struct EngineConfig {
    pub worktree: PathBuf,
    pub model: String,
    /// Tool-loop step budget per turn.
    pub max_steps: usize,
    /// Model context window in tokens; exceeding it triggers compaction.
    pub context_limit: u64,
    /// Token budget for the memory-context prompt addition.
    pub context_budget: u64,
    /// Most-recent message tokens never pruned by compaction.
    pub protected_recent_tokens: u64,
}

impl EngineConfig {
    pub fn new(worktree: PathBuf, model: &str) -> Self {
        Self {
            worktree,
            model: model.to_string(),
            max_steps: 50,
            context_limit: 200_000,
            context_budget: 4_000,
            protected_recent_tokens: 40_000,
        }
    }
}

/// The session-turn runtime. One process-wide instance; per-session turn
/// state lives in `turns` (abort tokens) and `session_rules`
/// (`allow_always` layers, swapped copy-on-write).
pub struct Engine {
    pub cfg: EngineConfig,
    pub provider: Arc<dyn ModelProvider>,
    pub registry: Arc<AgentRegistry>,
    pub tools: Arc<super::tools::ToolRegistry>,
    pub sessions: Arc<SessionStore>,
    pub bus: Arc<Bus>,
    pub hooks: Arc<HookPipeline>,
    pub asks: Arc<AskBroker>,
    pub memory: Arc<Memory>,
    pub retry: RetryPolicy,
    pub(crate) turns: std::sync::Mutex<HashMap<String, CancellationToken>>,
    pub(crate) session_rules: std::sync::RwLock<HashMap<String, Arc<Ruleset>>>,
}

/// What one provider stream produced, success or not.
pub(crate) struct StreamedReply {
    pub parts: Vec<MessagePart>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub end_turn: bool,
}

/// Terminal stream failure carrying any partial output for the message.
pub(crate) struct StreamFailure {
    pub error: crate::provider::ProviderError,
    pub partial: Vec<MessagePart>,
}
