use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::storage::Storage;
use crate::util;

// ---------------------------------------------------------------------------
// Session and message model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Compaction splices summary messages into the history; `mode` tells the
/// prompt composer which is which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageMode {
    Normal,
    Compaction,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
        #[serde(default)]
        tokens: u64,
    },
    Reasoning {
        text: String,
        #[serde(default)]
        tokens: u64,
    },
    ToolCall {
        call_id: String,
        tool: String,
        input: JsonValue,
        #[serde(default)]
        tokens: u64,
    },
    ToolResult {
        call_id: String,
        tool: String,
        output: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        tokens: u64,
    },
}

impl MessagePart {
    pub fn tokens(&self) -> u64 {
        match self {
            MessagePart::Text { tokens, .. }
            | MessagePart::Reasoning { tokens, .. }
            | MessagePart::ToolCall { tokens, .. }
            | MessagePart::ToolResult { tokens, .. } => *tokens,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            MessagePart::ToolCall { call_id, .. } | MessagePart::ToolResult { call_id, .. } => {
                Some(call_id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub seq: u64,
    pub role: Role,
    pub mode: MessageMode,
    pub parts: Vec<MessagePart>,
    /// Provider-reported total; invariant: equals the sum over parts.
    pub tokens: u64,
    pub created_at: u64,
    /// Compaction messages only: sequence numbers their summary replaced.
    /// The prompt composer drops these from the transcript.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pruned_seqs: Vec<u64>,
}

impl Message {
    pub fn new(session_id: &str, role: Role, mode: MessageMode, parts: Vec<MessagePart>) -> Self {
        let tokens = parts.iter().map(MessagePart::tokens).sum();
        Self {
            id: util::new_id(),
            session_id: session_id.to_string(),
            seq: 0,
            role,
            mode,
            parts,
            tokens,
            created_at: util::now_ts_secs(),
            pruned_seqs: Vec::new(),
        }
    }

    pub fn user_text(session_id: &str, text: &str) -> Self {
        let tokens = estimate_tokens(text);
        Self::new(
            session_id,
            Role::User,
            MessageMode::Normal,
            vec![MessagePart::Text {
                text: text.to_string(),
                tokens,
            }],
        )
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text, .. } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

/// Rough token estimate for local bookkeeping: four chars per token,
/// rounded up. Provider-reported counts take precedence when present.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeInfo {
    pub created: u64,
    pub updated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub time: TimeInfo,
    /// Parent session for subagent child sessions.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Session this one was forked from, when applicable.
    #[serde(default)]
    pub forked_from: Option<String>,
    /// Next message sequence number.
    #[serde(default)]
    pub next_seq: u64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Session and message persistence on the record store.
///
/// Layout:
/// ```text
/// session/<project>/<session_id>.json
/// message/<session_id>/<seq>.json
/// ```
/// Messages are append-only; sessions mutate title/summary only.
pub struct SessionStore {
    storage: Arc<Storage>,
}

impl SessionStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn create(&self, project_id: &str, parent_id: Option<String>) -> Result<Session> {
        let now = util::now_ts_secs();
        let session = Session {
            id: util::new_id(),
            project_id: project_id.to_string(),
            title: "New session".to_string(),
            summary: None,
            time: TimeInfo {
                created: now,
                updated: now,
            },
            parent_id,
            forked_from: None,
            next_seq: 0,
        };
        self.persist(&session)?;
        Ok(session)
    }

    pub fn get(&self, project_id: &str, session_id: &str) -> Result<Option<Session>> {
        self.storage.read_as(&["session", project_id, session_id])
    }

    /// Look up a session when only its id is known (reply APIs).
    pub fn find(&self, session_id: &str) -> Result<Option<Session>> {
        for key in self.storage.list(&["session"])? {
            if key.last().map(String::as_str) == Some(session_id) {
                let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
                return self.storage.read_as(&borrowed);
            }
        }
        Ok(None)
    }

    pub fn list(&self, project_id: &str) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for key in self.storage.list(&["session", project_id])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(session) = self.storage.read_as::<Session>(&borrowed)? {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| b.time.created.cmp(&a.time.created));
        Ok(sessions)
    }

    pub fn set_title(&self, session: &mut Session, title: &str) -> Result<()> {
        session.title = title.to_string();
        self.touch(session)
    }

    pub fn set_summary(&self, session: &mut Session, summary: &str) -> Result<()> {
        session.summary = Some(summary.to_string());
        self.touch(session)
    }

    pub fn remove(&self, session: &Session) -> Result<()> {
        self.storage
            .remove(&["session", &session.project_id, &session.id])?;
        for key in self.storage.list(&["message", &session.id])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            self.storage.remove(&borrowed)?;
        }
        Ok(())
    }

    /// Append a message, assigning the next sequence number.
    pub fn append_message(&self, session: &mut Session, mut message: Message) -> Result<Message> {
        message.seq = session.next_seq;
        message.session_id = session.id.clone();
        let seq_key = format!("{:010}", message.seq);
        self.storage
            .write_as(&["message", &session.id, &seq_key], &message)?;
        session.next_seq += 1;
        self.touch(session)?;
        Ok(message)
    }

    pub fn messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for key in self.storage.list(&["message", session_id])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(message) = self.storage.read_as::<Message>(&borrowed)? {
                messages.push(message);
            }
        }
        messages.sort_by_key(|m| m.seq);
        Ok(messages)
    }

    /// Fork a session at a message: the new session holds copies of all
    /// messages up to and including `at_message_id` and records its origin.
    /// Later writes to either session do not affect the other.
    pub fn fork(&self, session: &Session, at_message_id: &str) -> Result<Session> {
        let messages = self.messages(&session.id)?;
        let cut = messages
            .iter()
            .position(|m| m.id == at_message_id)
            .ok_or_else(|| anyhow::anyhow!("message not found in session: {at_message_id}"))?;

        let now = util::now_ts_secs();
        let mut forked = Session {
            id: util::new_id(),
            project_id: session.project_id.clone(),
            title: session.title.clone(),
            summary: None,
            time: TimeInfo {
                created: now,
                updated: now,
            },
            parent_id: session.parent_id.clone(),
            forked_from: Some(session.id.clone()),
            next_seq: 0,
        };
        self.persist(&forked)?;
        for message in &messages[..=cut] {
            let mut copy = message.clone();
            copy.id = util::new_id();
            self.append_message(&mut forked, copy)?;
        }
        Ok(forked)
    }

    pub fn persist(&self, session: &Session) -> Result<()> {
        if session.time.created > session.time.updated {
            bail!("session updated time precedes created time");
        }
        self.storage
            .write_as(&["session", &session.project_id, &session.id], session)
    }

    fn touch(&self, session: &mut Session) -> Result<()> {
        session.time.updated = session.time.updated.max(util::now_ts_secs());
        self.persist(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(tmp.path().join("memory")).unwrap());
        (tmp, SessionStore::new(storage))
    }

    #[test]
    fn test_create_and_list() {
        let (_tmp, store) = store();
        let a = store.create("proj", None).unwrap();
        let b = store.create("proj", None).unwrap();
        let listed = store.list("proj").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|s| s.id == a.id));
        assert!(listed.iter().any(|s| s.id == b.id));
        assert!(a.time.created <= a.time.updated);
    }

    #[test]
    fn test_messages_keep_order() {
        let (_tmp, store) = store();
        let mut session = store.create("proj", None).unwrap();
        for i in 0..5 {
            let message = Message::user_text(&session.id, &format!("m{i}"));
            store.append_message(&mut session, message).unwrap();
        }
        let messages = store.messages(&session.id).unwrap();
        assert_eq!(messages.len(), 5);
        for (i, m) in messages.iter().enumerate() {
            assert_eq!(m.seq, i as u64);
            assert_eq!(m.text(), format!("m{i}"));
        }
    }

    #[test]
    fn test_message_token_sum_invariant() {
        let msg = Message::new(
            "s",
            Role::Assistant,
            MessageMode::Normal,
            vec![
                MessagePart::Text {
                    text: "hello".into(),
                    tokens: 7,
                },
                MessagePart::ToolCall {
                    call_id: "c1".into(),
                    tool: "read".into(),
                    input: serde_json::json!({}),
                    tokens: 3,
                },
            ],
        );
        assert_eq!(msg.tokens, 10);
    }

    #[test]
    fn test_fork_copies_prefix_and_isolates() {
        let (_tmp, store) = store();
        let mut session = store.create("proj", None).unwrap();
        let mut ids = Vec::new();
        for text in ["u1", "a1", "u2", "a2"] {
            let message = Message::user_text(&session.id, text);
            let m = store.append_message(&mut session, message).unwrap();
            ids.push(m.id);
        }

        let forked = store.fork(&session, &ids[2]).unwrap();
        assert_eq!(forked.forked_from.as_deref(), Some(session.id.as_str()));
        let forked_messages = store.messages(&forked.id).unwrap();
        assert_eq!(
            forked_messages.iter().map(Message::text).collect::<Vec<_>>(),
            vec!["u1", "a1", "u2"]
        );

        // Parent appends do not leak into the fork.
        let message = Message::user_text(&session.id, "u3");
        store.append_message(&mut session, message).unwrap();
        assert_eq!(store.messages(&forked.id).unwrap().len(), 3);
    }

    #[test]
    fn test_fork_unknown_message_fails() {
        let (_tmp, store) = store();
        let session = store.create("proj", None).unwrap();
        assert!(store.fork(&session, "missing").is_err());
    }

    #[test]
    fn test_remove_deletes_messages() {
        let (_tmp, store) = store();
        let mut session = store.create("proj", None).unwrap();
        let message = Message::user_text(&session.id, "hi");
        store.append_message(&mut session, message).unwrap();
        store.remove(&session).unwrap();
        assert!(store.get("proj", &session.id).unwrap().is_none());
        assert!(store.messages(&session.id).unwrap().is_empty());
    }
}
