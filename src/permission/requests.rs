use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::info;

use crate::bus::{Bus, Event};
use crate::permission::PermissionKind;
use crate::storage::Storage;
use crate::util;

// ---------------------------------------------------------------------------
// Persisted ask requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Answered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    pub tool: String,
    pub kind: PermissionKind,
    /// Snapshot of the tool input at ask time.
    pub input: JsonValue,
    /// Patterns derived from the input, used for `allow_always` rules.
    pub patterns: Vec<String>,
    pub status: RequestStatus,
    pub created_at: u64,
}

impl PermissionRequest {
    pub fn new(
        session_id: &str,
        message_id: &str,
        tool: &str,
        kind: PermissionKind,
        input: JsonValue,
    ) -> Self {
        let patterns = derive_patterns(kind, &input);
        Self {
            id: util::new_id(),
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            tool: tool.to_string(),
            kind,
            input,
            patterns,
            status: RequestStatus::Pending,
            created_at: util::now_ts_secs(),
        }
    }
}

/// Patterns an `allow_always` reply turns into session rules.
/// Bash commands generalize to their leading word; paths stay literal.
pub fn derive_patterns(kind: PermissionKind, input: &JsonValue) -> Vec<String> {
    match kind {
        PermissionKind::Bash => {
            let command = input
                .get("command")
                .or_else(|| input.get("cmd"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            match command.split_whitespace().next() {
                Some(word) => vec![format!("{word} *")],
                None => vec!["*".to_string()],
            }
        }
        PermissionKind::Webfetch => input
            .get("url")
            .and_then(|v| v.as_str())
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(|h| vec![format!("*://{h}/*")]))
            .unwrap_or_else(|| vec!["*".to_string()]),
        k if k.is_path_scoped() => input
            .get("path")
            .or_else(|| input.get("file_path"))
            .and_then(|v| v.as_str())
            .map(|p| vec![p.to_string()])
            .unwrap_or_else(|| vec!["*".to_string()]),
        _ => vec!["*".to_string()],
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionReply {
    AllowOnce,
    AllowAlways,
    Deny,
}

#[derive(Debug, Clone)]
pub struct ReplyOutcome {
    pub reply: PermissionReply,
    pub message: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReplyError {
    UnknownRequestId(String),
    AlreadyAnswered(String),
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyError::UnknownRequestId(id) => write!(f, "unknown permission request: {id}"),
            ReplyError::AlreadyAnswered(id) => {
                write!(f, "permission request already answered: {id}")
            }
        }
    }
}

impl std::error::Error for ReplyError {}

// ---------------------------------------------------------------------------
// Broker: persistence + suspension + reply routing
// ---------------------------------------------------------------------------

/// Pending-ask broker. An `ask` verdict persists a request, publishes it on
/// the bus, and suspends the turn on a oneshot until `reply` resolves it.
pub struct AskBroker {
    storage: Arc<Storage>,
    bus: Arc<Bus>,
    pending: Mutex<HashMap<String, oneshot::Sender<ReplyOutcome>>>,
}

impl AskBroker {
    pub fn new(storage: Arc<Storage>, bus: Arc<Bus>) -> Self {
        Self {
            storage,
            bus,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Persist and publish a request; the receiver resolves when the user
    /// replies. A dropped sender (session cleanup) reads as deny.
    pub async fn submit(&self, request: PermissionRequest) -> Result<oneshot::Receiver<ReplyOutcome>> {
        self.storage
            .write_as(&["permission", &request.id], &request)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request.id.clone(), tx);
        info!(
            "Permission ask: tool={} kind={} id={}",
            request.tool, request.kind, request.id
        );
        self.bus.publish(Event::PermissionUpdated { request });
        Ok(rx)
    }

    pub async fn reply(
        &self,
        request_id: &str,
        reply: PermissionReply,
        message: Option<String>,
    ) -> Result<PermissionRequest, ReplyError> {
        let mut request: PermissionRequest = self
            .storage
            .read_as(&["permission", request_id])
            .ok()
            .flatten()
            .ok_or_else(|| ReplyError::UnknownRequestId(request_id.to_string()))?;
        if request.status == RequestStatus::Answered {
            return Err(ReplyError::AlreadyAnswered(request_id.to_string()));
        }
        request.status = RequestStatus::Answered;
        let _ = self.storage.write_as(&["permission", request_id], &request);

        if let Some(tx) = self.pending.lock().await.remove(request_id) {
            // Turn may have been aborted meanwhile; a closed receiver is fine.
            let _ = tx.send(ReplyOutcome { reply, message });
        }
        Ok(request)
    }

    /// Drop pending requests for a session (cleanup on session removal).
    /// Suspended turns observe the closed channel as deny.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<usize> {
        let mut removed = 0;
        for key in self.storage.list(&["permission"])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(request) = self.storage.read_as::<PermissionRequest>(&borrowed)? {
                if request.session_id == session_id {
                    self.storage.remove(&borrowed)?;
                    self.pending.lock().await.remove(&request.id);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker() -> (tempfile::TempDir, AskBroker) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(tmp.path().join("memory")).unwrap());
        let bus = Arc::new(Bus::new());
        (tmp, AskBroker::new(storage, bus))
    }

    fn request() -> PermissionRequest {
        PermissionRequest::new(
            "sess-1",
            "msg-1",
            "read",
            PermissionKind::Read,
            json!({ "path": "./.env" }),
        )
    }

    #[tokio::test]
    async fn test_ask_allow_once_flow() {
        let (_tmp, broker) = broker();
        let req = request();
        let id = req.id.clone();
        let rx = broker.submit(req).await.unwrap();

        broker
            .reply(&id, PermissionReply::AllowOnce, None)
            .await
            .unwrap();
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.reply, PermissionReply::AllowOnce);
        assert!(outcome.message.is_none());
    }

    #[tokio::test]
    async fn test_deny_carries_message() {
        let (_tmp, broker) = broker();
        let req = request();
        let id = req.id.clone();
        let rx = broker.submit(req).await.unwrap();

        broker
            .reply(&id, PermissionReply::Deny, Some("nope".into()))
            .await
            .unwrap();
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.reply, PermissionReply::Deny);
        assert_eq!(outcome.message.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_reply_errors() {
        let (_tmp, broker) = broker();
        let err = broker
            .reply("missing", PermissionReply::AllowOnce, None)
            .await
            .unwrap_err();
        assert_eq!(err, ReplyError::UnknownRequestId("missing".to_string()));

        let req = request();
        let id = req.id.clone();
        let _rx = broker.submit(req).await.unwrap();
        broker
            .reply(&id, PermissionReply::AllowOnce, None)
            .await
            .unwrap();
        let err = broker
            .reply(&id, PermissionReply::Deny, None)
            .await
            .unwrap_err();
        assert_eq!(err, ReplyError::AlreadyAnswered(id));
    }

    #[tokio::test]
    async fn test_cleanup_session() {
        let (_tmp, broker) = broker();
        let req = request();
        let _rx = broker.submit(req).await.unwrap();
        assert_eq!(broker.pending_count().await, 1);
        let removed = broker.cleanup_session("sess-1").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(broker.pending_count().await, 0);
    }

    #[test]
    fn test_derive_patterns() {
        let bash = derive_patterns(PermissionKind::Bash, &json!({ "command": "git push origin" }));
        assert_eq!(bash, vec!["git *".to_string()]);
        let read = derive_patterns(PermissionKind::Read, &json!({ "path": "src/lib.rs" }));
        assert_eq!(read, vec!["src/lib.rs".to_string()]);
        let fetch = derive_patterns(
            PermissionKind::Webfetch,
            &json!({ "url": "https://example.com/docs" }),
        );
        assert_eq!(fetch, vec!["*://example.com/*".to_string()]);
    }
}
