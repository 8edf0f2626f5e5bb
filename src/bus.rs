use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::permission::requests::PermissionRequest;

/// Progress phases reported by the writer supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterAction {
    Outline,
    ChapterStart,
    ChapterComplete,
    Complete,
    Error,
}

/// Every event kind the core publishes. Serialized tags match the external
/// API surface (`session.message.updated`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "session.message.updated")]
    SessionMessageUpdated {
        session_id: String,
        message_id: String,
    },
    #[serde(rename = "session.message.part.updated")]
    SessionMessagePartUpdated {
        session_id: String,
        message_id: String,
        part_index: usize,
        part: serde_json::Value,
    },
    #[serde(rename = "session.idle")]
    SessionIdle { session_id: String },
    #[serde(rename = "session.error")]
    SessionError {
        session_id: String,
        error: String,
    },
    #[serde(rename = "permission.updated")]
    PermissionUpdated { request: PermissionRequest },
    #[serde(rename = "tool.execution.started")]
    ToolExecutionStarted {
        session_id: String,
        call_id: String,
        tool: String,
    },
    #[serde(rename = "tool.execution.completed")]
    ToolExecutionCompleted {
        session_id: String,
        call_id: String,
        tool: String,
        duration_ms: u64,
        ok: bool,
    },
    #[serde(rename = "writer.progress")]
    WriterProgress {
        session_id: String,
        action: WriterAction,
        detail: Option<String>,
    },
}

impl Event {
    /// Session this event belongs to, when it has one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::SessionMessageUpdated { session_id, .. }
            | Event::SessionMessagePartUpdated { session_id, .. }
            | Event::SessionIdle { session_id }
            | Event::SessionError { session_id, .. }
            | Event::ToolExecutionStarted { session_id, .. }
            | Event::ToolExecutionCompleted { session_id, .. }
            | Event::WriterProgress { session_id, .. } => Some(session_id),
            Event::PermissionUpdated { request } => Some(&request.session_id),
        }
    }
}

/// Process-wide publish/subscribe fan-out. Publication order is preserved
/// for subscribers within the channel's capacity; slow subscribers observe
/// `Lagged` and resume from the current tail.
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        debug!("bus publish: {:?}", event.session_id());
        // No subscribers is not an error; events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Streamable subscription used by the external API surface.
    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe_order() {
        let bus = Bus::new();
        let mut rx = bus.subscribe();
        for i in 0..3 {
            bus.publish(Event::SessionIdle {
                session_id: format!("s{i}"),
            });
        }
        for i in 0..3 {
            match rx.recv().await.unwrap() {
                Event::SessionIdle { session_id } => assert_eq!(session_id, format!("s{i}")),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = Bus::new();
        bus.publish(Event::SessionIdle {
            session_id: "s".into(),
        });
    }

    #[test]
    fn test_event_serialized_tags() {
        let event = Event::SessionIdle {
            session_id: "s1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session.idle");

        let event = Event::ToolExecutionCompleted {
            session_id: "s1".into(),
            call_id: "c1".into(),
            tool: "read".into(),
            duration_ms: 5,
            ok: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool.execution.completed");
    }
}
