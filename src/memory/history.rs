use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::Storage;
use crate::util;

// ---------------------------------------------------------------------------
// Edit history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Create,
    Update,
    Delete,
    Move,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditedFile {
    pub path: String,
    pub op: FileOp,
    pub additions: usize,
    pub deletions: usize,
    #[serde(default)]
    pub hash_before: Option<String>,
    #[serde(default)]
    pub hash_after: Option<String>,
}

/// Appended on every successful write-class tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRecord {
    pub id: String,
    pub session_id: String,
    pub timestamp: u64,
    pub files: Vec<EditedFile>,
    pub agent: String,
    pub model: String,
    pub tokens: u64,
    pub duration_ms: u64,
}

pub struct EditHistory {
    storage: Arc<Storage>,
}

impl EditHistory {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn append(
        &self,
        session_id: &str,
        files: Vec<EditedFile>,
        agent: &str,
        model: &str,
        tokens: u64,
        duration_ms: u64,
    ) -> Result<EditRecord> {
        let record = EditRecord {
            id: util::new_id(),
            session_id: session_id.to_string(),
            timestamp: util::now_ts_millis(),
            files,
            agent: agent.to_string(),
            model: model.to_string(),
            tokens,
            duration_ms,
        };
        let ts_key = format!("{:016}", record.timestamp);
        self.storage
            .write_as(&["edits", session_id, &ts_key], &record)?;
        Ok(record)
    }

    /// Most recent edits across all sessions, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<EditRecord>> {
        let mut records = Vec::new();
        for key in self.storage.list(&["edits"])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(record) = self.storage.read_as::<EditRecord>(&borrowed)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }

    pub fn for_session(&self, session_id: &str) -> Result<Vec<EditRecord>> {
        let mut records = Vec::new();
        for key in self.storage.list(&["edits", session_id])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(record) = self.storage.read_as::<EditRecord>(&borrowed)? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}
