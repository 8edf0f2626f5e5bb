use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

use crate::storage::Storage;
use crate::util;

/// One entry in the unified key-value memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: JsonValue,
    pub created_at: u64,
    pub updated_at: u64,
    pub accessed_at: u64,
    pub size: usize,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Unified KV memory on the record store. Entries are TTL-evictable and
/// LRU-trimmable to a cap; both sweeps run on demand, not on a timer.
pub struct KvStore {
    storage: Arc<Storage>,
}

impl KvStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn upsert(&self, key: &str, value: JsonValue, tags: Vec<String>) -> Result<MemoryEntry> {
        let now = util::now_ts_secs();
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        let entry = match self.storage.read_as::<MemoryEntry>(&["kv", key])? {
            Some(mut existing) => {
                existing.value = value;
                existing.updated_at = now;
                existing.accessed_at = now;
                existing.size = size;
                existing.tags = tags;
                existing
            }
            None => MemoryEntry {
                key: key.to_string(),
                value,
                created_at: now,
                updated_at: now,
                accessed_at: now,
                size,
                tags,
            },
        };
        self.storage.write_as(&["kv", key], &entry)?;
        Ok(entry)
    }

    /// Read an entry, refreshing its access time.
    pub fn get(&self, key: &str) -> Result<Option<MemoryEntry>> {
        let Some(mut entry) = self.storage.read_as::<MemoryEntry>(&["kv", key])? else {
            return Ok(None);
        };
        entry.accessed_at = util::now_ts_secs();
        self.storage.write_as(&["kv", key], &entry)?;
        Ok(Some(entry))
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        self.storage.remove(&["kv", key])
    }

    pub fn list(&self) -> Result<Vec<MemoryEntry>> {
        let mut entries = Vec::new();
        for key in self.storage.list(&["kv"])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(entry) = self.storage.read_as::<MemoryEntry>(&borrowed)? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Remove entries not updated within `ttl`. Returns removed count.
    pub fn evict_expired(&self, ttl: Duration) -> Result<usize> {
        let cutoff = util::now_ts_secs().saturating_sub(ttl.as_secs());
        let mut removed = 0;
        for entry in self.list()? {
            if entry.updated_at < cutoff {
                self.storage.remove(&["kv", &entry.key])?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Trim least-recently-accessed entries until at most `cap` remain.
    pub fn trim_to_cap(&self, cap: usize) -> Result<usize> {
        let mut entries = self.list()?;
        if entries.len() <= cap {
            return Ok(0);
        }
        entries.sort_by_key(|e| e.accessed_at);
        let excess = entries.len() - cap;
        for entry in &entries[..excess] {
            self.storage.remove(&["kv", &entry.key])?;
        }
        Ok(excess)
    }
}
