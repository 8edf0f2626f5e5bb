use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::storage::Storage;
use crate::util;

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

/// Text → dense vector. Implementations may call a model endpoint; the
/// default below is a deterministic hash embedder so relevance ranking is
/// stable with no model configured. Swap it for a real embedder via the
/// trait when one is available.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic fallback: token FNV hashes bucketed into a fixed-width
/// vector, L2-normalized. The same text always embeds identically.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let lower = token.to_lowercase();
            let hash = util::fnv1a_64(lower.as_bytes());
            let bucket = (hash % self.dims as u64) as usize;
            // A second hash decides the sign so buckets don't only grow.
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEmbedding {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

pub struct VectorIndex {
    storage: Arc<Storage>,
    embedder: Arc<dyn Embedder>,
}

impl VectorIndex {
    pub fn new(storage: Arc<Storage>, embedder: Arc<dyn Embedder>) -> Self {
        Self { storage, embedder }
    }

    pub fn index(
        &self,
        text: &str,
        file: Option<&str>,
        kind: Option<&str>,
        line: Option<u32>,
    ) -> Result<VectorEmbedding> {
        let embedding = VectorEmbedding {
            id: util::new_id(),
            text: util::truncate_chars(text, 2000),
            vector: self.embedder.embed(text),
            file: file.map(str::to_string),
            kind: kind.map(str::to_string),
            line,
            created_at: util::now_ts_secs(),
        };
        self.storage
            .write_as(&["vector", &embedding.id], &embedding)?;
        Ok(embedding)
    }

    /// Top-k cosine matches for a query, best first.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<(VectorEmbedding, f32)>> {
        let query_vec = self.embedder.embed(query);
        let mut scored = Vec::new();
        for entry in self.all()? {
            let score = cosine(&query_vec, &entry.vector);
            scored.push((entry, score));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Drop every embedding indexed from a file (bulk removal on re-index).
    pub fn remove_by_file(&self, file: &str) -> Result<usize> {
        let mut removed = 0;
        for entry in self.all()? {
            if entry.file.as_deref() == Some(file) {
                self.storage.remove(&["vector", &entry.id])?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop embeddings older than `ttl`.
    pub fn cleanup_older_than(&self, ttl: Duration) -> Result<usize> {
        let cutoff = util::now_ts_secs().saturating_sub(ttl.as_secs());
        let mut removed = 0;
        for entry in self.all()? {
            if entry.created_at < cutoff {
                self.storage.remove(&["vector", &entry.id])?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.storage.list(&["vector"])?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn all(&self) -> Result<Vec<VectorEmbedding>> {
        let mut out = Vec::new();
        for key in self.storage.list(&["vector"])? {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(entry) = self.storage.read_as::<VectorEmbedding>(&borrowed)? {
                out.push(entry);
            }
        }
        Ok(out)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
