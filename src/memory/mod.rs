pub mod callgraph;
pub mod causal;
pub mod context;
pub mod history;
pub mod knowledge;
pub mod kv;
pub mod markdown;
pub mod preferences;
pub mod router;
pub mod semantic;
pub mod style;
pub mod vector;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::storage::Storage;

/// The layered memory stack for one project, composed once at startup and
/// shared by the runtime, the router, and the context builder.
pub struct Memory {
    pub storage: Arc<Storage>,
    pub kv: Arc<kv::KvStore>,
    pub preferences: Arc<preferences::PreferenceStore>,
    pub style: Arc<style::StyleLearner>,
    pub knowledge: Arc<knowledge::KnowledgeStore>,
    pub markdown: Arc<markdown::MarkdownMemory>,
    pub edits: Arc<history::EditHistory>,
    pub causal: Arc<causal::CausalStore>,
    pub vectors: Arc<vector::VectorIndex>,
    pub context: Arc<context::ContextBuilder>,
    pub router: Arc<router::MemoryRouter>,
}

impl Memory {
    /// Open every store under `<data-root>/memory` for a project. The
    /// default embedder is the deterministic hash fallback.
    pub fn open(data_root: &Path, project_id: &str) -> Result<Self> {
        let memory_root = crate::paths::memory_dir(data_root);
        let storage = Arc::new(Storage::open(memory_root.clone())?);
        let kv = Arc::new(kv::KvStore::new(storage.clone()));
        let preferences = Arc::new(preferences::PreferenceStore::new(storage.clone()));
        let style = Arc::new(style::StyleLearner::new(
            storage.clone(),
            preferences.clone(),
        ));
        let knowledge = Arc::new(knowledge::KnowledgeStore::new(storage.clone()));
        let markdown = Arc::new(markdown::MarkdownMemory::new(memory_root)?);
        let edits = Arc::new(history::EditHistory::new(storage.clone()));
        let causal = Arc::new(causal::CausalStore::new(storage.clone(), project_id));
        let vectors = Arc::new(vector::VectorIndex::new(
            storage.clone(),
            Arc::new(vector::HashEmbedder::default()),
        ));
        let context = Arc::new(context::ContextBuilder::new(
            project_id,
            preferences.clone(),
            style.clone(),
            knowledge.clone(),
            markdown.clone(),
            edits.clone(),
            causal.clone(),
            vectors.clone(),
        ));
        let router = Arc::new(router::MemoryRouter::new(
            kv.clone(),
            markdown.clone(),
            preferences.clone(),
            context.clone(),
        ));
        Ok(Self {
            storage,
            kv,
            preferences,
            style,
            knowledge,
            markdown,
            edits,
            causal,
            vectors,
            context,
            router,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_composes_all_stores() {
        let tmp = tempfile::tempdir().unwrap();
        let memory = Memory::open(tmp.path(), "proj-1").unwrap();
        memory
            .router
            .write(&router::MemoryWrite::new(
                router::MemoryWriteType::Lesson,
                "compose once, inject everywhere",
            ))
            .unwrap();
        let built = memory.context.build(&context::ContextOptions::default());
        assert!(built.markdown.contains("compose once"));
    }
}
