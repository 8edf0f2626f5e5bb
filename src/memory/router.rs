use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::context::ContextBuilder;
use super::kv::KvStore;
use super::markdown::{category_for, MarkdownMemory};
use super::preferences::PreferenceStore;
use crate::util;

// ---------------------------------------------------------------------------
// Routed writes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryWriteType {
    Preference,
    Decision,
    Lesson,
    Context,
    Daily,
    Pattern,
}

impl MemoryWriteType {
    fn as_str(self) -> &'static str {
        match self {
            MemoryWriteType::Preference => "preference",
            MemoryWriteType::Decision => "decision",
            MemoryWriteType::Lesson => "lesson",
            MemoryWriteType::Context => "context",
            MemoryWriteType::Daily => "daily",
            MemoryWriteType::Pattern => "pattern",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryWrite {
    pub write_type: MemoryWriteType,
    pub content: String,
    /// Pattern writes: category and name; ignored otherwise.
    pub category: Option<String>,
    pub name: Option<String>,
    pub file: Option<String>,
    pub tags: Vec<String>,
}

impl MemoryWrite {
    pub fn new(write_type: MemoryWriteType, content: &str) -> Self {
        Self {
            write_type,
            content: content.to_string(),
            category: None,
            name: None,
            file: None,
            tags: Vec::new(),
        }
    }

    pub fn pattern(category: &str, name: &str, template: &str, file: Option<&str>) -> Self {
        Self {
            write_type: MemoryWriteType::Pattern,
            content: template.to_string(),
            category: Some(category.to_string()),
            name: Some(name.to_string()),
            file: file.map(str::to_string),
            tags: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Single public write entry over the layered stores. One call guarantees
/// the write lands in every appropriate store and that the context cache
/// reflects it; callers never touch the stores directly.
pub struct MemoryRouter {
    kv: Arc<KvStore>,
    markdown: Arc<MarkdownMemory>,
    preferences: Arc<PreferenceStore>,
    context: Arc<ContextBuilder>,
}

impl MemoryRouter {
    pub fn new(
        kv: Arc<KvStore>,
        markdown: Arc<MarkdownMemory>,
        preferences: Arc<PreferenceStore>,
        context: Arc<ContextBuilder>,
    ) -> Self {
        Self {
            kv,
            markdown,
            preferences,
            context,
        }
    }

    pub fn write(&self, entry: &MemoryWrite) -> Result<()> {
        let type_str = entry.write_type.as_str();
        match entry.write_type {
            MemoryWriteType::Preference
            | MemoryWriteType::Decision
            | MemoryWriteType::Lesson
            | MemoryWriteType::Context => {
                self.markdown
                    .merge_category(category_for(type_str), &entry.content)?;
                self.kv_upsert(type_str, entry)?;
                self.context.invalidate();
            }
            MemoryWriteType::Daily => {
                let date = self.markdown.append_daily(&entry.content)?;
                let key = format!("daily/{date}/{:08x}", util::fnv1a_64(entry.content.as_bytes()));
                self.kv
                    .upsert(&key, json!({ "content": entry.content }), entry.tags.clone())?;
                self.context.invalidate();
            }
            MemoryWriteType::Pattern => {
                let category = entry.category.as_deref().unwrap_or("general");
                let name = entry
                    .name
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("pattern write requires a name"))?;
                self.preferences.record_pattern(
                    category,
                    name,
                    &entry.content,
                    entry.file.as_deref(),
                )?;
                // Learned patterns feed the context lazily; no invalidation.
            }
        }
        Ok(())
    }

    /// Batch write; entries resolve independently and one failure never
    /// rolls back the rest.
    pub fn write_batch(&self, entries: &[MemoryWrite]) -> Vec<Result<()>> {
        entries.iter().map(|entry| self.write(entry)).collect()
    }

    fn kv_upsert(&self, type_str: &str, entry: &MemoryWrite) -> Result<()> {
        let key = format!(
            "{type_str}/{:08x}",
            util::fnv1a_64(entry.content.as_bytes())
        );
        self.kv.upsert(
            &key,
            json!({ "content": entry.content, "type": type_str }),
            entry.tags.clone(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::causal::CausalStore;
    use crate::memory::history::EditHistory;
    use crate::memory::knowledge::KnowledgeStore;
    use crate::memory::style::StyleLearner;
    use crate::memory::vector::{HashEmbedder, VectorIndex};
    use crate::memory::context::ContextOptions;
    use crate::storage::Storage;

    fn router() -> (tempfile::TempDir, MemoryRouter, Arc<ContextBuilder>, Arc<KvStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(tmp.path().join("memory")).unwrap());
        let kv = Arc::new(KvStore::new(storage.clone()));
        let preferences = Arc::new(PreferenceStore::new(storage.clone()));
        let style = Arc::new(StyleLearner::new(storage.clone(), preferences.clone()));
        let knowledge = Arc::new(KnowledgeStore::new(storage.clone()));
        let markdown = Arc::new(MarkdownMemory::new(tmp.path().join("memory")).unwrap());
        let edits = Arc::new(EditHistory::new(storage.clone()));
        let causal = Arc::new(CausalStore::new(storage.clone(), "proj-1"));
        let vectors = Arc::new(VectorIndex::new(storage, Arc::new(HashEmbedder::default())));
        let context = Arc::new(ContextBuilder::new(
            "proj-1",
            preferences.clone(),
            style,
            knowledge,
            markdown.clone(),
            edits,
            causal,
            vectors,
        ));
        let router = MemoryRouter::new(kv.clone(), markdown, preferences, context.clone());
        (tmp, router, context, kv)
    }

    #[test]
    fn test_dual_write_and_cache_invalidation() {
        let (_tmp, router, context, kv) = router();
        let options = ContextOptions::default();
        let before = context.build(&options);
        assert!(!before.markdown.contains("prefers tabs"));

        router
            .write(&MemoryWrite::new(
                MemoryWriteType::Preference,
                "prefers tabs",
            ))
            .unwrap();

        // A fresh build (cache invalidated) reflects the write.
        let after = context.build(&options);
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.markdown.contains("prefers tabs"));

        // KV side landed too.
        let entries = kv.list().unwrap();
        assert!(entries
            .iter()
            .any(|e| e.value["content"] == "prefers tabs"));
    }

    #[test]
    fn test_daily_routing() {
        let (_tmp, router, context, kv) = router();
        router
            .write(&MemoryWrite::new(MemoryWriteType::Daily, "shipped the fix"))
            .unwrap();
        let built = context.build(&ContextOptions::default());
        assert!(built.markdown.contains("shipped the fix"));
        assert!(kv
            .list()
            .unwrap()
            .iter()
            .any(|e| e.key.starts_with("daily/")));
    }

    #[test]
    fn test_pattern_routing_skips_cache() {
        let (_tmp, router, context, _kv) = router();
        let before = context.build(&ContextOptions::default());
        router
            .write(&MemoryWrite::pattern(
                "error-handling",
                "context-wrap",
                "err.with_context(...)",
                Some("src/a.rs"),
            ))
            .unwrap();
        // Pattern writes do not invalidate the context cache.
        let after = context.build(&ContextOptions::default());
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_batch_resolves_independently() {
        let (_tmp, router, _context, _kv) = router();
        let results = router.write_batch(&[
            MemoryWrite::new(MemoryWriteType::Lesson, "test before refactor"),
            MemoryWrite {
                write_type: MemoryWriteType::Pattern,
                content: "tpl".into(),
                category: None,
                name: None, // invalid: no name
                file: None,
                tags: vec![],
            },
            MemoryWrite::new(MemoryWriteType::Decision, "chose sqlite"),
        ]);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }
}
