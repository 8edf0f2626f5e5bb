use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

use super::causal::CausalStore;
use super::history::EditHistory;
use super::knowledge::{KnowledgeCounts, KnowledgeStore};
use super::markdown::MarkdownMemory;
use super::preferences::{LearnedPattern, PreferenceStore};
use super::style::StyleLearner;
use super::vector::VectorIndex;
use crate::util;

// ---------------------------------------------------------------------------
// Options and snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub task: Option<String>,
    pub file_paths: Vec<String>,
    /// Daily notes to include; defaults to 3.
    pub include_days: Option<usize>,
    pub skip_cache: bool,
}

impl ContextOptions {
    fn include_days(&self) -> usize {
        self.include_days.unwrap_or(3)
    }

    fn cache_hash(&self) -> u64 {
        let mut paths = self.file_paths.clone();
        paths.sort();
        let key = format!(
            "{}|{}|{}",
            self.task.as_deref().unwrap_or(""),
            paths.join(","),
            self.include_days()
        );
        util::fnv1a_64(key.as_bytes())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelevantFile {
    pub path: String,
    pub reason: String,
    /// At most 200 chars.
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentEdit {
    pub file: String,
    pub minutes_ago: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentDecision {
    pub title: String,
    pub agent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TechnicalContext {
    pub fingerprint: String,
    pub code_style: String,
    pub learned_patterns: Vec<LearnedPattern>,
    pub knowledge: KnowledgeCounts,
    pub relevant_files: Vec<RelevantFile>,
    pub recent_edits: Vec<RecentEdit>,
    pub recent_decisions: Vec<RecentDecision>,
}

#[derive(Debug, Clone)]
pub struct MemoryContext {
    pub technical: TechnicalContext,
    pub markdown: String,
    pub formatted: String,
}

struct CacheSlot {
    hash: u64,
    built_at: Instant,
    value: Arc<MemoryContext>,
}

const CACHE_TTL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds the per-turn prompt supplement. Single-slot cache keyed by an
/// options hash, TTL 30 s; the memory router invalidates it on writes.
/// Sub-fetch failures degrade to defaults and never reach the caller.
pub struct ContextBuilder {
    project_id: String,
    preferences: Arc<PreferenceStore>,
    style: Arc<StyleLearner>,
    knowledge: Arc<KnowledgeStore>,
    markdown: Arc<MarkdownMemory>,
    edits: Arc<EditHistory>,
    causal: Arc<CausalStore>,
    vectors: Arc<VectorIndex>,
    cache: Mutex<Option<CacheSlot>>,
}

impl ContextBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: &str,
        preferences: Arc<PreferenceStore>,
        style: Arc<StyleLearner>,
        knowledge: Arc<KnowledgeStore>,
        markdown: Arc<MarkdownMemory>,
        edits: Arc<EditHistory>,
        causal: Arc<CausalStore>,
        vectors: Arc<VectorIndex>,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            preferences,
            style,
            knowledge,
            markdown,
            edits,
            causal,
            vectors,
            cache: Mutex::new(None),
        }
    }

    pub fn build(&self, options: &ContextOptions) -> Arc<MemoryContext> {
        let hash = options.cache_hash();
        if !options.skip_cache {
            let slot = self.cache.lock().expect("context cache lock");
            if let Some(cached) = slot.as_ref() {
                if cached.hash == hash && cached.built_at.elapsed() < CACHE_TTL {
                    return cached.value.clone();
                }
            }
        }

        let technical = self.build_technical(options);
        let markdown = self.build_markdown(options);
        let formatted = render(&technical, &markdown);
        let context = Arc::new(MemoryContext {
            technical,
            markdown,
            formatted,
        });

        *self.cache.lock().expect("context cache lock") = Some(CacheSlot {
            hash,
            built_at: Instant::now(),
            value: context.clone(),
        });
        context
    }

    /// Drop the cached snapshot; the next build refetches everything.
    pub fn invalidate(&self) {
        *self.cache.lock().expect("context cache lock") = None;
    }

    fn build_technical(&self, options: &ContextOptions) -> TechnicalContext {
        let knowledge = self.knowledge.counts().unwrap_or_else(|e| {
            warn!("knowledge counts unavailable: {e}");
            KnowledgeCounts::default()
        });
        let code_style = self.style.summarize().unwrap_or_else(|e| {
            warn!("style summary unavailable: {e}");
            "no style signals yet".to_string()
        });
        let learned_patterns = self.preferences.top_patterns(5).unwrap_or_else(|e| {
            warn!("learned patterns unavailable: {e}");
            Vec::new()
        });
        let recent_edits = self.recent_edits();
        let recent_decisions = self.recent_decisions();
        let relevant_files = self.relevant_files(options);
        let fingerprint = format!(
            "{}: {} endpoints, {} models, {} components",
            self.project_id, knowledge.endpoints, knowledge.models, knowledge.components
        );
        TechnicalContext {
            fingerprint,
            code_style,
            learned_patterns,
            knowledge,
            relevant_files,
            recent_edits,
            recent_decisions,
        }
    }

    fn build_markdown(&self, options: &ContextOptions) -> String {
        let mut out = self.markdown.read_long_term().unwrap_or_else(|e| {
            warn!("long-term notes unavailable: {e}");
            String::new()
        });
        match self.markdown.read_recent_daily(options.include_days()) {
            Ok(days) => {
                for (date, content) in days {
                    out.push_str(&format!("\n## Daily {date}\n{content}"));
                }
            }
            Err(e) => warn!("daily notes unavailable: {e}"),
        }
        out
    }

    fn recent_edits(&self) -> Vec<RecentEdit> {
        let now = util::now_ts_millis();
        match self.edits.recent(5) {
            Ok(records) => records
                .iter()
                .filter_map(|r| {
                    let file = r.files.first().map(|f| f.path.clone())?;
                    let minutes_ago = now.saturating_sub(r.timestamp) / 60_000;
                    Some(RecentEdit { file, minutes_ago })
                })
                .collect(),
            Err(e) => {
                warn!("recent edits unavailable: {e}");
                Vec::new()
            }
        }
    }

    fn recent_decisions(&self) -> Vec<RecentDecision> {
        match self.causal.query(&super::causal::CausalQuery::default()) {
            Ok(mut chains) => {
                chains.reverse();
                chains
                    .into_iter()
                    .take(5)
                    .map(|c| RecentDecision {
                        title: util::truncate_chars(&c.decision.prompt, 80),
                        agent: c.decision.agent_id,
                    })
                    .collect()
            }
            Err(e) => {
                warn!("recent decisions unavailable: {e}");
                Vec::new()
            }
        }
    }

    /// Up to 10 files ranked by task relevance; explicitly passed paths
    /// rank first.
    fn relevant_files(&self, options: &ContextOptions) -> Vec<RelevantFile> {
        let mut out: Vec<RelevantFile> = options
            .file_paths
            .iter()
            .map(|path| RelevantFile {
                path: path.clone(),
                reason: "referenced by the task".to_string(),
                summary: String::new(),
            })
            .collect();
        if let Some(task) = &options.task {
            match self.vectors.search(task, 10) {
                Ok(results) => {
                    for (entry, score) in results {
                        let Some(file) = entry.file else { continue };
                        if out.iter().any(|f| f.path == file) {
                            continue;
                        }
                        out.push(RelevantFile {
                            path: file,
                            reason: format!("similarity {score:.2}"),
                            summary: util::truncate_chars(&entry.text, 200),
                        });
                    }
                }
                Err(e) => warn!("vector search unavailable: {e}"),
            }
        }
        out.truncate(10);
        out
    }
}

/// Markdown rendering of the full context snapshot.
fn render(technical: &TechnicalContext, markdown: &str) -> String {
    let mut out = String::new();
    out.push_str("# Project context\n\n");
    out.push_str(&format!("Fingerprint: {}\n", technical.fingerprint));
    out.push_str(&format!("Code style: {}\n", technical.code_style));
    if !technical.learned_patterns.is_empty() {
        out.push_str("\n## Learned patterns\n");
        for pattern in &technical.learned_patterns {
            out.push_str(&format!(
                "- [{}] {} (seen {}x)\n",
                pattern.category, pattern.name, pattern.frequency
            ));
        }
    }
    if !technical.relevant_files.is_empty() {
        out.push_str("\n## Relevant files\n");
        for file in &technical.relevant_files {
            out.push_str(&format!("- {} — {}\n", file.path, file.reason));
        }
    }
    if !technical.recent_edits.is_empty() {
        out.push_str("\n## Recent edits\n");
        for edit in &technical.recent_edits {
            out.push_str(&format!("- {} ({} min ago)\n", edit.file, edit.minutes_ago));
        }
    }
    if !technical.recent_decisions.is_empty() {
        out.push_str("\n## Recent decisions\n");
        for decision in &technical.recent_decisions {
            out.push_str(&format!("- {} [{}]\n", decision.title, decision.agent));
        }
    }
    if !markdown.trim().is_empty() {
        out.push_str("\n## Notes\n");
        out.push_str(markdown);
    }
    out
}

/// Trim a rendered context to a token budget (estimate-based).
pub fn formatted_within(context: &MemoryContext, budget_tokens: u64) -> String {
    let budget_chars = (budget_tokens * 4) as usize;
    if context.formatted.chars().count() <= budget_chars {
        return context.formatted.clone();
    }
    util::truncate_chars(&context.formatted, budget_chars)
}
