use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::Storage;
use crate::util;

// ---------------------------------------------------------------------------
// User preferences and learned patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Preferences {
    /// "tabs" | "2-space" | "4-space", promoted from style observations.
    #[serde(default)]
    pub indentation: Option<String>,
    /// "single" | "double"
    #[serde(default)]
    pub quotes: Option<String>,
    #[serde(default)]
    pub semicolons: Option<bool>,
    #[serde(default)]
    pub trailing_commas: Option<bool>,
    #[serde(default)]
    pub learned_patterns: Vec<LearnedPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub category: String,
    pub name: String,
    pub template: String,
    pub frequency: u32,
    pub confidence: f64,
    #[serde(default)]
    pub files: Vec<String>,
    pub last_seen: u64,
}

/// Common pattern categories pre-seeded at confidence 0.3.
const SEED_PATTERNS: [(&str, &str); 6] = [
    ("error-handling", "try/catch with typed errors"),
    ("async", "async/await over callback chains"),
    ("data-fetching", "fetch wrapper with retry"),
    ("state-management", "single store with selectors"),
    ("validation", "schema validation at boundaries"),
    ("auth", "token refresh middleware"),
];

pub struct PreferenceStore {
    storage: Arc<Storage>,
}

impl PreferenceStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn get(&self) -> Result<Preferences> {
        match self.storage.read_as::<Preferences>(&["preferences", "user"])? {
            Some(prefs) => Ok(prefs),
            None => {
                let seeded = seeded_preferences();
                self.set(&seeded)?;
                Ok(seeded)
            }
        }
    }

    pub fn set(&self, prefs: &Preferences) -> Result<()> {
        self.storage.write_as(&["preferences", "user"], prefs)
    }

    pub fn update(&self, f: impl FnOnce(&mut Preferences)) -> Result<Preferences> {
        let mut prefs = self.get()?;
        f(&mut prefs);
        self.set(&prefs)?;
        Ok(prefs)
    }

    /// Upsert a learned pattern: bump frequency, attach the file, refresh
    /// last-seen. New patterns start at confidence 0.3.
    pub fn record_pattern(
        &self,
        category: &str,
        name: &str,
        template: &str,
        file: Option<&str>,
    ) -> Result<LearnedPattern> {
        let prefs = self.update(|prefs| {
            let now = util::now_ts_secs();
            if let Some(existing) = prefs
                .learned_patterns
                .iter_mut()
                .find(|p| p.category == category && p.name == name)
            {
                existing.frequency += 1;
                existing.template = template.to_string();
                existing.last_seen = now;
                if let Some(f) = file {
                    if !existing.files.iter().any(|x| x == f) {
                        existing.files.push(f.to_string());
                    }
                }
            } else {
                prefs.learned_patterns.push(LearnedPattern {
                    category: category.to_string(),
                    name: name.to_string(),
                    template: template.to_string(),
                    frequency: 1,
                    confidence: 0.3,
                    files: file.map(|f| vec![f.to_string()]).unwrap_or_default(),
                    last_seen: now,
                });
            }
        })?;
        Ok(prefs
            .learned_patterns
            .iter()
            .find(|p| p.category == category && p.name == name)
            .cloned()
            .expect("pattern just recorded"))
    }

    /// Top learned patterns by frequency then confidence.
    pub fn top_patterns(&self, limit: usize) -> Result<Vec<LearnedPattern>> {
        let mut patterns = self.get()?.learned_patterns;
        patterns.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
        });
        patterns.truncate(limit);
        Ok(patterns)
    }
}

fn seeded_preferences() -> Preferences {
    let now = util::now_ts_secs();
    Preferences {
        learned_patterns: SEED_PATTERNS
            .iter()
            .map(|(category, name)| LearnedPattern {
                category: category.to_string(),
                name: name.to_string(),
                template: String::new(),
                frequency: 0,
                confidence: 0.3,
                files: Vec::new(),
                last_seen: now,
            })
            .collect(),
        ..Default::default()
    }
}
