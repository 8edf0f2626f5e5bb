use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::preferences::PreferenceStore;
use crate::storage::Storage;
use crate::util;

// ---------------------------------------------------------------------------
// Edit-choice observations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditChoiceType {
    Accept,
    Modify,
    Reject,
}

#[derive(Debug, Clone)]
pub struct EditChoice {
    pub choice: EditChoiceType,
    pub file_type: String,
    pub original_suggestion: Option<String>,
    pub final_code: Option<String>,
    pub reason: Option<String>,
}

/// One tracked style signal with an exponential-moving-average confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleObservation {
    pub pattern: String,
    pub value: String,
    pub confidence: f64,
    pub samples: u32,
    pub last_seen: u64,
    /// Up to 10 distinct samples of the observed code.
    #[serde(default)]
    pub examples: Vec<String>,
}

const EMA_WEIGHT: f64 = 0.3;
const PROMOTION_THRESHOLD: f64 = 0.7;
const MAX_EXAMPLES: usize = 10;

/// Passive style learning over accepted and modified edits. Observations
/// crossing the promotion threshold land in the user preferences.
pub struct StyleLearner {
    storage: Arc<Storage>,
    preferences: Arc<PreferenceStore>,
}

impl StyleLearner {
    pub fn new(storage: Arc<Storage>, preferences: Arc<PreferenceStore>) -> Self {
        Self {
            storage,
            preferences,
        }
    }

    /// Record one edit choice. Returns the style keys promoted into
    /// preferences by this observation.
    pub fn record_edit_choice(&self, choice: &EditChoice) -> Result<Vec<String>> {
        let mut promoted = Vec::new();
        match choice.choice {
            EditChoiceType::Accept => {
                if let Some(code) = &choice.final_code {
                    for (pattern, value) in infer_style(code) {
                        if self.observe(&pattern, &value, code)? {
                            promoted.push(pattern);
                        }
                    }
                }
            }
            EditChoiceType::Modify => {
                if let (Some(original), Some(final_code)) =
                    (&choice.original_suggestion, &choice.final_code)
                {
                    for (pattern, value) in infer_shift(original, final_code) {
                        if self.observe(&pattern, &value, final_code)? {
                            promoted.push(pattern);
                        }
                    }
                }
            }
            // Rejections carry no style signal by themselves.
            EditChoiceType::Reject => {}
        }
        Ok(promoted)
    }

    pub fn observation(&self, pattern: &str) -> Result<Option<StyleObservation>> {
        self.storage.read_as(&["style", pattern])
    }

    /// EMA update: agreement pulls confidence toward 1.0 with weight 0.3,
    /// disagreement decays it; a collapsed observation adopts the new value.
    /// Returns true when this update crossed the promotion threshold.
    fn observe(&self, pattern: &str, value: &str, example: &str) -> Result<bool> {
        let now = util::now_ts_secs();
        let mut obs = self
            .storage
            .read_as::<StyleObservation>(&["style", pattern])?
            .unwrap_or_else(|| StyleObservation {
                pattern: pattern.to_string(),
                value: value.to_string(),
                confidence: 0.0,
                samples: 0,
                last_seen: now,
                examples: Vec::new(),
            });

        let before = obs.confidence;
        if obs.value == value {
            obs.confidence += EMA_WEIGHT * (1.0 - obs.confidence);
        } else {
            obs.confidence *= 1.0 - EMA_WEIGHT;
            if obs.confidence < 0.2 {
                obs.value = value.to_string();
                obs.confidence = EMA_WEIGHT;
            }
        }
        obs.samples += 1;
        obs.last_seen = now;
        let snippet = util::truncate_chars(example, 160);
        if !obs.examples.contains(&snippet) {
            obs.examples.push(snippet);
            if obs.examples.len() > MAX_EXAMPLES {
                obs.examples.remove(0);
            }
        }
        self.storage.write_as(&["style", pattern], &obs)?;

        let crossed = before < PROMOTION_THRESHOLD && obs.confidence >= PROMOTION_THRESHOLD;
        if crossed {
            self.promote(pattern, &obs.value)?;
        }
        Ok(crossed)
    }

    fn promote(&self, pattern: &str, value: &str) -> Result<()> {
        self.preferences.update(|prefs| match pattern {
            "indentation" => prefs.indentation = Some(value.to_string()),
            "quotes" => prefs.quotes = Some(value.to_string()),
            "semicolons" => prefs.semicolons = Some(value == "true"),
            "trailing_commas" => prefs.trailing_commas = Some(value == "true"),
            _ => {}
        })?;
        Ok(())
    }

    /// Render the current style picture for prompt context.
    pub fn summarize(&self) -> Result<String> {
        let mut parts = Vec::new();
        for pattern in ["indentation", "quotes", "semicolons", "trailing_commas", "naming"] {
            if let Some(obs) = self.observation(pattern)? {
                parts.push(format!("{}: {} ({:.0}%)", pattern, obs.value, obs.confidence * 100.0));
            }
        }
        if parts.is_empty() {
            return Ok("no style signals yet".to_string());
        }
        Ok(parts.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// Style signals extracted from one accepted code block.
pub fn infer_style(code: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(indent) = detect_indentation(code) {
        out.push(("indentation".to_string(), indent));
    }
    if let Some(quotes) = detect_quotes(code) {
        out.push(("quotes".to_string(), quotes));
    }
    if let Some(semis) = detect_semicolons(code) {
        out.push(("semicolons".to_string(), semis.to_string()));
    }
    if let Some(commas) = detect_trailing_commas(code) {
        out.push(("trailing_commas".to_string(), commas.to_string()));
    }
    if let Some(naming) = detect_naming(code) {
        out.push(("naming".to_string(), naming));
    }
    out
}

/// Preference shifts visible in a user modification of a suggestion.
pub fn infer_shift(original: &str, final_code: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let (before_quotes, after_quotes) = (detect_quotes(original), detect_quotes(final_code));
    if let (Some(b), Some(a)) = (before_quotes, after_quotes) {
        if b != a {
            out.push(("quotes".to_string(), a));
        }
    }
    let (before_semi, after_semi) = (detect_semicolons(original), detect_semicolons(final_code));
    if let (Some(b), Some(a)) = (before_semi, after_semi) {
        if b != a {
            out.push(("semicolons".to_string(), a.to_string()));
        }
    }
    let (before_indent, after_indent) = (detect_indentation(original), detect_indentation(final_code));
    if let (Some(b), Some(a)) = (before_indent, after_indent) {
        if b != a {
            out.push(("indentation".to_string(), a));
        }
    }
    out
}

pub fn detect_indentation(code: &str) -> Option<String> {
    let mut tabs = 0usize;
    let mut two = 0usize;
    let mut four = 0usize;
    for line in code.lines() {
        if line.starts_with('\t') {
            tabs += 1;
        } else if line.starts_with("    ") {
            four += 1;
        } else if line.starts_with("  ") {
            two += 1;
        }
    }
    if tabs == 0 && two == 0 && four == 0 {
        return None;
    }
    if tabs >= two && tabs >= four {
        Some("tabs".to_string())
    } else if four >= two {
        Some("4-space".to_string())
    } else {
        Some("2-space".to_string())
    }
}

/// Quote preference, ignoring backtick template strings.
pub fn detect_quotes(code: &str) -> Option<String> {
    let single = code.matches('\'').count();
    let double = code.matches('"').count();
    if single == 0 && double == 0 {
        return None;
    }
    Some(if single > double { "single" } else { "double" }.to_string())
}

pub fn detect_semicolons(code: &str) -> Option<bool> {
    let mut with = 0usize;
    let mut without = 0usize;
    for line in code.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.ends_with(['{', '}', ',', ':']) {
            continue;
        }
        if trimmed.ends_with(';') {
            with += 1;
        } else {
            without += 1;
        }
    }
    if with == 0 && without == 0 {
        return None;
    }
    Some(with >= without)
}

pub fn detect_trailing_commas(code: &str) -> Option<bool> {
    let mut trailing = 0usize;
    let mut bare = 0usize;
    let lines: Vec<&str> = code.lines().collect();
    for window in lines.windows(2) {
        let current = window[0].trim_end();
        let next = window[1].trim_start();
        if next.starts_with(']') || next.starts_with(')') || next.starts_with('}') {
            if current.ends_with(',') {
                trailing += 1;
            } else if !current.is_empty() && !current.ends_with(['{', '[', '(']) {
                bare += 1;
            }
        }
    }
    if trailing == 0 && bare == 0 {
        return None;
    }
    Some(trailing >= bare)
}

/// Dominant identifier convention across declarations.
pub fn detect_naming(code: &str) -> Option<String> {
    static DECL_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = DECL_RE.get_or_init(|| {
        regex::Regex::new(
            r"(?:let|const|var|fn|function|def|class|struct|interface)\s+([A-Za-z_][A-Za-z0-9_]*)",
        )
        .expect("naming regex")
    });
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for cap in re.captures_iter(code) {
        let name = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        let style = if name.contains('_') {
            "snake_case"
        } else if name.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
            "PascalCase"
        } else if name.chars().any(|c| c.is_uppercase()) {
            "camelCase"
        } else {
            continue; // single lowercase word carries no signal
        };
        *counts.entry(style).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .map(|(style, _)| style.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn learner() -> (tempfile::TempDir, StyleLearner, Arc<PreferenceStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(tmp.path().join("memory")).unwrap());
        let prefs = Arc::new(PreferenceStore::new(storage.clone()));
        (tmp, StyleLearner::new(storage, prefs.clone()), prefs)
    }

    fn accept(code: &str) -> EditChoice {
        EditChoice {
            choice: EditChoiceType::Accept,
            file_type: "ts".to_string(),
            original_suggestion: None,
            final_code: Some(code.to_string()),
            reason: None,
        }
    }

    #[test]
    fn test_detectors() {
        assert_eq!(detect_indentation("  a\n  b\n"), Some("2-space".into()));
        assert_eq!(detect_indentation("    a\n    b\n"), Some("4-space".into()));
        assert_eq!(detect_indentation("\ta\n"), Some("tabs".into()));
        assert_eq!(detect_indentation("flat\n"), None);

        assert_eq!(detect_quotes("const a = 'x'; const b = 'y'"), Some("single".into()));
        assert_eq!(detect_quotes(r#"const a = "x""#), Some("double".into()));
        assert_eq!(detect_quotes("no strings"), None);

        assert_eq!(detect_semicolons("let a = 1;\nlet b = 2;\n"), Some(true));
        assert_eq!(detect_semicolons("let a = 1\nlet b = 2\n"), Some(false));

        assert_eq!(detect_trailing_commas("[\n  1,\n  2,\n]"), Some(true));
        assert_eq!(detect_trailing_commas("[\n  1,\n  2\n]"), Some(false));

        assert_eq!(
            detect_naming("const myValue = 1; function doThing() {}"),
            Some("camelCase".into())
        );
        assert_eq!(
            detect_naming("let my_value = 1\nfn do_thing() {}"),
            Some("snake_case".into())
        );
    }

    #[test]
    fn test_ema_and_promotion() {
        let (_tmp, learner, prefs) = learner();
        let code = "const a = 'x';\nconst b = 'y';\n";
        // Confidence path at weight 0.3: 0.3, 0.51, 0.657, 0.76 — the
        // fourth agreeing observation crosses 0.7 and promotes.
        for _ in 0..3 {
            let promoted = learner.record_edit_choice(&accept(code)).unwrap();
            assert!(!promoted.contains(&"quotes".to_string()));
        }
        let promoted = learner.record_edit_choice(&accept(code)).unwrap();
        assert!(promoted.contains(&"quotes".to_string()));
        assert_eq!(prefs.get().unwrap().quotes.as_deref(), Some("single"));

        let obs = learner.observation("quotes").unwrap().unwrap();
        assert_eq!(obs.samples, 4);
        assert!(obs.confidence >= 0.7);
    }

    #[test]
    fn test_disagreement_decays_and_flips() {
        let (_tmp, learner, _prefs) = learner();
        learner.record_edit_choice(&accept("const a = 'x';")).unwrap();
        let single = learner.observation("quotes").unwrap().unwrap();
        assert_eq!(single.value, "single");

        // Repeated double-quote evidence eventually flips the value.
        for _ in 0..4 {
            learner
                .record_edit_choice(&accept(r#"const a = "x";"#))
                .unwrap();
        }
        let flipped = learner.observation("quotes").unwrap().unwrap();
        assert_eq!(flipped.value, "double");
    }

    #[test]
    fn test_modify_detects_shift() {
        let (_tmp, learner, _prefs) = learner();
        let choice = EditChoice {
            choice: EditChoiceType::Modify,
            file_type: "ts".to_string(),
            original_suggestion: Some(r#"const a = "x";"#.to_string()),
            final_code: Some("const a = 'x';".to_string()),
            reason: None,
        };
        learner.record_edit_choice(&choice).unwrap();
        let obs = learner.observation("quotes").unwrap().unwrap();
        assert_eq!(obs.value, "single");
    }

    #[test]
    fn test_examples_capped_at_ten() {
        let (_tmp, learner, _prefs) = learner();
        for i in 0..15 {
            learner
                .record_edit_choice(&accept(&format!("const v{i} = 'x';")))
                .unwrap();
        }
        let obs = learner.observation("quotes").unwrap().unwrap();
        assert!(obs.examples.len() <= 10);
    }
}
