mod dispatch;

pub use dispatch::{HookInput, HookOutcome};

use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::warn;

// ---------------------------------------------------------------------------
// Hook configuration (bit-exact hooks.json shape)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
}

impl HookEvent {
    fn key(self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookAction {
    Scan {
        #[serde(default)]
        patterns: Vec<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        block: bool,
    },
    NotifyOnly {
        #[serde(default)]
        message: Option<String>,
    },
    CheckEnv {
        variable: String,
        #[serde(default)]
        command_pattern: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct HookEntryConfig {
    pattern: String,
    #[serde(default)]
    file_pattern: Option<String>,
    #[serde(default)]
    actions: Vec<HookAction>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct HookSettings {
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct HookFileConfig {
    // serde_json's preserve_order feature keeps entry declaration order.
    #[serde(default)]
    hooks: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    settings: HookSettings,
}

// ---------------------------------------------------------------------------
// Compiled hooks
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct CompiledHook {
    pub name: String,
    pub event: HookEvent,
    pub tool_pattern: Regex,
    pub file_pattern: Option<Regex>,
    pub actions: Vec<HookAction>,
}

#[derive(Debug, Default)]
struct LoadedFile {
    mtime: Option<SystemTime>,
    hooks: Vec<CompiledHook>,
}

/// Declarative pre/post checks around tool calls, loaded from
/// `hooks.json` files (project first, then home). Files are re-read when
/// their mtime changes; malformed files are logged and skipped.
pub struct HookPipeline {
    candidates: Vec<PathBuf>,
    loaded: Mutex<Vec<LoadedFile>>,
}

impl HookPipeline {
    pub fn new(worktree: &Path) -> Self {
        Self {
            candidates: crate::paths::hook_config_candidates(worktree),
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// For tests and embedded use: explicit file list, still in order.
    pub fn with_files(files: Vec<PathBuf>) -> Self {
        Self {
            candidates: files,
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Re-read any config file whose mtime changed, then run `f` over the
    /// compiled hooks in declaration order (project before home).
    pub(crate) fn with_hooks<R>(&self, f: impl FnOnce(&[&CompiledHook]) -> R) -> R {
        let mut loaded = self.loaded.lock().expect("hook pipeline lock");
        if loaded.len() != self.candidates.len() {
            *loaded = self.candidates.iter().map(|_| LoadedFile::default()).collect();
            for (i, path) in self.candidates.iter().enumerate() {
                loaded[i] = load_file(path);
            }
        } else {
            for (i, path) in self.candidates.iter().enumerate() {
                let current = file_mtime(path);
                if current != loaded[i].mtime {
                    loaded[i] = load_file(path);
                }
            }
        }
        let hooks: Vec<&CompiledHook> = loaded.iter().flat_map(|file| file.hooks.iter()).collect();
        f(&hooks)
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn load_file(path: &Path) -> LoadedFile {
    let mtime = file_mtime(path);
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return LoadedFile { mtime, hooks: Vec::new() },
    };
    let config: HookFileConfig = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            warn!("Malformed hook config {}: {} — skipping file", path.display(), e);
            return LoadedFile { mtime, hooks: Vec::new() };
        }
    };
    if !config.settings.enabled {
        return LoadedFile { mtime, hooks: Vec::new() };
    }

    let mut hooks = Vec::new();
    for event in [HookEvent::PreToolUse, HookEvent::PostToolUse] {
        let Some(entries) = config.hooks.get(event.key()).and_then(|v| v.as_object()) else {
            continue;
        };
        for (name, raw) in entries {
            let entry: HookEntryConfig = match serde_json::from_value(raw.clone()) {
                Ok(e) => e,
                Err(e) => {
                    warn!("Invalid hook entry '{}' in {}: {}", name, path.display(), e);
                    continue;
                }
            };
            let tool_pattern = match Regex::new(&entry.pattern) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Invalid tool pattern in hook '{}': {}", name, e);
                    continue;
                }
            };
            let file_pattern = match entry.file_pattern.as_deref().map(Regex::new) {
                Some(Ok(r)) => Some(r),
                Some(Err(e)) => {
                    warn!("Invalid file pattern in hook '{}': {}", name, e);
                    continue;
                }
                None => None,
            };
            hooks.push(CompiledHook {
                name: name.clone(),
                event,
                tool_pattern,
                file_pattern,
                actions: entry.actions.clone(),
            });
        }
    }
    LoadedFile { mtime, hooks }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, name: &str, json: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_load_preserves_order_and_skips_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let good = write_config(
            tmp.path(),
            "hooks.json",
            r#"{ "hooks": { "PreToolUse": {
                "first": { "pattern": "edit", "actions": [] },
                "second": { "pattern": "bash", "actions": [] }
            } } }"#,
        );
        let bad = write_config(tmp.path(), "bad.json", "{ not json");
        let pipeline = HookPipeline::with_files(vec![good, bad]);
        pipeline.with_hooks(|hooks| {
            assert_eq!(hooks.len(), 2);
            assert_eq!(hooks[0].name, "first");
            assert_eq!(hooks[1].name, "second");
        });
    }

    #[test]
    fn test_disabled_file_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            "hooks.json",
            r#"{ "hooks": { "PreToolUse": { "h": { "pattern": ".*", "actions": [] } } },
                "settings": { "enabled": false } }"#,
        );
        let pipeline = HookPipeline::with_files(vec![path]);
        pipeline.with_hooks(|hooks| assert!(hooks.is_empty()));
    }

    #[test]
    fn test_reload_on_mtime_change() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            "hooks.json",
            r#"{ "hooks": { "PreToolUse": { "a": { "pattern": "edit", "actions": [] } } } }"#,
        );
        let pipeline = HookPipeline::with_files(vec![path.clone()]);
        pipeline.with_hooks(|hooks| assert_eq!(hooks.len(), 1));

        std::fs::write(
            &path,
            r#"{ "hooks": { "PreToolUse": {
                "a": { "pattern": "edit", "actions": [] },
                "b": { "pattern": "bash", "actions": [] }
            } } }"#,
        )
        .unwrap();
        // Force a visible mtime difference on coarse-grained filesystems.
        let newer = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
        let _ = filetime_set(&path, newer);
        pipeline.with_hooks(|hooks| assert_eq!(hooks.len(), 2));
    }

    fn filetime_set(path: &Path, to: std::time::SystemTime) -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().append(true).open(path)?;
        file.set_modified(to)
    }
}
