use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Path-addressed record store.
///
/// Keys are path tuples; each record lives in one JSON file:
/// ```text
/// <data-root>/memory/
///   session/<project>/<session_id>.json
///   causal/<project>/decision/<id>.json
///   ...
/// ```
/// `read` of a missing key is absence, not an error. Writes go through a
/// temp file and rename so a crashed write never leaves a torn record.
pub struct Storage {
    root: PathBuf,
}

/// One exported record: full key tuple plus its value.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct SnapshotEntry {
    pub key: Vec<String>,
    pub value: JsonValue,
}

impl Storage {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn read(&self, key: &[&str]) -> Result<Option<JsonValue>> {
        let path = self.record_path(key)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!("Corrupt record at {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn read_as<T: DeserializeOwned>(&self, key: &[&str]) -> Result<Option<T>> {
        match self.read(key)? {
            Some(value) => Ok(serde_json::from_value(value).ok()),
            None => Ok(None),
        }
    }

    pub fn write(&self, key: &[&str], value: &JsonValue) -> Result<()> {
        let path = self.record_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn write_as<T: Serialize>(&self, key: &[&str], value: &T) -> Result<()> {
        self.write(key, &serde_json::to_value(value)?)
    }

    /// Remove a record. Returns whether it existed.
    pub fn remove(&self, key: &[&str]) -> Result<bool> {
        let path = self.record_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List full key tuples under a prefix, sorted lexicographically.
    pub fn list(&self, prefix: &[&str]) -> Result<Vec<Vec<String>>> {
        let mut dir = self.root.clone();
        for seg in prefix {
            dir.push(encode_segment(seg)?);
        }
        let mut keys = Vec::new();
        if dir.is_dir() {
            collect_keys(&dir, &mut prefix.iter().map(|s| s.to_string()).collect(), &mut keys)?;
        }
        keys.sort();
        Ok(keys)
    }

    /// Export every record as a `(key, value)` multiset.
    pub fn export_snapshot(&self) -> Result<Vec<SnapshotEntry>> {
        let keys = self.list(&[])?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let borrowed: Vec<&str> = key.iter().map(String::as_str).collect();
            if let Some(value) = self.read(&borrowed)? {
                out.push(SnapshotEntry { key, value });
            }
        }
        Ok(out)
    }

    /// Import a snapshot. Existing records with the same keys are overwritten.
    pub fn import_snapshot(&self, entries: &[SnapshotEntry]) -> Result<()> {
        for entry in entries {
            let borrowed: Vec<&str> = entry.key.iter().map(String::as_str).collect();
            self.write(&borrowed, &entry.value)?;
        }
        Ok(())
    }

    fn record_path(&self, key: &[&str]) -> Result<PathBuf> {
        if key.is_empty() {
            bail!("storage key must have at least one segment");
        }
        let mut path = self.root.clone();
        for seg in &key[..key.len() - 1] {
            path.push(encode_segment(seg)?);
        }
        // Appended rather than set_extension: segments may contain dots.
        path.push(format!("{}.json", encode_segment(key[key.len() - 1])?));
        Ok(path)
    }
}

/// Encode one key segment into a directory-safe name.
/// Slashes become dashes (same convention as the project-path encoding);
/// anything else outside `[A-Za-z0-9._ @-]` becomes `_`.
fn encode_segment(seg: &str) -> Result<String> {
    if seg.is_empty() || seg == "." || seg == ".." {
        bail!("invalid storage key segment: {:?}", seg);
    }
    let encoded: String = seg
        .chars()
        .map(|c| match c {
            '/' | '\\' => '-',
            c if c.is_ascii_alphanumeric() => c,
            '.' | '_' | '-' | ' ' | '@' => c,
            _ => '_',
        })
        .collect();
    Ok(encoded)
}

fn collect_keys(dir: &Path, prefix: &mut Vec<String>, keys: &mut Vec<Vec<String>>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if path.is_dir() {
            prefix.push(name);
            collect_keys(&path, prefix, keys)?;
            prefix.pop();
        } else if let Some(stem) = name.strip_suffix(".json") {
            let mut key = prefix.clone();
            key.push(stem.to_string());
            keys.push(key);
        }
    }
    Ok(())
}
