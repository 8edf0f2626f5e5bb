use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::storage::Storage;
use crate::util;

/// A project is a worktree directory plus a stable id derived from its
/// absolute path. Created on first `provide`; never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub worktree: PathBuf,
    pub added_at: u64,
}

impl Project {
    /// Resolve (or register) the project for a worktree. The id is
    /// deterministic over the canonical absolute path, so the same worktree
    /// always maps to the same project.
    pub fn provide(storage: &Storage, worktree: &Path) -> Result<Self> {
        let canonical = worktree
            .canonicalize()
            .with_context(|| format!("worktree does not exist: {}", worktree.display()))?;
        let id = project_id(&canonical);
        if let Some(existing) = storage.read_as::<Project>(&["project", &id])? {
            return Ok(existing);
        }
        let project = Project {
            id: id.clone(),
            worktree: canonical,
            added_at: util::now_ts_secs(),
        };
        storage.write_as(&["project", &id], &project)?;
        Ok(project)
    }
}

/// Stable project id for an absolute worktree path.
pub fn project_id(path: &Path) -> String {
    format!("proj-{:016x}", util::fnv1a_64(path.to_string_lossy().as_bytes()))
}

/// Walk up from `start` looking for a `.git` directory; fall back to
/// `start` itself when nothing is found.
pub fn detect_worktree(start: &Path) -> PathBuf {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".git").exists() {
            return current;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return start.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_is_deterministic() {
        let a = project_id(Path::new("/work/project"));
        let b = project_id(Path::new("/work/project"));
        assert_eq!(a, b);
        assert_ne!(a, project_id(Path::new("/work/other")));
    }

    #[test]
    fn test_provide_registers_once() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open(tmp.path().join("memory")).unwrap();
        let worktree = tmp.path().join("repo");
        std::fs::create_dir_all(&worktree).unwrap();

        let first = Project::provide(&storage, &worktree).unwrap();
        let second = Project::provide(&storage, &worktree).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.added_at, second.added_at);
    }

    #[test]
    fn test_provide_missing_worktree_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open(tmp.path().join("memory")).unwrap();
        assert!(Project::provide(&storage, &tmp.path().join("nope")).is_err());
    }

    #[test]
    fn test_detect_worktree() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repo");
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("src/deep")).unwrap();
        assert_eq!(detect_worktree(&root.join("src/deep")), root);
    }
}
