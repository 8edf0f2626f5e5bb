use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CCODE_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the CodeCoder home directory (`~/.ccode/`).
/// Supports `$CCODE_HOME` env override. Cached via `OnceLock`.
pub fn ccode_home() -> &'static PathBuf {
    CCODE_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("CCODE_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ccode")
    })
}

/// `~/.ccode/config.toml`
pub fn global_config_file() -> PathBuf {
    ccode_home().join("config.toml")
}

/// `~/.ccode/data/`
pub fn data_dir() -> PathBuf {
    ccode_home().join("data")
}

/// `~/.ccode/logs/`
pub fn logs_dir() -> PathBuf {
    ccode_home().join("logs")
}

/// `<data-root>/memory/` — structured record storage.
pub fn memory_dir(data_root: &Path) -> PathBuf {
    data_root.join("memory")
}

/// `<data-root>/plans/` — plan artifacts written by the plan agent.
pub fn plans_dir(data_root: &Path) -> PathBuf {
    data_root.join("plans")
}

/// `<worktree>/.ccode/` — the project-local state directory.
pub fn project_dir(worktree: &Path) -> PathBuf {
    worktree.join(".ccode")
}

/// Reserved directory for truncated tool-output overflow.
/// Allow-listed by default in the permission engine.
pub fn truncation_dir(worktree: &Path) -> PathBuf {
    project_dir(worktree).join("tool-output")
}

/// Hook config candidates for a project, in evaluation order
/// (project first, then home-directory equivalents).
pub fn hook_config_candidates(worktree: &Path) -> Vec<PathBuf> {
    let mut out = vec![
        worktree.join(".ccode/hooks/hooks.json"),
        worktree.join(".claude/hooks/hooks.json"),
    ];
    if let Some(home) = dirs::home_dir() {
        out.push(home.join(".ccode/hooks/hooks.json"));
        out.push(home.join(".claude/hooks/hooks.json"));
    }
    out
}

/// Skill directory candidates, project first then home.
pub fn skill_dir_candidates(worktree: &Path) -> Vec<PathBuf> {
    let mut out = vec![
        worktree.join(".ccode/skills"),
        worktree.join(".claude/skills"),
    ];
    if let Some(home) = dirs::home_dir() {
        out.push(home.join(".claude/skills"));
    }
    out
}
