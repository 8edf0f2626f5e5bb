pub mod requests;

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

// ---------------------------------------------------------------------------
// Permission kinds (closed set) and actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Read,
    Edit,
    Bash,
    Webfetch,
    Websearch,
    Codesearch,
    Glob,
    Grep,
    List,
    Todoread,
    Todowrite,
    Question,
    PlanEnter,
    PlanExit,
    DoomLoop,
    ExternalDirectory,
}

impl PermissionKind {
    pub const ALL: [PermissionKind; 16] = [
        PermissionKind::Read,
        PermissionKind::Edit,
        PermissionKind::Bash,
        PermissionKind::Webfetch,
        PermissionKind::Websearch,
        PermissionKind::Codesearch,
        PermissionKind::Glob,
        PermissionKind::Grep,
        PermissionKind::List,
        PermissionKind::Todoread,
        PermissionKind::Todowrite,
        PermissionKind::Question,
        PermissionKind::PlanEnter,
        PermissionKind::PlanExit,
        PermissionKind::DoomLoop,
        PermissionKind::ExternalDirectory,
    ];

    /// Kinds whose scope value is a filesystem path.
    pub fn is_path_scoped(self) -> bool {
        matches!(
            self,
            PermissionKind::Read
                | PermissionKind::Edit
                | PermissionKind::Glob
                | PermissionKind::Grep
                | PermissionKind::List
                | PermissionKind::ExternalDirectory
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionKind::Read => "read",
            PermissionKind::Edit => "edit",
            PermissionKind::Bash => "bash",
            PermissionKind::Webfetch => "webfetch",
            PermissionKind::Websearch => "websearch",
            PermissionKind::Codesearch => "codesearch",
            PermissionKind::Glob => "glob",
            PermissionKind::Grep => "grep",
            PermissionKind::List => "list",
            PermissionKind::Todoread => "todoread",
            PermissionKind::Todowrite => "todowrite",
            PermissionKind::Question => "question",
            PermissionKind::PlanEnter => "plan_enter",
            PermissionKind::PlanExit => "plan_exit",
            PermissionKind::DoomLoop => "doom_loop",
            PermissionKind::ExternalDirectory => "external_directory",
        }
    }
}

impl FromStr for PermissionKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, UnknownKind> {
        PermissionKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown permission kind: {}", self.0)
    }
}

impl std::error::Error for UnknownKind {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Ask,
    Deny,
}

// ---------------------------------------------------------------------------
// Declarative ruleset as it appears in config
// ---------------------------------------------------------------------------

/// A permission-kind entry in `codecoder.json`: either a bare action
/// (`"bash": "ask"`) or a pattern map (`"read": { "*.env": "ask" }`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionValue {
    Action(PermissionAction),
    Scoped(HashMap<String, PermissionAction>),
}

pub type PermissionConfig = HashMap<String, PermissionValue>;

/// Where a rule came from. Later sources win ties at equal specificity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleSource {
    Default = 0,
    Agent = 1,
    Project = 2,
    /// Appended at runtime by `allow_always` replies.
    Session = 3,
}

// ---------------------------------------------------------------------------
// Compiled rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum RuleMatcher {
    /// Matches any scope, including tools with no scope value.
    Wildcard,
    /// Literal comparison against the scope value.
    Exact(String),
    /// `prefix *` / `prefix*` command-style match (teacher's Bash patterns).
    Prefix(String),
    /// Compiled glob for path-style scopes.
    Glob(GlobMatcher),
}

#[derive(Clone)]
pub struct CompiledRule {
    pub kind: PermissionKind,
    pub pattern: String,
    pub action: PermissionAction,
    pub source: RuleSource,
    matcher: RuleMatcher,
    /// (class, literal length): exact=3 > prefix=2 > glob=1 > wildcard=0.
    specificity: (u8, usize),
}

impl fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRule")
            .field("kind", &self.kind)
            .field("pattern", &self.pattern)
            .field("action", &self.action)
            .field("source", &self.source)
            .finish()
    }
}

impl CompiledRule {
    pub fn new(
        kind: PermissionKind,
        pattern: &str,
        action: PermissionAction,
        source: RuleSource,
    ) -> Self {
        let (matcher, specificity) = compile_pattern(pattern);
        Self {
            kind,
            pattern: pattern.to_string(),
            action,
            source,
            matcher,
            specificity,
        }
    }

    fn matches(&self, scope: Option<&str>) -> bool {
        match (&self.matcher, scope) {
            (RuleMatcher::Wildcard, _) => true,
            (_, None) => false,
            (RuleMatcher::Exact(lit), Some(s)) => s == lit,
            (RuleMatcher::Prefix(prefix), Some(s)) => {
                s == prefix.trim_end() || s.starts_with(prefix)
            }
            (RuleMatcher::Glob(glob), Some(s)) => {
                // Path globs match against both the full scope and its
                // final component, so `*.env` catches `config/.env.local`-style
                // layouts the way users expect.
                glob.is_match(s)
                    || Path::new(s)
                        .file_name()
                        .map(|n| glob.is_match(Path::new(n)))
                        .unwrap_or(false)
            }
        }
    }
}

fn compile_pattern(pattern: &str) -> (RuleMatcher, (u8, usize)) {
    if pattern == "*" {
        return (RuleMatcher::Wildcard, (0, 0));
    }
    let literal_len = pattern.chars().filter(|c| !"*?[]{}".contains(*c)).count();
    // "git *" / "npm run *" style command prefixes keep their literal head.
    if let Some(head) = pattern.strip_suffix(" *") {
        return (
            RuleMatcher::Prefix(format!("{head} ")),
            (2, literal_len),
        );
    }
    if !pattern.contains(['*', '?', '[', '{']) {
        return (RuleMatcher::Exact(pattern.to_string()), (3, literal_len));
    }
    match Glob::new(pattern) {
        Ok(glob) => (RuleMatcher::Glob(glob.compile_matcher()), (1, literal_len)),
        Err(e) => {
            warn!("Invalid permission glob '{}': {} — treating as literal", pattern, e);
            (RuleMatcher::Exact(pattern.to_string()), (3, literal_len))
        }
    }
}

// ---------------------------------------------------------------------------
// Ruleset: ordered decision list
// ---------------------------------------------------------------------------

/// A compiled, ordered ruleset. `decide` is pure and total: it always
/// returns exactly one of allow / ask / deny for any input.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    rules: Vec<CompiledRule>,
}

impl Ruleset {
    /// Compile from layered sources. Later layers win at equal specificity.
    pub fn compile(layers: &[(RuleSource, &PermissionConfig)]) -> Self {
        let mut rules = builtin_default_rules();
        for (source, config) in layers {
            for (kind_str, value) in config.iter() {
                let kind = match PermissionKind::from_str(kind_str) {
                    Ok(k) => k,
                    Err(e) => {
                        warn!("Skipping permission entry: {}", e);
                        continue;
                    }
                };
                match value {
                    PermissionValue::Action(action) => {
                        rules.push(CompiledRule::new(kind, "*", *action, *source));
                    }
                    PermissionValue::Scoped(map) => {
                        for (pattern, action) in map {
                            rules.push(CompiledRule::new(kind, pattern, *action, *source));
                        }
                    }
                }
            }
        }
        Self::from_rules(rules)
    }

    pub fn from_rules(mut rules: Vec<CompiledRule>) -> Self {
        // Descending specificity; later sources first within a tie, so the
        // first matching rule is always the latest equally-specific one.
        rules.sort_by(|a, b| {
            b.specificity
                .cmp(&a.specificity)
                .then(b.source.cmp(&a.source))
        });
        Self { rules }
    }

    /// Return a new ruleset with `rule` appended (copy-on-write append used
    /// by `allow_always`). The existing ruleset is untouched.
    pub fn with_rule(&self, rule: CompiledRule) -> Self {
        let mut rules = self.rules.clone();
        rules.push(rule);
        Self::from_rules(rules)
    }

    /// Resolve a kind + scope to a verdict. The first matching rule decides;
    /// no match resolves to `ask`.
    pub fn decide(&self, kind: PermissionKind, scope: Option<&str>) -> PermissionAction {
        for rule in &self.rules {
            if rule.kind == kind && rule.matches(scope) {
                return rule.action;
            }
        }
        PermissionAction::Ask
    }

    /// Resolve a path-scoped call, routing paths outside the worktree through
    /// the `external_directory` rules (spec edge rule: they apply to any path
    /// outside the worktree, tool outputs included).
    pub fn decide_path(
        &self,
        kind: PermissionKind,
        path: &str,
        worktree: &Path,
    ) -> PermissionAction {
        if is_outside_worktree(path, worktree) {
            return self.decide(PermissionKind::ExternalDirectory, Some(path));
        }
        self.decide(kind, Some(path))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

fn is_outside_worktree(path: &str, worktree: &Path) -> bool {
    let p = Path::new(path);
    if !p.is_absolute() {
        // Relative paths are worktree-relative unless they climb out.
        return path.split(['/', '\\']).any(|seg| seg == "..");
    }
    !p.starts_with(worktree)
}

/// Built-in default rules present in every compiled ruleset:
/// - `.env` files ask, `*.env.example` allows;
/// - the reserved truncation directory is readable/writable;
/// - external directories ask;
/// - read-class and question tools allow by default, mutating ones ask.
fn builtin_default_rules() -> Vec<CompiledRule> {
    use PermissionAction::*;
    use PermissionKind::*;
    let src = RuleSource::Default;
    let mut rules = Vec::new();
    for kind in [Read, Edit] {
        rules.push(CompiledRule::new(kind, "*.env", Ask, src));
        rules.push(CompiledRule::new(kind, ".env", Ask, src));
        rules.push(CompiledRule::new(kind, "*.env.example", Allow, src));
        rules.push(CompiledRule::new(kind, ".ccode/tool-output/**", Allow, src));
    }
    for kind in [Read, Glob, Grep, List, Codesearch, Todoread, Question] {
        rules.push(CompiledRule::new(kind, "*", Allow, src));
    }
    for kind in [Edit, Bash, Webfetch, Websearch, ExternalDirectory] {
        rules.push(CompiledRule::new(kind, "*", Ask, src));
    }
    for kind in [Todowrite, PlanEnter, PlanExit] {
        rules.push(CompiledRule::new(kind, "*", Allow, src));
    }
    rules.push(CompiledRule::new(DoomLoop, "*", Deny, src));
    rules
}

/// Extra layer installed while plan mode is active: edits are denied except
/// plan markdown files.
pub fn plan_mode_rules() -> Vec<CompiledRule> {
    use PermissionAction::*;
    use PermissionKind::*;
    vec![
        CompiledRule::new(Edit, "**/plans/*.md", Allow, RuleSource::Session),
        CompiledRule::new(Edit, "*.plan.md", Allow, RuleSource::Session),
        CompiledRule::new(Edit, "*", Deny, RuleSource::Session),
    ]
}

impl Ruleset {
    /// Compile a ruleset with plan-mode edit restrictions layered on top.
    pub fn with_plan_mode(&self) -> Self {
        let mut rules = self.rules.clone();
        rules.extend(plan_mode_rules());
        Self::from_rules(rules)
    }
}
