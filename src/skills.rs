use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::engine::tools::{ExecContext, ToolDef, ToolExecutor, ToolOutput, ToolParam};
use crate::permission::PermissionKind;

// ---------------------------------------------------------------------------
// Skill discovery
// ---------------------------------------------------------------------------

/// One discovered skill: a folder holding `SKILL.md` with YAML frontmatter.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct SkillFrontmatter {
    name: String,
    description: String,
}

/// Split `---` YAML frontmatter from a SKILL.md body.
fn parse_skill_markdown(content: &str) -> Result<(SkillFrontmatter, String)> {
    if !content.starts_with("---") {
        anyhow::bail!("SKILL.md must start with YAML frontmatter (---)");
    }
    let parts: Vec<&str> = content.splitn(3, "---").collect();
    if parts.len() < 3 {
        anyhow::bail!("SKILL.md missing closing frontmatter delimiter (---)");
    }
    let frontmatter: SkillFrontmatter = serde_yml::from_str(parts[1])?;
    Ok((frontmatter, parts[2].trim().to_string()))
}

/// Scan the skill directories (project first, then home); first definition
/// of a name wins. Discovered once per process.
pub fn discover_skills(worktree: &Path) -> Vec<Skill> {
    let mut seen: HashMap<String, ()> = HashMap::new();
    let mut skills = Vec::new();
    for dir in crate::paths::skill_dir_candidates(worktree) {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let skill_file = entry.path().join("SKILL.md");
            let Ok(content) = std::fs::read_to_string(&skill_file) else {
                continue;
            };
            match parse_skill_markdown(&content) {
                Ok((frontmatter, body)) => {
                    if seen.contains_key(&frontmatter.name) {
                        continue;
                    }
                    seen.insert(frontmatter.name.clone(), ());
                    skills.push(Skill {
                        name: frontmatter.name,
                        description: frontmatter.description,
                        content: body,
                    });
                }
                Err(e) => warn!("Skipping skill at {}: {}", skill_file.display(), e),
            }
        }
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

// ---------------------------------------------------------------------------
// Skill tools
// ---------------------------------------------------------------------------

/// A skill exposed to the model as a tool: invoking it returns the skill's
/// instructions. Skill results carry the compaction-protected capability,
/// so summaries never drop them mid-task.
pub struct SkillTool {
    def: ToolDef,
    content: String,
}

impl SkillTool {
    pub fn new(skill: &Skill) -> Self {
        Self {
            def: ToolDef {
                name: format!("skill_{}", skill.name),
                description: skill.description.clone(),
                kind: PermissionKind::Read,
                params: vec![ToolParam::optional(
                    "args",
                    crate::engine::tools::ParamType::String,
                    "Arguments passed to the skill",
                    None,
                )],
                output_cap: 50_000,
                compaction_protected: true,
            },
            content: skill.content.clone(),
        }
    }
}

impl ToolExecutor for SkillTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn execute(
        &self,
        args: JsonValue,
        _ctx: ExecContext,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ToolOutput>> {
        let mut content = self.content.clone();
        if let Some(extra) = args.get("args").and_then(|v| v.as_str()) {
            content.push_str(&format!("\n\nArguments: {extra}"));
        }
        async move { Ok(ToolOutput::text(content)) }.boxed()
    }
}

/// Register every discovered skill into the tool registry.
pub fn register_skill_tools(
    registry: &mut crate::engine::tools::ToolRegistry,
    skills: &[Skill],
) {
    for skill in skills {
        registry.register(std::sync::Arc::new(SkillTool::new(skill)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(dir: &Path, folder: &str, name: &str, description: &str) {
        let skill_dir = dir.join(folder);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            format!("---\nname: {name}\ndescription: {description}\n---\n\nDo the thing.\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_discovery_project_first() {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tmp.path();
        write_skill(&worktree.join(".ccode/skills"), "deploy", "deploy", "Deploy the app");
        write_skill(&worktree.join(".claude/skills"), "deploy", "deploy", "Shadowed duplicate");
        write_skill(&worktree.join(".claude/skills"), "review", "review", "Review changes");

        let skills = discover_skills(worktree);
        assert_eq!(skills.len(), 2);
        let deploy = skills.iter().find(|s| s.name == "deploy").unwrap();
        // Project definition wins over the later directory.
        assert_eq!(deploy.description, "Deploy the app");
        assert!(deploy.content.contains("Do the thing."));
    }

    #[test]
    fn test_malformed_skill_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".ccode/skills/broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), "no frontmatter here").unwrap();
        assert!(discover_skills(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_skill_tool_is_compaction_protected() {
        let skill = Skill {
            name: "deploy".to_string(),
            description: "Deploy the app".to_string(),
            content: "Step 1: build.".to_string(),
        };
        let mut registry = crate::engine::tools::ToolRegistry::new();
        register_skill_tools(&mut registry, &[skill]);
        assert!(registry.is_compaction_protected("skill_deploy"));

        let tool = registry.get("skill_deploy").unwrap();
        let out = tool
            .execute(
                serde_json::json!({ "args": "production" }),
                ExecContext {
                    worktree: std::env::temp_dir(),
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.content.contains("Step 1: build."));
        assert!(out.content.contains("Arguments: production"));
    }
}
