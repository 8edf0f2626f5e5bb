use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Human-readable memory: a long-term `MEMORY.md` with fixed category
/// sections plus daily notes under `daily/YYYY-MM-DD.md`.
///
/// Category updates are atomic read-modify-writes guarded by a single lock,
/// so a long-term category is never partially written.
pub struct MarkdownMemory {
    root: PathBuf,
    write_lock: Mutex<()>,
}

/// Fixed category order inside MEMORY.md.
pub const CATEGORIES: [&str; 4] = ["Preferences", "Decisions", "Lessons Learned", "Context"];

impl MarkdownMemory {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join("daily"))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn long_term_path(&self) -> PathBuf {
        self.root.join("MEMORY.md")
    }

    fn daily_path(&self, date: &str) -> PathBuf {
        self.root.join("daily").join(format!("{date}.md"))
    }

    /// Append an entry bullet under a category section, creating the file
    /// and section as needed.
    pub fn merge_category(&self, category: &str, entry: &str) -> Result<()> {
        let _guard = self.write_lock.lock().expect("markdown write lock");
        let path = self.long_term_path();
        let existing = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let updated = merge_into_section(&existing, category, entry);
        let tmp = path.with_extension("md.tmp");
        fs::write(&tmp, updated)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn read_long_term(&self) -> Result<String> {
        match fs::read_to_string(self.long_term_path()) {
            Ok(c) => Ok(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append a timestamped bullet to today's daily note.
    pub fn append_daily(&self, entry: &str) -> Result<String> {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.append_daily_for(&date, entry)?;
        Ok(date)
    }

    pub fn append_daily_for(&self, date: &str, entry: &str) -> Result<()> {
        let _guard = self.write_lock.lock().expect("markdown write lock");
        let path = self.daily_path(date);
        let mut content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => format!("# {date}\n"),
            Err(e) => return Err(e.into()),
        };
        let time = chrono::Local::now().format("%H:%M").to_string();
        content.push_str(&format!("\n- {time} — {entry}\n"));
        let tmp = path.with_extension("md.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Last `days` daily notes that exist, newest first.
    pub fn read_recent_daily(&self, days: usize) -> Result<Vec<(String, String)>> {
        let dir = self.root.join("daily");
        let mut dates: Vec<String> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(date) = name.strip_suffix(".md") {
                    dates.push(date.to_string());
                }
            }
        }
        dates.sort_by(|a, b| b.cmp(a));
        dates.truncate(days);
        let mut out = Vec::with_capacity(dates.len());
        for date in dates {
            let content = fs::read_to_string(self.daily_path(&date))?;
            out.push((date, content));
        }
        Ok(out)
    }
}

fn merge_into_section(existing: &str, category: &str, entry: &str) -> String {
    let header = format!("## {category}");
    let bullet = format!("- {entry}");

    if existing.is_empty() {
        let mut out = String::from("# Memory\n");
        for cat in CATEGORIES {
            out.push_str(&format!("\n## {cat}\n"));
            if cat == category {
                out.push_str(&bullet);
                out.push('\n');
            }
        }
        if !CATEGORIES.contains(&category) {
            out.push_str(&format!("\n{header}\n{bullet}\n"));
        }
        return out;
    }

    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
    if let Some(header_idx) = lines.iter().position(|l| l.trim() == header) {
        // Insert after the last bullet of this section.
        let mut insert_at = header_idx + 1;
        for (i, line) in lines.iter().enumerate().skip(header_idx + 1) {
            if line.starts_with("## ") {
                break;
            }
            if !line.trim().is_empty() {
                insert_at = i + 1;
            }
        }
        lines.insert(insert_at, bullet);
    } else {
        if !lines.last().map(|l| l.is_empty()).unwrap_or(true) {
            lines.push(String::new());
        }
        lines.push(header);
        lines.push(bullet);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Category a routed write type lands in.
pub fn category_for(write_type: &str) -> &'static str {
    match write_type {
        "preference" => "Preferences",
        "decision" => "Decisions",
        "lesson" => "Lessons Learned",
        _ => "Context",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> (tempfile::TempDir, MarkdownMemory) {
        let tmp = tempfile::tempdir().unwrap();
        let mem = MarkdownMemory::new(tmp.path().join("memory")).unwrap();
        (tmp, mem)
    }

    #[test]
    fn test_merge_creates_sections() {
        let (_tmp, mem) = memory();
        mem.merge_category("Preferences", "prefers 4-space indentation").unwrap();
        let content = mem.read_long_term().unwrap();
        assert!(content.starts_with("# Memory"));
        assert!(content.contains("## Preferences\n- prefers 4-space indentation"));
        assert!(content.contains("## Decisions"));
    }

    #[test]
    fn test_merge_appends_within_section() {
        let (_tmp, mem) = memory();
        mem.merge_category("Decisions", "first").unwrap();
        mem.merge_category("Decisions", "second").unwrap();
        mem.merge_category("Preferences", "pref").unwrap();
        let content = mem.read_long_term().unwrap();
        let decisions_idx = content.find("## Decisions").unwrap();
        let lessons_idx = content.find("## Lessons Learned").unwrap();
        let section = &content[decisions_idx..lessons_idx];
        assert!(section.contains("- first\n- second"));
    }

    #[test]
    fn test_daily_append_and_read() {
        let (_tmp, mem) = memory();
        mem.append_daily_for("2026-08-01", "ran the tests").unwrap();
        mem.append_daily_for("2026-08-01", "fixed the parser").unwrap();
        mem.append_daily_for("2026-07-31", "yesterday note").unwrap();

        let recent = mem.read_recent_daily(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].0, "2026-08-01");
        assert!(recent[0].1.contains("ran the tests"));
        assert!(recent[0].1.contains("fixed the parser"));

        let two = mem.read_recent_daily(5).unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(two[1].0, "2026-07-31");
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(category_for("preference"), "Preferences");
        assert_eq!(category_for("decision"), "Decisions");
        assert_eq!(category_for("lesson"), "Lessons Learned");
        assert_eq!(category_for("context"), "Context");
        assert_eq!(category_for("anything"), "Context");
    }
}
