//! Long-term and daily memory management.
//!
//! The memory directory holds four layers:
//! - `MEMORY.md` -- long-term facts, rewritten by consolidation
//! - `HISTORY.md` -- append-only event log
//! - `YYYY-MM-DD.md` -- daily notes
//! - `learnings/<slug>.md` -- knowledge artifacts
//!
//! Prompt-facing reads go through a sanitizer that strips transient
//! runtime diagnostics (missing API keys, transport failures) so they
//! never fossilize into the agent's context.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{Duration, Local};
use regex::Regex;
use tracing::warn;

use tern_types::{Result, TernError};

fn transient_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\b[A-Z][A-Z0-9_]*_API_KEY\b.*\bnot configured\b",
            r"(?i)\bBRAVE_API_KEY\b",
            r"(?i)\bTAVILY_API_KEY\b",
            r"(?i)\bSEARXNG_BASE_URL\b",
            r"(?i)\bOPENAI_API_KEY\b",
            r"(?i)\bnot configured\b",
            r"(?i)\bweb_search failed\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    })
}

/// Drop lines matching the transient-diagnostic patterns.
pub fn sanitize_for_memory(content: &str) -> String {
    let patterns = transient_patterns();
    content
        .lines()
        .filter(|line| !patterns.iter().any(|p| p.is_match(line)))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Layered memory store rooted at `<workspace>/memory/`.
pub struct MemoryStore {
    memory_dir: PathBuf,
    memory_file: PathBuf,
    history_file: PathBuf,
    learnings_dir: PathBuf,
}

impl MemoryStore {
    /// Create a store for the given workspace.
    pub fn new(workspace: &Path) -> Self {
        let memory_dir = workspace.join("memory");
        Self {
            memory_file: memory_dir.join("MEMORY.md"),
            history_file: memory_dir.join("HISTORY.md"),
            learnings_dir: memory_dir.join("learnings"),
            memory_dir,
        }
    }

    fn today_stamp() -> String {
        Local::now().format("%Y-%m-%d").to_string()
    }

    /// Path to today's daily-notes file.
    pub fn today_file(&self) -> PathBuf {
        self.memory_dir.join(format!("{}.md", Self::today_stamp()))
    }

    fn read_or_empty(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.memory_dir).map_err(TernError::Io)
    }

    /// Read long-term memory (`MEMORY.md`), empty when missing.
    pub fn read_long_term(&self) -> String {
        Self::read_or_empty(&self.memory_file)
    }

    /// Overwrite long-term memory. Content is sanitized first.
    pub fn write_long_term(&self, content: &str) -> Result<()> {
        self.ensure_dir()?;
        let clean = sanitize_for_memory(content);
        std::fs::write(&self.memory_file, clean).map_err(TernError::Io)
    }

    /// Read the event log (`HISTORY.md`), empty when missing.
    pub fn read_history(&self) -> String {
        Self::read_or_empty(&self.history_file)
    }

    /// Append a sanitized entry to the event log.
    pub fn append_history(&self, entry: &str) -> Result<()> {
        self.ensure_dir()?;
        let clean = sanitize_for_memory(entry);
        if clean.is_empty() {
            return Ok(());
        }
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_file)
            .map_err(TernError::Io)?;
        writeln!(file, "{}\n", clean.trim_end()).map_err(TernError::Io)
    }

    /// Read today's notes, empty when missing.
    pub fn read_today(&self) -> String {
        Self::read_or_empty(&self.today_file())
    }

    /// Append to today's notes, creating the dated header on first write.
    pub fn append_today(&self, content: &str) -> Result<()> {
        self.ensure_dir()?;
        let today_file = self.today_file();
        let combined = if today_file.exists() {
            format!("{}\n{}", Self::read_or_empty(&today_file), content)
        } else {
            format!("# {}\n\n{}", Self::today_stamp(), content)
        };
        std::fs::write(&today_file, combined).map_err(TernError::Io)
    }

    /// Daily notes from the last `days` days, newest-relevant first.
    pub fn get_recent_memories(&self, days: i64) -> String {
        let today = Local::now().date_naive();
        let mut parts = Vec::new();
        for i in 0..days {
            let date = today - Duration::days(i);
            let path = self.memory_dir.join(format!("{}.md", date.format("%Y-%m-%d")));
            if path.exists() {
                parts.push(Self::read_or_empty(&path));
            }
        }
        parts.join("\n\n---\n\n")
    }

    /// Knowledge-base entries under `learnings/`, sorted by name.
    pub fn list_learnings(&self) -> Vec<(String, PathBuf)> {
        let mut entries = Vec::new();
        let Ok(dir) = std::fs::read_dir(&self.learnings_dir) else {
            return entries;
        };
        for entry in dir.flatten() {
            let path = entry.path();
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') || path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            entries.push((name.to_string(), path));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Prompt-facing memory context: long-term facts, today's notes, and
    /// the knowledge-base listing. Transient diagnostics are filtered.
    pub fn get_memory_context(&self) -> String {
        let mut parts = Vec::new();

        let long_term = sanitize_for_memory(&self.read_long_term());
        if !long_term.is_empty() {
            parts.push(format!("## Long-term Memory\n{long_term}"));
        }

        let today = self.read_today();
        if !today.is_empty() {
            parts.push(format!("## Today's Notes\n{today}"));
        }

        let learnings = self.list_learnings();
        if !learnings.is_empty() {
            let names: Vec<&str> = learnings.iter().map(|(n, _)| n.as_str()).collect();
            parts.push(format!(
                "## Knowledge Base\n{} learned topics in memory/learnings/: {}\nUse recall skill or read_file to load specific knowledge.",
                learnings.len(),
                names.join(", ")
            ));
        }

        parts.join("\n\n")
    }

    /// Paragraph substring search across MEMORY.md and HISTORY.md.
    ///
    /// Case-insensitive, document order, capped at `max_results`.
    pub fn search(&self, query: &str, max_results: usize) -> Vec<String> {
        if query.is_empty() || max_results == 0 {
            return Vec::new();
        }
        let query_lower = query.to_lowercase();
        let mut results = Vec::new();
        for text in [self.read_long_term(), self.read_history()] {
            for paragraph in text.split("\n\n") {
                let trimmed = paragraph.trim();
                if !trimmed.is_empty() && trimmed.to_lowercase().contains(&query_lower) {
                    results.push(trimmed.to_string());
                    if results.len() >= max_results {
                        return results;
                    }
                }
            }
        }
        results
    }

    /// Apply a consolidation artifact produced by the LLM.
    ///
    /// `memory_update` rewrites MEMORY.md, `history_entry` is appended to
    /// HISTORY.md; both pass through the sanitizer.
    pub fn apply_consolidation(&self, artifact: &serde_json::Value) -> Result<()> {
        let history_entry = artifact
            .get("history_entry")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let memory_update = artifact
            .get("memory_update")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        if !history_entry.trim().is_empty() {
            self.append_history(history_entry)?;
        }
        if !memory_update.trim().is_empty() {
            self.write_long_term(memory_update)?;
        } else {
            warn!("consolidation artifact carried no memory_update");
        }
        Ok(())
    }

    /// Path to `MEMORY.md`.
    pub fn memory_path(&self) -> &PathBuf {
        &self.memory_file
    }

    /// Path to `HISTORY.md`.
    pub fn history_path(&self) -> &PathBuf {
        &self.history_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (MemoryStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (MemoryStore::new(dir.path()), dir)
    }

    #[test]
    fn read_long_term_empty_when_missing() {
        let (s, _dir) = store();
        assert!(s.read_long_term().is_empty());
    }

    #[test]
    fn write_and_read_long_term() {
        let (s, _dir) = store();
        s.write_long_term("fact: the sky is blue").unwrap();
        assert_eq!(s.read_long_term(), "fact: the sky is blue");
    }

    #[test]
    fn append_history_separates_paragraphs() {
        let (s, _dir) = store();
        s.append_history("first entry").unwrap();
        s.append_history("second entry").unwrap();
        let content = s.read_history();
        assert!(content.contains("first entry"));
        assert!(content.contains("second entry"));
        assert!(content.contains("\n\n"));
    }

    #[test]
    fn today_notes_get_dated_header() {
        let (s, _dir) = store();
        s.append_today("met the user").unwrap();
        let content = s.read_today();
        assert!(content.starts_with("# "));
        assert!(content.contains("met the user"));

        s.append_today("second note").unwrap();
        assert!(s.read_today().contains("second note"));
    }

    #[test]
    fn memory_context_includes_all_layers() {
        let (s, dir) = store();
        s.write_long_term("user prefers short answers").unwrap();
        s.append_today("note for today").unwrap();
        std::fs::create_dir_all(dir.path().join("memory/learnings")).unwrap();
        std::fs::write(
            dir.path().join("memory/learnings/rust-async.md"),
            "# rust async\n",
        )
        .unwrap();

        let ctx = s.get_memory_context();
        assert!(ctx.contains("## Long-term Memory"));
        assert!(ctx.contains("short answers"));
        assert!(ctx.contains("## Today's Notes"));
        assert!(ctx.contains("## Knowledge Base"));
        assert!(ctx.contains("rust-async"));
    }

    #[test]
    fn memory_context_hides_transient_noise() {
        let (s, _dir) = store();
        // Written raw to bypass the write-side sanitizer, simulating an
        // older file with fossilized diagnostics.
        std::fs::create_dir_all(s.memory_path().parent().unwrap()).unwrap();
        std::fs::write(
            s.memory_path(),
            "# Long-term Memory\n\n- 用户偏好：新闻回答要有来源链接\n- 环境限制：BRAVE_API_KEY not configured\n",
        )
        .unwrap();

        let ctx = s.get_memory_context();
        assert!(ctx.contains("新闻回答要有来源链接"));
        assert!(!ctx.contains("BRAVE_API_KEY"));
        assert!(!ctx.to_lowercase().contains("not configured"));
    }

    #[test]
    fn sanitize_filters_api_key_lines() {
        let input = "keep this line\nBRAVE_API_KEY missing\nweb_search failed again\nand this";
        let out = sanitize_for_memory(input);
        assert!(out.contains("keep this line"));
        assert!(out.contains("and this"));
        assert!(!out.contains("BRAVE_API_KEY"));
        assert!(!out.contains("web_search failed"));
    }

    #[test]
    fn search_finds_matching_paragraphs() {
        let (s, _dir) = store();
        s.write_long_term("The sky is blue.\n\nGrass is green.\n\nThe ocean is also blue.")
            .unwrap();
        let results = s.search("blue", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], "The sky is blue.");
    }

    #[test]
    fn search_spans_both_files_and_respects_cap() {
        let (s, _dir) = store();
        s.write_long_term("memory hit here").unwrap();
        s.append_history("history hit here").unwrap();
        assert_eq!(s.search("hit here", 10).len(), 2);
        assert_eq!(s.search("hit here", 1).len(), 1);
        assert!(s.search("", 10).is_empty());
    }

    #[test]
    fn consolidation_filters_transient_lines_in_both_files() {
        let (s, _dir) = store();
        let artifact = serde_json::json!({
            "history_entry": "[2026-02-15 11:12] 用户要求最新新闻并强调要链接。助手遇到 BRAVE_API_KEY not configured。",
            "memory_update": "# Long-term Memory\n\n- 用户偏好：涉及最新新闻时必须附来源链接\n- 环境限制：BRAVE_API_KEY not configured\n",
        });
        s.apply_consolidation(&artifact).unwrap();

        let history = s.read_history();
        let memory = s.read_long_term();
        assert!(!history.contains("BRAVE_API_KEY"));
        assert!(!history.to_lowercase().contains("not configured"));
        assert!(!memory.contains("BRAVE_API_KEY"));
        assert!(memory.contains("附来源链接"));
    }

    #[test]
    fn recent_memories_joins_daily_files() {
        let (s, dir) = store();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        s.append_today("today note").unwrap();
        let recent = s.get_recent_memories(7);
        assert!(recent.contains("today note"));
    }
}
