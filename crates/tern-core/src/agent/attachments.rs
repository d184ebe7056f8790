//! Attachment-claim reconciliation.
//!
//! When the final reply claims a file was delivered, the loop checks
//! whether anything was actually sent. A claim with a resolvable
//! workspace file gets that file attached; a claim that resolves to
//! nothing is rewritten to state that no attachment went out.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use walkdir::WalkDir;

/// Substrings that count as a delivery claim.
const CLAIM_MARKERS: &[&str] = &[
    "已发",
    "发你",
    "已经发送",
    "已发送",
    "请查收",
    "sent you",
    "i've sent",
    "i have sent",
];

/// Max directory depth searched when resolving a bare filename.
const SEARCH_DEPTH: usize = 6;

fn filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`\s]+\.[A-Za-z0-9]{1,8})`").expect("static pattern"))
}

/// Whether the content claims an attachment was delivered.
pub fn claims_delivery(content: &str) -> bool {
    let lowered = content.to_lowercase();
    CLAIM_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Backtick-quoted filenames mentioned in the content.
pub fn claimed_files(content: &str) -> Vec<String> {
    filename_regex()
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .collect()
}

/// Resolve a claimed file against the workspace.
///
/// Paths with separators are joined onto the workspace; bare filenames
/// are searched for by name within a bounded depth. Returns the
/// canonical absolute path.
pub fn resolve_claimed_file(workspace: &Path, name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = workspace.join(name);
        if candidate.is_file() {
            return candidate.canonicalize().ok();
        }
        return None;
    }

    for entry in WalkDir::new(workspace)
        .max_depth(SEARCH_DEPTH)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy() == name
        {
            return entry.path().canonicalize().ok();
        }
    }
    None
}

/// Resolve any claimed file mentioned in the content.
pub fn resolve_any_claimed_file(workspace: &Path, content: &str) -> Option<PathBuf> {
    claimed_files(content)
        .iter()
        .find_map(|name| resolve_claimed_file(workspace, name))
}

/// Rewrite a delivery claim that resolved to nothing.
pub fn rewrite_failed_claim(content: &str) -> String {
    let names = claimed_files(content);
    if let Some(name) = names.first() {
        format!("抱歉，我还没有真正发出附件：未能在工作区找到 `{name}`。请告诉我正确的文件路径。")
    } else {
        "抱歉，我还没有真正发出附件：未能找到可发送的文件。请告诉我具体的文件路径。".to_string()
    }
}
