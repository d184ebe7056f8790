//! File tools: read, write, edit, and list directory.
//!
//! Relative paths resolve against the workspace. With workspace
//! restriction enabled, paths are canonicalized (via their deepest
//! existing ancestor for not-yet-created files) and verified to stay
//! inside the workspace.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use tern_core::tools::registry::{Tool, ToolError};

/// Cap on file content returned to the model.
const MAX_READ_BYTES: usize = 262_144;

fn required_str(args: &serde_json::Value, field: &str) -> Result<String, ToolError> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing required field: {field}")))
}

/// Resolve `path` against the workspace and enforce containment when
/// restricted. Works for paths that do not exist yet by canonicalizing
/// the deepest existing ancestor.
fn resolve_path(path: &str, workspace: &Path, restrict: bool) -> Result<PathBuf, ToolError> {
    let raw = Path::new(path);
    let resolved = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        workspace.join(raw)
    };

    if !restrict {
        return Ok(resolved);
    }

    let mut ancestor = resolved.as_path();
    while !ancestor.exists() {
        ancestor = ancestor
            .parent()
            .ok_or_else(|| ToolError::InvalidPath(format!("path escapes workspace: {path}")))?;
    }
    let canonical_ancestor = ancestor
        .canonicalize()
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    let workspace_canonical = workspace
        .canonicalize()
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    if !canonical_ancestor.starts_with(&workspace_canonical) {
        return Err(ToolError::InvalidPath(format!(
            "path escapes workspace: {path}"
        )));
    }
    Ok(resolved)
}

/// Read a file's content.
pub struct ReadFileTool {
    workspace: PathBuf,
    restrict: bool,
}

impl ReadFileTool {
    /// Create the tool.
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file and return its content. Paths are relative to the workspace."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path to read"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = required_str(&args, "path")?;
        let resolved = resolve_path(&path, &self.workspace, self.restrict)?;
        debug!(path = %resolved.display(), "reading file");

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ToolError::NotFound(path.clone()),
                _ => ToolError::ExecutionFailed(e.to_string()),
            })?;

        if content.len() > MAX_READ_BYTES {
            let truncated: String = content.chars().take(MAX_READ_BYTES).collect();
            return Ok(format!("{truncated}\n...(truncated, {} bytes total)", content.len()));
        }
        Ok(content)
    }
}

/// Write (create or overwrite) a file.
pub struct WriteFileTool {
    workspace: PathBuf,
    restrict: bool,
}

impl WriteFileTool {
    /// Create the tool.
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed. Overwrites existing files."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path to write"},
                "content": {"type": "string", "description": "Content to write"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;
        let resolved = resolve_path(&path, &self.workspace, self.restrict)?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        }
        tokio::fs::write(&resolved, &content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        debug!(path = %resolved.display(), bytes = content.len(), "wrote file");
        Ok(format!("Successfully wrote {} bytes to {path}", content.len()))
    }
}

/// Replace text in a file.
pub struct EditFileTool {
    workspace: PathBuf,
    restrict: bool,
}

impl EditFileTool {
    /// Create the tool.
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact text occurrence in a file. The old text must appear exactly once."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path to edit"},
                "old_text": {"type": "string", "description": "Exact text to replace"},
                "new_text": {"type": "string", "description": "Replacement text"}
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = required_str(&args, "path")?;
        let old_text = required_str(&args, "old_text")?;
        let new_text = required_str(&args, "new_text")?;
        let resolved = resolve_path(&path, &self.workspace, self.restrict)?;

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ToolError::NotFound(path.clone()),
                _ => ToolError::ExecutionFailed(e.to_string()),
            })?;

        let occurrences = content.matches(&old_text).count();
        if occurrences == 0 {
            return Err(ToolError::InvalidArgs(format!(
                "old_text not found in {path}"
            )));
        }
        if occurrences > 1 {
            return Err(ToolError::InvalidArgs(format!(
                "old_text appears {occurrences} times in {path}; it must be unique"
            )));
        }

        let updated = content.replacen(&old_text, &new_text, 1);
        tokio::fs::write(&resolved, updated)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(format!("Successfully edited {path}"))
    }
}

/// List directory entries.
pub struct ListDirTool {
    workspace: PathBuf,
    restrict: bool,
}

impl ListDirTool {
    /// Create the tool.
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Defaults to the workspace root."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory path (default: workspace root)"}
            }
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();
        let resolved = resolve_path(&path, &self.workspace, self.restrict)?;

        let mut dir = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ToolError::NotFound(path.clone()),
                _ => ToolError::ExecutionFailed(e.to_string()),
            })?;

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let suffix = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => "/",
                _ => "",
            };
            entries.push(format!("{name}{suffix}"));
        }
        entries.sort();
        if entries.is_empty() {
            Ok(format!("{path} is empty"))
        } else {
            Ok(entries.join("\n"))
        }
    }
}
