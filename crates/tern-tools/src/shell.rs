//! Shell execution tool.
//!
//! Runs commands through `sh -c` with the workspace as working
//! directory. A per-call timeout (capped by configuration) kills the
//! subprocess, and a guard rejects obviously destructive commands
//! before they run.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use tern_core::tools::registry::{Tool, ToolError};

/// Upper bound any per-call timeout is clamped to.
const MAX_TIMEOUT_SECS: u64 = 300;

/// Patterns that reject a command outright (case-insensitive).
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    "sudo ",
    "mkfs",
    "dd if=",
    ":(){ :|:& };:",
    "chmod 777 /",
    "> /dev/sd",
    "shutdown",
    "reboot",
    "poweroff",
];

fn dangerous_pattern(command: &str) -> Option<&'static str> {
    let lower = command.to_lowercase();
    DANGEROUS_PATTERNS
        .iter()
        .find(|p| lower.contains(*p))
        .copied()
}

/// Execute shell commands with timeout enforcement.
pub struct ExecTool {
    working_dir: PathBuf,
    default_timeout: u64,
    restrict_to_workspace: bool,
}

impl ExecTool {
    /// Create the tool. `default_timeout` is in seconds.
    pub fn new(working_dir: PathBuf, default_timeout: u64, restrict_to_workspace: bool) -> Self {
        Self {
            working_dir,
            default_timeout,
            restrict_to_workspace,
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return stdout/stderr. \
         Long-running commands are killed after the timeout."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to run"},
                "timeout": {"type": "number", "description": "Timeout in seconds (optional)"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs("missing required field: command".into()))?;

        let timeout_secs = args
            .get("timeout")
            .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
            .unwrap_or(self.default_timeout)
            .min(MAX_TIMEOUT_SECS)
            .max(1);

        if let Some(pattern) = dangerous_pattern(command) {
            warn!(command, pattern, "dangerous command rejected");
            return Err(ToolError::ExecutionFailed(format!(
                "command blocked by safety guard (matched: {pattern})"
            )));
        }

        if self.restrict_to_workspace && command.contains("..") {
            return Err(ToolError::InvalidPath(
                "parent-directory traversal is not allowed in restricted mode".into(),
            ));
        }

        debug!(command, timeout_secs, "executing shell command");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn process: {e}")))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        let wait = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            child.wait(),
        )
        .await;

        let status = match wait {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed(format!("process error: {e}")));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(ToolError::Timeout(timeout_secs));
            }
        };

        let mut stdout = Vec::new();
        if let Some(handle) = stdout_handle.as_mut() {
            let _ = handle.read_to_end(&mut stdout).await;
        }
        let mut stderr = Vec::new();
        if let Some(handle) = stderr_handle.as_mut() {
            let _ = handle.read_to_end(&mut stderr).await;
        }

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);
        let exit_code = status.code().unwrap_or(-1);

        let mut parts = Vec::new();
        if !stdout.trim().is_empty() {
            parts.push(stdout.trim_end().to_string());
        }
        if !stderr.trim().is_empty() {
            parts.push(format!("stderr:\n{}", stderr.trim_end()));
        }
        if exit_code != 0 {
            parts.push(format!("(exit code {exit_code})"));
        }
        if parts.is_empty() {
            parts.push("(no output)".into());
        }
        Ok(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tool(timeout: u64) -> (ExecTool, TempDir) {
        let dir = TempDir::new().unwrap();
        (ExecTool::new(dir.path().to_path_buf(), timeout, false), dir)
    }

    #[tokio::test]
    async fn captures_stdout() {
        let (tool, _dir) = tool(10);
        let result = tool
            .execute(json!({"command": "printf 'hello world'"}))
            .await
            .unwrap();
        assert_eq!(result, "hello world");
    }

    #[tokio::test]
    async fn captures_stderr_and_exit_code() {
        let (tool, _dir) = tool(10);
        let result = tool
            .execute(json!({"command": "printf 'oops' >&2; exit 3"}))
            .await
            .unwrap();
        assert!(result.contains("stderr:\noops"));
        assert!(result.contains("(exit code 3)"));
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let (tool, dir) = tool(10);
        let result = tool.execute(json!({"command": "pwd"})).await.unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(result.trim()).canonicalize().unwrap(),
            canonical
        );
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let (tool, _dir) = tool(1);
        let err = tool
            .execute(json!({"command": "sleep 5"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(1)));
    }

    #[tokio::test]
    async fn dangerous_commands_rejected() {
        let (tool, _dir) = tool(10);
        let err = tool
            .execute(json!({"command": "sudo rm -rf /"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("safety guard"));
    }

    #[tokio::test]
    async fn restricted_mode_blocks_traversal() {
        let dir = TempDir::new().unwrap();
        let tool = ExecTool::new(dir.path().to_path_buf(), 10, true);
        let err = tool
            .execute(json!({"command": "cat ../../etc/passwd"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn empty_output_is_reported() {
        let (tool, _dir) = tool(10);
        let result = tool.execute(json!({"command": "true"})).await.unwrap();
        assert_eq!(result, "(no output)");
    }
}
