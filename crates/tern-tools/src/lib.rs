//! Leaf tool implementations for tern.
//!
//! - **File tools** ([`file_tools`]): `read_file`, `write_file`,
//!   `edit_file`, `list_dir`
//! - **Shell tool** ([`shell`]): `exec`
//! - **Web tools** ([`web_search`], [`web_fetch`])
//!
//! The message / spawn / cron tools live in `tern-core` because they
//! need the bus and runtime managers; everything here is dependency
//! free beyond the workspace path and HTTP.

pub mod file_tools;
pub mod shell;
pub mod web_fetch;
pub mod web_search;

use std::path::PathBuf;
use std::sync::Arc;

use tern_core::tools::registry::ToolRegistry;
use tern_types::config::ToolsConfig;

/// Register the leaf tools with the given registry.
///
/// File tools resolve relative paths against `workspace` and are
/// confined to it when `config.restrict_to_workspace` is set. The shell
/// tool runs with the workspace as its working directory.
pub fn register_all(registry: &mut ToolRegistry, workspace: PathBuf, config: &ToolsConfig) {
    let restrict = config.restrict_to_workspace;
    registry.register(Arc::new(file_tools::ReadFileTool::new(
        workspace.clone(),
        restrict,
    )));
    registry.register(Arc::new(file_tools::WriteFileTool::new(
        workspace.clone(),
        restrict,
    )));
    registry.register(Arc::new(file_tools::EditFileTool::new(
        workspace.clone(),
        restrict,
    )));
    registry.register(Arc::new(file_tools::ListDirTool::new(
        workspace.clone(),
        restrict,
    )));
    registry.register(Arc::new(shell::ExecTool::new(
        workspace,
        config.exec.timeout,
        restrict,
    )));
    registry.register(Arc::new(web_search::WebSearchTool::new(
        config.web.search.clone(),
    )));
    registry.register(Arc::new(web_fetch::WebFetchTool::new()));
}
