//! Context builder: assembles the system prompt and message list.
//!
//! The system prompt is built from, in order: an identity block,
//! the workspace bootstrap files (AGENTS.md required), memory context,
//! always-on skill bodies, requested-skill bodies for the current turn,
//! and a terse XML skills summary. Sections are joined with `---`
//! separators.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use chrono::Local;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use tern_llm::types::ChatMessage;
use tern_types::{Result, TernError};

use crate::memory::MemoryStore;
use crate::skills::SkillsLoader;

/// Bootstrap files loaded when `BOOTSTRAP.md` does not override the list.
pub const DEFAULT_BOOTSTRAP_FILES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "IDENTITY.md",
    "ASSISTANT_RULES.md",
    "USER.md",
    "TOOLS.md",
    "HEARTBEAT.md",
];

/// Builds the context (system prompt + messages) for the agent.
pub struct ContextBuilder {
    workspace: PathBuf,
    pub(crate) memory: Arc<MemoryStore>,
    pub(crate) skills: Arc<SkillsLoader>,
}

impl ContextBuilder {
    /// Create a builder over a workspace.
    pub fn new(workspace: PathBuf, memory: Arc<MemoryStore>, skills: Arc<SkillsLoader>) -> Self {
        Self {
            workspace,
            memory,
            skills,
        }
    }

    /// The workspace root.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The memory store backing this builder.
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// The skills loader backing this builder.
    pub fn skills(&self) -> &Arc<SkillsLoader> {
        &self.skills
    }

    /// Bootstrap file list: `BOOTSTRAP.md` numbered entries (`1. X.md`)
    /// when present and non-empty, otherwise the default list.
    pub fn bootstrap_files(&self) -> Vec<String> {
        let bootstrap_path = self.workspace.join("BOOTSTRAP.md");
        let Ok(content) = std::fs::read_to_string(&bootstrap_path) else {
            return DEFAULT_BOOTSTRAP_FILES.iter().map(|s| s.to_string()).collect();
        };
        let re = Regex::new(r"(?m)^\d+\.\s+(\S+\.md)\s*$").expect("static regex");
        let files: Vec<String> = re
            .captures_iter(&content)
            .map(|c| c[1].to_string())
            .collect();
        if files.is_empty() {
            DEFAULT_BOOTSTRAP_FILES.iter().map(|s| s.to_string()).collect()
        } else {
            files
        }
    }

    /// Build the system prompt.
    ///
    /// # Errors
    ///
    /// Fails when `AGENTS.md` is missing; the turn surfaces that to the
    /// channel as an explicit error.
    pub fn build_system_prompt(&self, skill_names: Option<&[String]>) -> Result<String> {
        let mut parts = vec![self.identity()];

        let bootstrap = self.load_bootstrap_files()?;
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }

        let memory = self.memory.get_memory_context();
        if !memory.is_empty() {
            parts.push(format!("# Memory\n\n{memory}"));
        }

        let always = self.skills.always_skills();
        if !always.is_empty() {
            let content = self.skills.load_skills_for_context(&always);
            if !content.is_empty() {
                parts.push(format!("# Active Skills\n\n{content}"));
            }
        }

        // Requested skills for this turn, deduped against always-on.
        let mut requested: Vec<String> = Vec::new();
        if let Some(names) = skill_names {
            for name in names {
                if name.is_empty() || always.contains(name) || requested.contains(name) {
                    continue;
                }
                requested.push(name.clone());
            }
        }
        if !requested.is_empty() {
            let content = self.skills.load_skills_for_context(&requested);
            if !content.is_empty() {
                parts.push(format!(
                    "# Requested Skills (Current Turn)\n\n\
                    The current user request matched specific skills. For this turn, these rules are mandatory:\n\
                    1. Follow the requested skill workflow before free-form answering.\n\
                    2. If the skill requires real-time or external data, call tools to fetch data first.\n\
                    3. Do not guess or estimate real-time facts when a tool can retrieve them.\n\
                    4. If a required tool fails, report the failure and provide a fallback path.\n\
                    \n{content}"
                ));
            }
        }

        let summary = self.skills.build_skills_summary();
        if !summary.is_empty() {
            parts.push(format!(
                "# Skills\n\n\
                Skill policy:\n\
                - When a user request matches a skill by name or trigger, prioritize that skill workflow.\n\
                - Read the skill's SKILL.md with read_file if you need full procedural details.\n\
                - Skills with available=\"false\" need dependencies installed first - you can try installing them with apt/brew.\n\
                \n{summary}"
            ));
        }

        let prompt = parts.join("\n\n---\n\n");
        debug!(sections = parts.len(), chars = prompt.len(), "built system prompt");
        Ok(prompt)
    }

    fn identity(&self) -> String {
        let now = Local::now().format("%Y-%m-%d %H:%M (%A)");
        let workspace_path = self.workspace.display();
        let runtime = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);

        format!(
            "# Tern\n\n\
            You are Tern, an autonomous AI agent. You have access to tools that allow you to:\n\
            - Read, write, and edit files\n\
            - Execute shell commands\n\
            - Search the web and fetch web pages\n\
            - Send messages to users on chat channels\n\
            - Spawn subagents for complex background tasks\n\
            - Schedule recurring jobs\n\n\
            ## Current Time\n{now}\n\n\
            ## Runtime\n{runtime}\n\n\
            ## Workspace\n\
            Your workspace is at: {workspace_path}\n\
            - Memory files: {workspace_path}/memory/MEMORY.md\n\
            - Daily notes: {workspace_path}/memory/YYYY-MM-DD.md\n\
            - Custom skills: {workspace_path}/skills/{{skill-name}}/SKILL.md\n\n\
            IMPORTANT:\n\
            - For casual conversation that does not need external data or a skill workflow, reply directly with text.\n\
            - When the request matches a skill workflow or depends on real-time/external facts, call relevant tools first and ground your answer in tool results.\n\
            - Only use the 'message' tool when you need to send a message to a specific chat channel.\n\n\
            When asked to send files or images, use the 'message' tool with the `media` field.\n\
            This supports local file paths or URLs and will send real attachments.\n\n\
            Always be helpful, accurate, and concise. When using tools, explain what you're doing.\n\
            When remembering something, write to {workspace_path}/memory/MEMORY.md"
        )
    }

    fn load_bootstrap_files(&self) -> Result<String> {
        let agents_path = self.workspace.join("AGENTS.md");
        if !agents_path.exists() {
            return Err(TernError::MissingBootstrap {
                path: agents_path.display().to_string(),
            });
        }

        let mut parts = Vec::new();
        for filename in self.bootstrap_files() {
            let file_path = self.workspace.join(&filename);
            let Ok(content) = std::fs::read_to_string(&file_path) else {
                continue;
            };
            if filename == "AGENTS.md" {
                parts.push(format!("## Developer Instructions (AGENTS.md)\n\n{content}"));
            } else {
                parts.push(format!("## {filename}\n\n{content}"));
            }
        }
        Ok(parts.join("\n\n"))
    }

    /// Fingerprint of the bootstrap configuration.
    ///
    /// SHA-256 over `BOOTSTRAP.md` (when present) and each existing
    /// bootstrap file: name + bytes, NUL separated. Any byte change,
    /// reorder, or list change alters the digest.
    pub fn bootstrap_fingerprint(&self) -> Result<String> {
        let agents_path = self.workspace.join("AGENTS.md");
        if !agents_path.exists() {
            return Err(TernError::MissingBootstrap {
                path: agents_path.display().to_string(),
            });
        }

        let mut hasher = Sha256::new();
        let bootstrap_path = self.workspace.join("BOOTSTRAP.md");
        if let Ok(bytes) = std::fs::read(&bootstrap_path) {
            hasher.update(b"BOOTSTRAP.md\0");
            hasher.update(&bytes);
            hasher.update(b"\0");
        }
        for filename in self.bootstrap_files() {
            let file_path = self.workspace.join(&filename);
            let Ok(bytes) = std::fs::read(&file_path) else {
                continue;
            };
            hasher.update(filename.as_bytes());
            hasher.update(b"\0");
            hasher.update(&bytes);
            hasher.update(b"\0");
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Build the complete message list for an LLM call: optional system
    /// prompt, verbatim history, then the current user message (media
    /// images inlined as data URLs).
    #[allow(clippy::too_many_arguments)]
    pub fn build_messages(
        &self,
        history: &[serde_json::Value],
        current_message: &str,
        skill_names: Option<&[String]>,
        media: Option<&[String]>,
        channel: Option<&str>,
        chat_id: Option<&str>,
        summary: Option<&str>,
        include_system: bool,
    ) -> Result<Vec<ChatMessage>> {
        let mut messages = Vec::new();

        if include_system {
            let mut system_prompt = self.build_system_prompt(skill_names)?;
            if let (Some(channel), Some(chat_id)) = (channel, chat_id) {
                system_prompt.push_str(&format!(
                    "\n\n## Current Session\nChannel: {channel}\nChat ID: {chat_id}"
                ));
            }
            if channel == Some("web") {
                system_prompt.push_str(
                    "\n\n## Web Channel Capabilities\n\
                    Attachment delivery is supported in this chat. To send a file to the user, \
                    use the `message` tool with `media` paths/URLs.",
                );
            }
            if let Some(summary) = summary {
                if !summary.is_empty() {
                    system_prompt.push_str(&format!("\n\n## Conversation Summary\n{summary}"));
                }
            }
            messages.push(ChatMessage::system(system_prompt));
        }

        for entry in history {
            let role = entry
                .get("role")
                .and_then(|v| v.as_str())
                .unwrap_or("user")
                .to_string();
            let content = entry
                .get("content")
                .cloned()
                .unwrap_or(serde_json::Value::String(String::new()));
            messages.push(ChatMessage {
                role,
                content,
                name: None,
                tool_call_id: None,
                tool_calls: None,
                reasoning_content: None,
            });
        }

        messages.push(ChatMessage {
            role: "user".into(),
            content: self.build_user_content(current_message, media),
            name: None,
            tool_call_id: None,
            tool_calls: None,
            reasoning_content: None,
        });

        Ok(messages)
    }

    /// User content with image attachments encoded as data-URL blocks.
    /// Non-image or unreadable paths are dropped.
    fn build_user_content(&self, text: &str, media: Option<&[String]>) -> serde_json::Value {
        let Some(media) = media.filter(|m| !m.is_empty()) else {
            return serde_json::Value::String(text.to_string());
        };

        let mut blocks = Vec::new();
        for path in media {
            let Some(mime) = image_mime(path) else {
                continue;
            };
            let Ok(bytes) = std::fs::read(path) else {
                warn!(path = %path, "dropping unreadable media attachment");
                continue;
            };
            let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
            blocks.push(serde_json::json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{mime};base64,{b64}")}
            }));
        }

        if blocks.is_empty() {
            return serde_json::Value::String(text.to_string());
        }
        blocks.push(serde_json::json!({"type": "text", "text": text}));
        serde_json::Value::Array(blocks)
    }

    /// Append a tool-result message.
    pub fn add_tool_result(
        &self,
        messages: &mut Vec<ChatMessage>,
        tool_call_id: &str,
        tool_name: &str,
        result: &str,
    ) {
        messages.push(ChatMessage::tool_result(tool_call_id, tool_name, result));
    }

    /// Append an assistant message, optionally carrying tool calls.
    pub fn add_assistant_message(
        &self,
        messages: &mut Vec<ChatMessage>,
        content: &str,
        tool_calls: Option<Vec<serde_json::Value>>,
    ) {
        messages.push(ChatMessage {
            role: "assistant".into(),
            content: serde_json::Value::String(content.to_string()),
            name: None,
            tool_call_id: None,
            tool_calls,
            reasoning_content: None,
        });
    }
}

/// Image MIME type by file extension, `None` for non-images.
fn image_mime(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (ContextBuilder, TempDir) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "# AGENTS\n\nTest instructions.\n").unwrap();
        let memory = Arc::new(MemoryStore::new(dir.path()));
        let skills = Arc::new(SkillsLoader::new(dir.path(), None));
        let builder = ContextBuilder::new(dir.path().to_path_buf(), memory, skills);
        (builder, dir)
    }

    fn write_skill(workspace: &Path, name: &str, triggers: &[&str]) {
        let skill_dir = workspace.join("skills").join(name);
        std::fs::create_dir_all(&skill_dir).unwrap();
        let metadata = serde_json::json!({"tern": {"triggers": triggers}});
        std::fs::write(
            skill_dir.join("SKILL.md"),
            format!("---\nname: {name}\ndescription: {name} skill\nmetadata: {metadata}\n---\n\n# {name}\n\nUse the {name} skill workflow.\n"),
        )
        .unwrap();
    }

    #[test]
    fn system_prompt_contains_identity_and_bootstrap() {
        let (builder, _dir) = setup();
        let prompt = builder.build_system_prompt(None).unwrap();
        assert!(prompt.contains("# Tern"));
        assert!(prompt.contains("## Current Time"));
        assert!(prompt.contains("Developer Instructions (AGENTS.md)"));
        assert!(prompt.contains("Test instructions."));
    }

    #[test]
    fn missing_agents_md_is_fatal() {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::new(dir.path()));
        let skills = Arc::new(SkillsLoader::new(dir.path(), None));
        let builder = ContextBuilder::new(dir.path().to_path_buf(), memory, skills);
        let err = builder.build_system_prompt(None).unwrap_err();
        assert!(matches!(err, TernError::MissingBootstrap { .. }));
        assert!(builder.bootstrap_fingerprint().is_err());
    }

    #[test]
    fn bootstrap_md_overrides_file_list() {
        let (builder, dir) = setup();
        std::fs::write(dir.path().join("SOUL.md"), "soul content").unwrap();
        std::fs::write(dir.path().join("EXTRA.md"), "extra content").unwrap();
        std::fs::write(
            dir.path().join("BOOTSTRAP.md"),
            "Load order:\n1. AGENTS.md\n2. EXTRA.md\n",
        )
        .unwrap();

        assert_eq!(builder.bootstrap_files(), vec!["AGENTS.md", "EXTRA.md"]);
        let prompt = builder.build_system_prompt(None).unwrap();
        assert!(prompt.contains("extra content"));
        assert!(!prompt.contains("soul content"));
    }

    #[test]
    fn requested_skills_section_is_conditional() {
        let (builder, dir) = setup();
        write_skill(dir.path(), "weather", &["weather", "天气"]);

        let without = builder.build_system_prompt(None).unwrap();
        assert!(!without.contains("# Requested Skills (Current Turn)"));

        let with = builder
            .build_system_prompt(Some(&["weather".to_string()]))
            .unwrap();
        assert!(with.contains("# Requested Skills (Current Turn)"));
        assert!(with.contains("### Skill: weather"));
        assert!(with.contains("Follow the requested skill workflow before free-form answering."));
    }

    #[test]
    fn fingerprint_changes_with_content_and_list() {
        let (builder, dir) = setup();
        let base = builder.bootstrap_fingerprint().unwrap();

        // Changing a bootstrap file changes the fingerprint.
        std::fs::write(dir.path().join("AGENTS.md"), "# AGENTS\n\nEdited.\n").unwrap();
        let edited = builder.bootstrap_fingerprint().unwrap();
        assert_ne!(base, edited);

        // Adding a listed file changes it.
        std::fs::write(dir.path().join("SOUL.md"), "soul").unwrap();
        let with_soul = builder.bootstrap_fingerprint().unwrap();
        assert_ne!(edited, with_soul);

        // Unrelated workspace files do not.
        std::fs::write(dir.path().join("scratch.txt"), "noise").unwrap();
        assert_eq!(with_soul, builder.bootstrap_fingerprint().unwrap());

        // Reordering via BOOTSTRAP.md changes it.
        std::fs::write(
            dir.path().join("BOOTSTRAP.md"),
            "1. SOUL.md\n2. AGENTS.md\n",
        )
        .unwrap();
        assert_ne!(with_soul, builder.bootstrap_fingerprint().unwrap());
    }

    #[test]
    fn build_messages_order_and_session_block() {
        let (builder, _dir) = setup();
        let history = vec![
            serde_json::json!({"role": "user", "content": "earlier"}),
            serde_json::json!({"role": "assistant", "content": "reply"}),
        ];
        let messages = builder
            .build_messages(
                &history,
                "current question",
                None,
                None,
                Some("feishu"),
                Some("chat9"),
                Some("summary text"),
                true,
            )
            .unwrap();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        let system = messages[0].content_text();
        assert!(system.contains("## Current Session\nChannel: feishu\nChat ID: chat9"));
        assert!(system.contains("## Conversation Summary\nsummary text"));
        assert_eq!(messages[1].content_text(), "earlier");
        assert_eq!(messages[3].content_text(), "current question");
    }

    #[test]
    fn web_channel_gets_capability_block() {
        let (builder, _dir) = setup();
        let messages = builder
            .build_messages(&[], "send me the doc", None, None, Some("web"), Some("c"), None, true)
            .unwrap();
        let system = messages[0].content_text();
        assert!(system.contains("## Web Channel Capabilities"));
        assert!(system.contains("Attachment delivery is supported in this chat."));
        assert!(system.contains("use the `message` tool with `media` paths/URLs."));
    }

    #[test]
    fn native_mode_omits_system_message() {
        let (builder, _dir) = setup();
        let messages = builder
            .build_messages(&[], "hi", None, None, Some("web"), Some("c"), None, false)
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn media_images_become_data_urls() {
        let (builder, dir) = setup();
        let img_path = dir.path().join("shot.png");
        std::fs::write(&img_path, b"\x89PNG\r\n\x1a\nfake").unwrap();
        let media = vec![
            img_path.display().to_string(),
            "/nonexistent/file.png".to_string(),
            dir.path().join("AGENTS.md").display().to_string(),
        ];
        let messages = builder
            .build_messages(&[], "look at this", None, Some(&media), None, None, None, false)
            .unwrap();
        let blocks = messages[0].content.as_array().expect("block content");
        // One valid image + the trailing text block.
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(blocks[1]["text"], "look at this");
    }

    #[test]
    fn invalid_media_falls_back_to_text() {
        let (builder, _dir) = setup();
        let media = vec!["/nonexistent/missing.png".to_string()];
        let messages = builder
            .build_messages(&[], "plain", None, Some(&media), None, None, None, false)
            .unwrap();
        assert_eq!(messages[0].content_text(), "plain");
    }

    #[test]
    fn tool_result_and_assistant_helpers() {
        let (builder, _dir) = setup();
        let mut messages = Vec::new();
        builder.add_assistant_message(
            &mut messages,
            "",
            Some(vec![serde_json::json!({"id": "call_1"})]),
        );
        builder.add_tool_result(&mut messages, "call_1", "web_search", "results here");
        assert_eq!(messages[0].role, "assistant");
        assert!(messages[0].tool_calls.is_some());
        assert_eq!(messages[1].role, "tool");
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(messages[1].name.as_deref(), Some("web_search"));
    }
}
