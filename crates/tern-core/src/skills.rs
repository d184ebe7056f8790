//! Skill discovery, routing, and workflow-policy extraction.
//!
//! A skill is a directory holding a `SKILL.md` playbook. Frontmatter is
//! a fenced `---` block of `key: value` lines; the `metadata:` value is
//! JSON whose runtime namespace (`tern`, with `nanobot` accepted for
//! imported skill packs) carries routing fields:
//!
//! ```text
//! ---
//! name: weather
//! description: Get weather and forecast
//! metadata: {"tern": {"triggers": ["weather", "天气"], "allowed_tools": ["web_fetch"]}}
//! ---
//! ```
//!
//! Workspace skills shadow builtin skills of the same name.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use tern_types::workflow::{CompletionRule, FailureMode, WorkflowPolicy};

/// Tags that mark a skill as realtime/network bound, subjecting it to
/// the tool-round hard limit.
const ROUND_LIMIT_MARKER_TAGS: &[&str] = &[
    "realtime",
    "real-time",
    "real_time",
    "network",
    "networked",
    "live",
    "live-data",
    "external-data",
    "external",
    "weather",
];

/// Basic info about a discovered skill.
#[derive(Debug, Clone)]
pub struct SkillInfo {
    /// Directory name.
    pub name: String,
    /// Path to its SKILL.md.
    pub path: PathBuf,
    /// "workspace" or "builtin".
    pub source: &'static str,
}

/// Loads skills from the workspace and an optional builtin directory.
pub struct SkillsLoader {
    workspace_skills: PathBuf,
    builtin_skills: Option<PathBuf>,
}

impl SkillsLoader {
    /// Create a loader for `<workspace>/skills` plus optional builtins.
    pub fn new(workspace: &Path, builtin_skills: Option<PathBuf>) -> Self {
        Self {
            workspace_skills: workspace.join("skills"),
            builtin_skills,
        }
    }

    /// List skills, workspace first, shadowing builtins by name.
    ///
    /// With `filter_unavailable`, skills whose declared requirements
    /// (binaries on PATH, env vars set) are unmet are dropped.
    pub fn list_skills(&self, filter_unavailable: bool) -> Vec<SkillInfo> {
        let mut skills: Vec<SkillInfo> = Vec::new();

        for (dir, source) in [
            (Some(&self.workspace_skills), "workspace"),
            (self.builtin_skills.as_ref(), "builtin"),
        ] {
            let Some(dir) = dir else { continue };
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut found: Vec<SkillInfo> = Vec::new();
            for entry in entries.flatten() {
                let skill_dir = entry.path();
                if !skill_dir.is_dir() {
                    continue;
                }
                let skill_file = skill_dir.join("SKILL.md");
                if !skill_file.exists() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if skills.iter().any(|s| s.name == name) {
                    continue;
                }
                found.push(SkillInfo {
                    name,
                    path: skill_file,
                    source,
                });
            }
            found.sort_by(|a, b| a.name.cmp(&b.name));
            skills.extend(found);
        }

        if filter_unavailable {
            skills.retain(|s| self.requirements_met(&self.skill_meta(&s.name)));
        }
        skills
    }

    /// Load a skill's full SKILL.md content by name.
    pub fn load_skill(&self, name: &str) -> Option<String> {
        let workspace_skill = self.workspace_skills.join(name).join("SKILL.md");
        if let Ok(content) = std::fs::read_to_string(&workspace_skill) {
            return Some(content);
        }
        let builtin = self.builtin_skills.as_ref()?;
        std::fs::read_to_string(builtin.join(name).join("SKILL.md")).ok()
    }

    /// Load the named skills for prompt inclusion, frontmatter stripped.
    pub fn load_skills_for_context(&self, skill_names: &[String]) -> String {
        let mut parts = Vec::new();
        for name in skill_names {
            if let Some(content) = self.load_skill(name) {
                let body = strip_frontmatter(&content);
                parts.push(format!("### Skill: {name}\n\n{body}"));
            }
        }
        parts.join("\n\n---\n\n")
    }

    /// XML summary of every skill (name, description, location,
    /// availability, missing requirements) for progressive loading.
    pub fn build_skills_summary(&self) -> String {
        let all = self.list_skills(false);
        if all.is_empty() {
            return String::new();
        }
        let mut lines = vec!["<skills>".to_string()];
        for skill in &all {
            let meta = self.skill_meta(&skill.name);
            let available = self.requirements_met(&meta);
            let desc = self
                .frontmatter(&skill.name)
                .and_then(|fm| fm.get("description").cloned())
                .unwrap_or_else(|| skill.name.clone());

            lines.push(format!("  <skill available=\"{available}\">"));
            lines.push(format!("    <name>{}</name>", escape_xml(&skill.name)));
            lines.push(format!("    <description>{}</description>", escape_xml(&desc)));
            lines.push(format!("    <location>{}</location>", skill.path.display()));
            if !available {
                let missing = self.missing_requirements(&meta);
                if !missing.is_empty() {
                    lines.push(format!("    <requires>{}</requires>", escape_xml(&missing)));
                }
            }
            lines.push("  </skill>".to_string());
        }
        lines.push("</skills>".to_string());
        lines.join("\n")
    }

    /// Select relevant available skills for a user message.
    ///
    /// Scoring: +100 explicit name mention, +60 per alias mention,
    /// +20 per trigger hit. Ordered by score desc, trigger hits desc,
    /// name asc; top `max_skills` with score > 0. Empty messages and
    /// `/`-commands match nothing.
    pub fn select_for_message(&self, message: &str, max_skills: usize) -> Vec<String> {
        let text = message.trim();
        if text.is_empty() || text.starts_with('/') {
            return Vec::new();
        }
        let lowered = text.to_lowercase();

        let mut candidates: Vec<(i64, usize, String)> = Vec::new();
        for skill in self.list_skills(true) {
            let name_lower = skill.name.to_lowercase();
            let mut score: i64 = 0;
            let mut trigger_hits = 0usize;

            if is_explicit_mention(&lowered, &name_lower) {
                score += 100;
            }

            let meta = self.skill_meta(&skill.name);
            for alias in normalize_list(meta.get("aliases")) {
                if is_explicit_mention(&lowered, &alias) {
                    score += 60;
                }
            }
            for trigger in normalize_list(meta.get("triggers")) {
                if message_matches_trigger(&lowered, &trigger) {
                    trigger_hits += 1;
                    score += 20;
                }
            }

            if score > 0 {
                candidates.push((score, trigger_hits, skill.name));
            }
        }

        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(a.2.cmp(&b.2))
        });
        let limit = max_skills.max(1);
        candidates.into_iter().take(limit).map(|(_, _, n)| n).collect()
    }

    /// Allowed tool names collected across matched skills,
    /// de-duplicated, first-seen order preserved.
    pub fn allowed_tools_for(&self, skill_names: &[String]) -> Vec<String> {
        let mut selected = Vec::new();
        let mut seen = HashSet::new();
        for name in skill_names {
            let meta = self.skill_meta(name);
            for tool in raw_list(meta.get("allowed_tools")) {
                let normalized = tool.trim().to_string();
                if normalized.is_empty() || !seen.insert(normalized.clone()) {
                    continue;
                }
                selected.push(normalized);
            }
        }
        selected
    }

    /// Matched skills subject to the tool-round hard limit: flagged
    /// explicitly or tagged with a realtime/network marker.
    pub fn tool_round_limited(&self, skill_names: &[String]) -> Vec<String> {
        let mut selected = Vec::new();
        let mut seen = HashSet::new();
        for name in skill_names {
            if !seen.insert(name.clone()) {
                continue;
            }
            let meta = self.skill_meta(name);
            if meta
                .get("tool_round_limit")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                selected.push(name.clone());
                continue;
            }
            let mut markers = normalize_list(meta.get("tags"));
            for cat in normalize_list(meta.get("categories")) {
                if !markers.contains(&cat) {
                    markers.push(cat);
                }
            }
            if markers
                .iter()
                .any(|tag| ROUND_LIMIT_MARKER_TAGS.contains(&tag.as_str()))
            {
                selected.push(name.clone());
            }
        }
        selected
    }

    /// Skills marked `always: true` that meet their requirements.
    pub fn always_skills(&self) -> Vec<String> {
        self.list_skills(true)
            .into_iter()
            .filter(|s| {
                let meta = self.skill_meta(&s.name);
                meta.get("always").and_then(|v| v.as_bool()).unwrap_or(false)
                    || self
                        .frontmatter(&s.name)
                        .and_then(|fm| fm.get("always").cloned())
                        .map(|v| v == "true")
                        .unwrap_or(false)
            })
            .map(|s| s.name)
            .collect()
    }

    /// Merge workflow metadata across matched skills.
    ///
    /// Union semantics for lists, `enforcement_retries` takes the max,
    /// `hard_fail` dominates `explain_missing`, milestone interval and
    /// cap take the max, templates are first-seen. Returns `None` when
    /// no matched skill imposes anything.
    pub fn workflow_policy_for(&self, skill_names: &[String]) -> Option<WorkflowPolicy> {
        let mut merged = WorkflowPolicy::default();
        let mut seen_substantive = HashSet::new();
        let mut seen_forbid = HashSet::new();
        let mut seen_claims = HashSet::new();
        let mut seen_rules = HashSet::new();

        for name in skill_names {
            let meta = self.skill_meta(name);
            let Some(workflow) = meta.get("workflow").and_then(|v| v.as_object()) else {
                continue;
            };

            if let Some(kickoff) = workflow.get("kickoff").and_then(|v| v.as_object()) {
                if kickoff
                    .get("require_substantive_action")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    merged.kickoff.require_substantive_action = true;
                }
                for tool in normalize_list(kickoff.get("substantive_tools")) {
                    if seen_substantive.insert(tool.clone()) {
                        merged.kickoff.substantive_tools.push(tool);
                    }
                }
                for tool in normalize_list(kickoff.get("forbid_as_first_only")) {
                    if seen_forbid.insert(tool.clone()) {
                        merged.kickoff.forbid_as_first_only.push(tool);
                    }
                }
            }

            if let Some(completion) = workflow.get("completion").and_then(|v| v.as_object()) {
                if let Some(rules) = completion.get("require_tool_calls").and_then(|v| v.as_array())
                {
                    for raw in rules {
                        let Some(rule) = normalize_rule(raw) else { continue };
                        let signature = format!("{}|{}", rule.name, rule.describe());
                        if seen_rules.insert(signature) {
                            merged.completion.require_tool_calls.push(rule);
                        }
                    }
                }
            }

            if let Some(retry) = workflow.get("retry").and_then(|v| v.as_object()) {
                let retries = retry
                    .get("enforcement_retries")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
                if retries > merged.retry.enforcement_retries {
                    merged.retry.enforcement_retries = retries;
                }
                let mode = retry
                    .get("failure_mode")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_lowercase();
                if mode == "hard_fail" {
                    merged.retry.failure_mode = FailureMode::HardFail;
                }
            }

            if let Some(progress) = workflow.get("progress").and_then(|v| v.as_object()) {
                if progress
                    .get("claim_requires_actions")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    merged.progress.claim_requires_actions = true;
                }
                for pattern in raw_list(progress.get("claim_patterns")) {
                    if seen_claims.insert(pattern.clone()) {
                        merged.progress.claim_patterns.push(pattern);
                    }
                }
                if let Some(milestones) = progress.get("milestones").and_then(|v| v.as_object()) {
                    let target = &mut merged.progress.milestones;
                    if milestones
                        .get("enabled")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                    {
                        target.enabled = true;
                    }
                    let interval = milestones
                        .get("tool_call_interval")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as usize;
                    if interval > target.tool_call_interval {
                        target.tool_call_interval = interval;
                    }
                    let max_messages = milestones
                        .get("max_messages")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as usize;
                    if max_messages > target.max_messages {
                        target.max_messages = max_messages;
                    }
                    if let Some(templates) = milestones.get("templates").and_then(|v| v.as_object())
                    {
                        for (key, value) in templates {
                            let template_key = key.trim().to_lowercase();
                            let Some(text) = value.as_str().map(str::trim) else {
                                continue;
                            };
                            if template_key.is_empty() || text.is_empty() {
                                continue;
                            }
                            target
                                .templates
                                .entry(template_key)
                                .or_insert_with(|| text.to_string());
                        }
                    }
                }
            }
        }

        if merged.has_requirements() {
            Some(merged)
        } else {
            None
        }
    }

    /// Frontmatter `key: value` pairs for a skill, if it has any.
    pub fn frontmatter(&self, name: &str) -> Option<HashMap<String, String>> {
        let content = self.load_skill(name)?;
        parse_frontmatter(&content)
    }

    /// Runtime metadata namespace for a skill (empty object when absent).
    fn skill_meta(&self, name: &str) -> Value {
        let Some(fm) = self.frontmatter(name) else {
            return Value::Object(Default::default());
        };
        let Some(raw) = fm.get("metadata") else {
            return Value::Object(Default::default());
        };
        let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
            debug!(skill = name, "skill metadata is not valid JSON");
            return Value::Object(Default::default());
        };
        parsed
            .get("tern")
            .or_else(|| parsed.get("nanobot"))
            .cloned()
            .unwrap_or(Value::Object(Default::default()))
    }

    fn requirements_met(&self, meta: &Value) -> bool {
        let Some(requires) = meta.get("requires") else {
            return true;
        };
        for bin in raw_list(requires.get("bins")) {
            if which::which(&bin).is_err() {
                return false;
            }
        }
        for env in raw_list(requires.get("env")) {
            if std::env::var(&env).map(|v| v.is_empty()).unwrap_or(true) {
                return false;
            }
        }
        true
    }

    fn missing_requirements(&self, meta: &Value) -> String {
        let Some(requires) = meta.get("requires") else {
            return String::new();
        };
        let mut missing = Vec::new();
        for bin in raw_list(requires.get("bins")) {
            if which::which(&bin).is_err() {
                missing.push(format!("CLI: {bin}"));
            }
        }
        for env in raw_list(requires.get("env")) {
            if std::env::var(&env).map(|v| v.is_empty()).unwrap_or(true) {
                missing.push(format!("ENV: {env}"));
            }
        }
        missing.join(", ")
    }
}

// ── Frontmatter & matching helpers ───────────────────────────────────────

/// Parse a leading `---` frontmatter block into `key: value` pairs.
pub fn parse_frontmatter(content: &str) -> Option<HashMap<String, String>> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let block = &rest[..end];
    let mut metadata = HashMap::new();
    for line in block.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            metadata.insert(key.to_string(), value.to_string());
        }
    }
    Some(metadata)
}

/// Remove the frontmatter block from markdown content.
pub fn strip_frontmatter(content: &str) -> String {
    if let Some(rest) = content.strip_prefix("---") {
        if let Some(end) = rest.find("\n---") {
            let after = &rest[end + 4..];
            return after.trim_start_matches('\n').trim().to_string();
        }
    }
    content.to_string()
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn contains_cjk(value: &str) -> bool {
    value.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

/// Whether the message explicitly names a skill (`$name` or a
/// word-boundary occurrence; CJK names match by substring).
fn is_explicit_mention(message_lower: &str, name_lower: &str) -> bool {
    if name_lower.is_empty() {
        return false;
    }
    if message_lower.contains(&format!("${name_lower}")) {
        return true;
    }
    if contains_cjk(name_lower) {
        return message_lower.contains(name_lower);
    }
    boundary_regex(name_lower)
        .map(|re| re.is_match(message_lower))
        .unwrap_or(false)
}

/// Trigger matching: CJK and multi-word/symbol-bearing triggers use
/// substring matching, single ASCII tokens use word boundaries.
fn message_matches_trigger(message_lower: &str, trigger_lower: &str) -> bool {
    if trigger_lower.is_empty() {
        return false;
    }
    if contains_cjk(trigger_lower) {
        return message_lower.contains(trigger_lower);
    }
    if trigger_lower.chars().any(char::is_whitespace)
        || trigger_lower.contains('-')
        || trigger_lower.contains('_')
    {
        return message_lower.contains(trigger_lower);
    }
    boundary_regex(trigger_lower)
        .map(|re| re.is_match(message_lower))
        .unwrap_or(false)
}

fn boundary_regex(token: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"(?:^|[^a-z0-9_]){}(?:$|[^a-z0-9_])",
        regex::escape(token)
    ))
    .ok()
}

/// Normalize a frontmatter list-like value into lowercase strings.
fn normalize_list(value: Option<&Value>) -> Vec<String> {
    raw_list(value)
        .into_iter()
        .map(|s| s.to_lowercase())
        .collect()
}

/// A list-like value as trimmed strings (scalar values become a
/// single-element list).
fn raw_list(value: Option<&Value>) -> Vec<String> {
    let mut out = Vec::new();
    match value {
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(s) = value_as_string(item) {
                    out.push(s);
                }
            }
        }
        Some(other) => {
            if let Some(s) = value_as_string(other) {
                out.push(s);
            }
        }
        None => {}
    }
    out
}

fn value_as_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    let trimmed = s.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn normalize_rule(raw: &Value) -> Option<CompletionRule> {
    let obj = raw.as_object()?;
    let name = obj.get("name")?.as_str()?.trim().to_lowercase();
    if name.is_empty() {
        return None;
    }
    let mut args = HashMap::new();
    if let Some(arg_obj) = obj.get("args").and_then(|v| v.as_object()) {
        for (key, matcher) in arg_obj {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let matcher = match matcher {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            args.insert(key.to_string(), matcher);
        }
    }
    Some(CompletionRule { name, args })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_skill(
        workspace: &Path,
        name: &str,
        description: &str,
        triggers: &[&str],
        extra_meta: Option<serde_json::Value>,
    ) {
        let skill_dir = workspace.join("skills").join(name);
        std::fs::create_dir_all(&skill_dir).unwrap();
        let mut meta = serde_json::json!({"triggers": triggers});
        if let Some(extra) = extra_meta {
            if let (Some(target), Some(source)) = (meta.as_object_mut(), extra.as_object()) {
                for (k, v) in source {
                    target.insert(k.clone(), v.clone());
                }
            }
        }
        let metadata = serde_json::json!({"tern": meta});
        let content = format!(
            "---\nname: {name}\ndescription: {description}\nmetadata: {metadata}\n---\n\n# {name}\n\nUse the {name} skill workflow.\n"
        );
        std::fs::write(skill_dir.join("SKILL.md"), content).unwrap();
    }

    fn loader(dir: &TempDir) -> SkillsLoader {
        SkillsLoader::new(dir.path(), None)
    }

    #[test]
    fn list_skills_empty_when_dir_missing() {
        let dir = TempDir::new().unwrap();
        assert!(loader(&dir).list_skills(true).is_empty());
    }

    #[test]
    fn workspace_shadows_builtin() {
        let dir = TempDir::new().unwrap();
        let builtin = TempDir::new().unwrap();

        write_skill(dir.path(), "weather", "workspace weather", &["weather"], None);
        // Builtin copy of the same skill plus a unique one.
        let builtin_ws = builtin.path();
        std::fs::create_dir_all(builtin_ws.join("weather")).unwrap();
        std::fs::write(
            builtin_ws.join("weather/SKILL.md"),
            "---\nname: weather\ndescription: builtin weather\n---\nbody\n",
        )
        .unwrap();
        std::fs::create_dir_all(builtin_ws.join("github")).unwrap();
        std::fs::write(
            builtin_ws.join("github/SKILL.md"),
            "---\nname: github\ndescription: github\n---\nbody\n",
        )
        .unwrap();

        let loader = SkillsLoader::new(dir.path(), Some(builtin_ws.to_path_buf()));
        let skills = loader.list_skills(false);
        assert_eq!(skills.len(), 2);
        let weather = skills.iter().find(|s| s.name == "weather").unwrap();
        assert_eq!(weather.source, "workspace");
        assert!(loader.load_skill("weather").unwrap().contains("workspace weather"));
    }

    #[test]
    fn select_matches_trigger_and_explicit_mention() {
        let dir = TempDir::new().unwrap();
        write_skill(
            dir.path(),
            "weather",
            "Get weather and forecast",
            &["weather", "forecast", "天气", "气温"],
            None,
        );
        let loader = loader(&dir);
        assert_eq!(
            loader.select_for_message("查一下杭州今天的天气", 2),
            vec!["weather"]
        );
        assert_eq!(
            loader.select_for_message("please use $weather for this request", 2),
            vec!["weather"]
        );
    }

    #[test]
    fn select_ignores_commands_and_empty() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "weather", "weather", &["weather"], None);
        let loader = loader(&dir);
        assert!(loader.select_for_message("/new weather", 2).is_empty());
        assert!(loader.select_for_message("   ", 2).is_empty());
    }

    #[test]
    fn select_requires_word_boundary_for_ascii_triggers() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "git", "git helper", &["git"], None);
        let loader = loader(&dir);
        // "digital" contains "git" but not on a word boundary.
        assert!(loader.select_for_message("digital nomad life", 2).is_empty());
        assert_eq!(loader.select_for_message("help with git rebase", 2), vec!["git"]);
    }

    #[test]
    fn select_orders_by_score_then_hits_then_name() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "alpha", "a", &["news", "report"], None);
        write_skill(dir.path(), "beta", "b", &["news"], None);
        let loader = loader(&dir);
        let picked = loader.select_for_message("news report please", 2);
        // alpha has two trigger hits (40), beta one (20).
        assert_eq!(picked, vec!["alpha", "beta"]);
    }

    #[test]
    fn allowed_tools_deduped_in_stable_order() {
        let dir = TempDir::new().unwrap();
        write_skill(
            dir.path(),
            "weather",
            "w",
            &["weather"],
            Some(serde_json::json!({"allowed_tools": ["exec", "web_fetch", "exec"]})),
        );
        write_skill(
            dir.path(),
            "github",
            "g",
            &["github"],
            Some(serde_json::json!({"allowed_tools": ["exec", "list_dir"]})),
        );
        let loader = loader(&dir);
        assert_eq!(
            loader.allowed_tools_for(&["weather".into(), "github".into()]),
            vec!["exec", "web_fetch", "list_dir"]
        );
    }

    #[test]
    fn tool_round_limited_uses_flags_and_tags() {
        let dir = TempDir::new().unwrap();
        write_skill(
            dir.path(),
            "weather",
            "w",
            &["weather"],
            Some(serde_json::json!({"tool_round_limit": true, "tags": ["realtime", "network"]})),
        );
        write_skill(
            dir.path(),
            "github",
            "g",
            &["github"],
            Some(serde_json::json!({"tags": ["code", "repo"]})),
        );
        let loader = loader(&dir);
        assert_eq!(
            loader.tool_round_limited(&["weather".into(), "github".into()]),
            vec!["weather"]
        );
    }

    #[test]
    fn always_skills_marked_in_metadata() {
        let dir = TempDir::new().unwrap();
        write_skill(
            dir.path(),
            "persona",
            "p",
            &[],
            Some(serde_json::json!({"always": true})),
        );
        write_skill(dir.path(), "weather", "w", &["weather"], None);
        let loader = loader(&dir);
        assert_eq!(loader.always_skills(), vec!["persona"]);
    }

    #[test]
    fn requirements_filter_unmet_env() {
        let dir = TempDir::new().unwrap();
        write_skill(
            dir.path(),
            "gated",
            "g",
            &["gated"],
            Some(serde_json::json!({"requires": {"env": ["TERN_TEST_SURELY_UNSET_ENV_VAR"]}})),
        );
        let loader = loader(&dir);
        assert!(loader.list_skills(true).is_empty());
        assert_eq!(loader.list_skills(false).len(), 1);
        let summary = loader.build_skills_summary();
        assert!(summary.contains("available=\"false\""));
        assert!(summary.contains("ENV: TERN_TEST_SURELY_UNSET_ENV_VAR"));
    }

    #[test]
    fn workflow_policy_merges_across_skills() {
        let dir = TempDir::new().unwrap();
        write_skill(
            dir.path(),
            "deep-learn",
            "d",
            &["research"],
            Some(serde_json::json!({
                "workflow": {
                    "kickoff": {
                        "require_substantive_action": true,
                        "substantive_tools": ["web_search", "write_file"],
                        "forbid_as_first_only": ["list_dir"]
                    },
                    "completion": {
                        "require_tool_calls": [
                            {"name": "write_file", "args": {"path_regex": "^memory/learnings/[^/]+\\.md$"}}
                        ]
                    },
                    "retry": {"enforcement_retries": 1, "failure_mode": "explain_missing"},
                    "progress": {"claim_requires_actions": true, "claim_patterns": ["完成"]}
                }
            })),
        );
        write_skill(
            dir.path(),
            "strict",
            "s",
            &["research"],
            Some(serde_json::json!({
                "workflow": {
                    "kickoff": {"substantive_tools": ["web_search", "spawn"]},
                    "retry": {"enforcement_retries": 3, "failure_mode": "hard_fail"}
                }
            })),
        );
        let loader = loader(&dir);
        let policy = loader
            .workflow_policy_for(&["deep-learn".into(), "strict".into()])
            .unwrap();
        assert!(policy.kickoff.require_substantive_action);
        assert_eq!(
            policy.kickoff.substantive_tools,
            vec!["web_search", "write_file", "spawn"]
        );
        assert_eq!(policy.retry.enforcement_retries, 3);
        assert_eq!(policy.retry.failure_mode, FailureMode::HardFail);
        assert_eq!(policy.completion.require_tool_calls.len(), 1);
    }

    #[test]
    fn workflow_policy_none_when_nothing_required() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "weather", "w", &["weather"], None);
        let loader = loader(&dir);
        assert!(loader.workflow_policy_for(&["weather".into()]).is_none());
    }

    #[test]
    fn nanobot_namespace_accepted_for_imported_packs() {
        let dir = TempDir::new().unwrap();
        let skill_dir = dir.path().join("skills/imported");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            "---\nname: imported\ndescription: imported pack\nmetadata: {\"nanobot\": {\"triggers\": [\"imported\"]}}\n---\nbody\n",
        )
        .unwrap();
        let loader = loader(&dir);
        assert_eq!(
            loader.select_for_message("use the imported workflow", 2),
            vec!["imported"]
        );
    }

    #[test]
    fn frontmatter_roundtrip_and_strip() {
        let content = "---\nname: x\ndescription: \"quoted\"\n---\n\n# Body\n";
        let fm = parse_frontmatter(content).unwrap();
        assert_eq!(fm["name"], "x");
        assert_eq!(fm["description"], "quoted");
        assert_eq!(strip_frontmatter(content), "# Body");
        assert_eq!(strip_frontmatter("no frontmatter"), "no frontmatter");
    }

    #[test]
    fn context_content_strips_frontmatter() {
        let dir = TempDir::new().unwrap();
        write_skill(dir.path(), "weather", "w", &["weather"], None);
        let loader = loader(&dir);
        let content = loader.load_skills_for_context(&["weather".into()]);
        assert!(content.contains("### Skill: weather"));
        assert!(!content.contains("metadata:"));
    }
}
