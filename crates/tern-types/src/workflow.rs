//! Skill workflow policy types.
//!
//! A [`WorkflowPolicy`] is merged across the skills matched for a turn and
//! enforced by the agent loop: kickoff requirements, completion rules,
//! retry budget, and progress reporting (claim guard + milestones).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Merged workflow policy for the skills matched on one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowPolicy {
    /// Requirements on how the turn must start.
    #[serde(default)]
    pub kickoff: KickoffPolicy,

    /// Requirements that must hold before the turn may complete.
    #[serde(default)]
    pub completion: CompletionPolicy,

    /// Enforcement retry budget and failure handling.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Progress reporting rules.
    #[serde(default)]
    pub progress: ProgressPolicy,
}

impl WorkflowPolicy {
    /// Whether this policy imposes anything at all.
    ///
    /// An empty policy is treated as "no workflow" by the loop.
    pub fn has_requirements(&self) -> bool {
        self.kickoff.require_substantive_action
            || !self.completion.require_tool_calls.is_empty()
            || self.progress.claim_requires_actions
            || self.progress.milestones.enabled
    }
}

/// Kickoff rules: the turn must begin with real work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KickoffPolicy {
    /// Require at least one substantive tool call before completion.
    #[serde(default, alias = "requireSubstantiveAction")]
    pub require_substantive_action: bool,

    /// Tools that count as substantive work.
    #[serde(default, alias = "substantiveTools")]
    pub substantive_tools: Vec<String>,

    /// Tools that must not be the only calls made.
    #[serde(default, alias = "forbidAsFirstOnly")]
    pub forbid_as_first_only: Vec<String>,
}

/// Completion rules: specific tool calls that must have happened.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionPolicy {
    /// Each rule must be satisfied by at least one executed tool call.
    #[serde(default, alias = "requireToolCalls")]
    pub require_tool_calls: Vec<CompletionRule>,
}

/// One required tool call.
///
/// `args` maps an argument matcher key to a regex. A key with a `_regex`
/// suffix applies the regex to the tool argument named by the prefix
/// (`path_regex` matches the `path` argument); other keys match the
/// argument of the same name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionRule {
    /// Tool name (lowercased).
    pub name: String,

    /// Argument matchers.
    #[serde(default)]
    pub args: HashMap<String, String>,
}

impl CompletionRule {
    /// Render this rule for an enforcement or failure message,
    /// e.g. `write_file(path_regex=^memory/learnings/[^/]+\.md$)`.
    pub fn describe(&self) -> String {
        if self.args.is_empty() {
            return format!("{}()", self.name);
        }
        let mut parts: Vec<String> = self
            .args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        parts.sort();
        format!("{}({})", self.name, parts.join(", "))
    }

    /// Tool argument name a matcher key applies to.
    pub fn arg_name(key: &str) -> &str {
        key.strip_suffix("_regex").unwrap_or(key)
    }
}

/// How enforcement failures are retried and finally handled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Extra model calls allowed to satisfy the workflow.
    #[serde(default, alias = "enforcementRetries")]
    pub enforcement_retries: usize,

    /// What to do when retries are exhausted.
    #[serde(default, alias = "failureMode")]
    pub failure_mode: FailureMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enforcement_retries: 0,
            failure_mode: FailureMode::ExplainMissing,
        }
    }
}

/// Terminal behavior of an unsatisfied workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Rewrite the final content to list the unmet requirements.
    #[default]
    ExplainMissing,

    /// Fail the turn with an explicit error.
    HardFail,
}

/// Progress rules: claim guarding and milestone messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressPolicy {
    /// A completion claim in the final text requires substantive actions.
    #[serde(default, alias = "claimRequiresActions")]
    pub claim_requires_actions: bool,

    /// Substrings that count as completion claims.
    #[serde(default, alias = "claimPatterns")]
    pub claim_patterns: Vec<String>,

    /// Intermediate milestone messages.
    #[serde(default)]
    pub milestones: MilestoneConfig,
}

/// Milestone message configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MilestoneConfig {
    /// Emit milestone messages during the turn.
    #[serde(default)]
    pub enabled: bool,

    /// Emit a "researching" milestone every this many tool calls.
    #[serde(default, alias = "toolCallInterval")]
    pub tool_call_interval: usize,

    /// Maximum milestone messages per turn.
    #[serde(default, alias = "maxMessages")]
    pub max_messages: usize,

    /// Templates by phase: `kickoff`, `researching`, `completion_ready`.
    /// `{source_calls}` and `{last_tool}` placeholders are substituted.
    #[serde(default)]
    pub templates: HashMap<String, String>,
}
