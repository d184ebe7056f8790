//! Workflow-policy enforcement for one turn.
//!
//! Tracks the tool calls executed during a turn and evaluates the
//! merged skill policy against them: kickoff requirements, completion
//! rules, and the claim guard. Milestone bookkeeping (cap, phase flags,
//! template rendering) also lives here; the loop owns the actual bus
//! and session writes.

use regex::Regex;
use tracing::warn;

use tern_types::workflow::{CompletionRule, WorkflowPolicy};

/// A tool call executed during the turn.
#[derive(Debug, Clone)]
pub struct ExecutedCall {
    /// Tool name.
    pub name: String,
    /// Parsed arguments.
    pub args: serde_json::Value,
}

/// Milestone phases with templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilestonePhase {
    /// First tool round of the turn.
    Kickoff,
    /// Every `tool_call_interval` executed calls.
    Researching,
    /// Completion rules just became satisfied.
    CompletionReady,
}

impl MilestonePhase {
    fn template_key(self) -> &'static str {
        match self {
            MilestonePhase::Kickoff => "kickoff",
            MilestonePhase::Researching => "researching",
            MilestonePhase::CompletionReady => "completion_ready",
        }
    }
}

/// Turn-scoped workflow enforcement state.
pub struct WorkflowState {
    policy: Option<WorkflowPolicy>,
    executed: Vec<ExecutedCall>,
    retries_used: usize,
    kickoff_correction_sent: bool,
    milestones_emitted: usize,
    kickoff_milestone_sent: bool,
    completion_milestone_sent: bool,
}

impl WorkflowState {
    /// Create state for a turn; `policy` is `None` when no matched
    /// skill imposes a workflow.
    pub fn new(policy: Option<WorkflowPolicy>) -> Self {
        Self {
            policy,
            executed: Vec::new(),
            retries_used: 0,
            kickoff_correction_sent: false,
            milestones_emitted: 0,
            kickoff_milestone_sent: false,
            completion_milestone_sent: false,
        }
    }

    /// Whether any policy is in force.
    pub fn active(&self) -> bool {
        self.policy.is_some()
    }

    /// The policy, when active.
    pub fn policy(&self) -> Option<&WorkflowPolicy> {
        self.policy.as_ref()
    }

    /// Record an executed tool call.
    pub fn record(&mut self, name: &str, args: &serde_json::Value) {
        self.executed.push(ExecutedCall {
            name: name.to_string(),
            args: args.clone(),
        });
    }

    /// Executed calls so far.
    pub fn executed(&self) -> &[ExecutedCall] {
        &self.executed
    }

    /// Number of executed calls.
    pub fn executed_count(&self) -> usize {
        self.executed.len()
    }

    /// Whether any substantive tool has run.
    pub fn has_substantive_call(&self) -> bool {
        let Some(policy) = &self.policy else {
            return !self.executed.is_empty();
        };
        if policy.kickoff.substantive_tools.is_empty() {
            return !self.executed.is_empty();
        }
        self.executed.iter().any(|call| {
            policy
                .kickoff
                .substantive_tools
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&call.name))
        })
    }

    /// Mid-turn kickoff check: fires once when the only calls so far
    /// are in `forbid_as_first_only`. Returns the correction message.
    pub fn kickoff_correction(&mut self) -> Option<String> {
        let policy = self.policy.as_ref()?;
        if !policy.kickoff.require_substantive_action
            || self.kickoff_correction_sent
            || self.executed.is_empty()
            || self.has_substantive_call()
        {
            return None;
        }
        let all_forbidden = self.executed.iter().all(|call| {
            policy
                .kickoff
                .forbid_as_first_only
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&call.name))
        });
        if !all_forbidden {
            return None;
        }
        self.kickoff_correction_sent = true;
        Some(format!(
            "Workflow kickoff correction: do not start with only {}. Begin substantive work with one of: {}.",
            policy.kickoff.forbid_as_first_only.join(", "),
            policy.kickoff.substantive_tools.join(", "),
        ))
    }

    /// Final-check violations for a candidate final `content`.
    pub fn violations(&self, content: &str) -> Vec<String> {
        let Some(policy) = &self.policy else {
            return Vec::new();
        };
        let mut violations = Vec::new();

        if policy.kickoff.require_substantive_action && !self.has_substantive_call() {
            violations.push(format!(
                "no substantive tool call was made (expected one of: {})",
                policy.kickoff.substantive_tools.join(", ")
            ));
        }

        for rule in &policy.completion.require_tool_calls {
            if !rule_satisfied(rule, &self.executed) {
                violations.push(format!(
                    "required tool call not satisfied: {}",
                    rule.describe()
                ));
            }
        }

        if policy.progress.claim_requires_actions && !self.has_substantive_call() {
            let claimed = policy
                .progress
                .claim_patterns
                .iter()
                .any(|p| !p.is_empty() && content.contains(p.as_str()));
            if claimed {
                violations.push("completion claim made without substantive actions".to_string());
            }
        }

        violations
    }

    /// Whether all completion rules are currently satisfied.
    pub fn completion_satisfied(&self) -> bool {
        let Some(policy) = &self.policy else {
            return true;
        };
        policy
            .completion
            .require_tool_calls
            .iter()
            .all(|rule| rule_satisfied(rule, &self.executed))
    }

    /// Consume one enforcement retry; `false` when exhausted.
    pub fn try_retry(&mut self) -> bool {
        let budget = self
            .policy
            .as_ref()
            .map(|p| p.retry.enforcement_retries)
            .unwrap_or(0);
        if self.retries_used < budget {
            self.retries_used += 1;
            true
        } else {
            false
        }
    }

    /// Final content for exhausted `explain_missing` enforcement.
    pub fn explain_missing(&self, violations: &[String]) -> String {
        let mut lines = vec!["Workflow requirements not yet satisfied.".to_string()];
        for violation in violations {
            lines.push(format!("- {violation}"));
        }
        lines.join("\n")
    }

    // ── Milestones ───────────────────────────────────────────────────

    fn milestones_enabled(&self) -> bool {
        self.policy
            .as_ref()
            .map(|p| p.progress.milestones.enabled)
            .unwrap_or(false)
    }

    fn milestone_budget_left(&self) -> bool {
        let cap = self
            .policy
            .as_ref()
            .map(|p| p.progress.milestones.max_messages)
            .unwrap_or(0);
        cap == 0 || self.milestones_emitted < cap
    }

    fn render(&mut self, phase: MilestonePhase, last_tool: &str) -> Option<String> {
        if !self.milestones_enabled() || !self.milestone_budget_left() {
            return None;
        }
        let policy = self.policy.as_ref()?;
        let template = policy
            .progress
            .milestones
            .templates
            .get(phase.template_key())?;
        let text = template
            .replace("{source_calls}", &self.executed.len().to_string())
            .replace("{last_tool}", last_tool);
        self.milestones_emitted += 1;
        Some(text)
    }

    /// Kickoff milestone at the first tool round (at most once).
    pub fn kickoff_milestone(&mut self) -> Option<String> {
        if self.kickoff_milestone_sent {
            return None;
        }
        let text = self.render(MilestonePhase::Kickoff, "")?;
        self.kickoff_milestone_sent = true;
        Some(text)
    }

    /// Researching milestone every `tool_call_interval` executed calls.
    pub fn researching_milestone(&mut self, last_tool: &str) -> Option<String> {
        let interval = self
            .policy
            .as_ref()
            .map(|p| p.progress.milestones.tool_call_interval)
            .unwrap_or(0);
        if interval == 0 || self.executed.len() % interval != 0 {
            return None;
        }
        self.render(MilestonePhase::Researching, last_tool)
    }

    /// Completion-ready milestone once completion rules hold.
    pub fn completion_milestone(&mut self, last_tool: &str) -> Option<String> {
        if self.completion_milestone_sent || !self.completion_satisfied() {
            return None;
        }
        let has_rules = self
            .policy
            .as_ref()
            .map(|p| !p.completion.require_tool_calls.is_empty())
            .unwrap_or(false);
        if !has_rules {
            return None;
        }
        let text = self.render(MilestonePhase::CompletionReady, last_tool)?;
        self.completion_milestone_sent = true;
        Some(text)
    }
}

/// Whether one executed call satisfies a completion rule.
fn rule_satisfied(rule: &CompletionRule, executed: &[ExecutedCall]) -> bool {
    executed.iter().any(|call| {
        if !call.name.eq_ignore_ascii_case(&rule.name) {
            return false;
        }
        rule.args.iter().all(|(key, pattern)| {
            let arg_name = CompletionRule::arg_name(key);
            let Some(value) = call.args.get(arg_name) else {
                return false;
            };
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match Regex::new(pattern) {
                Ok(re) => re.is_match(&text),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "invalid completion-rule regex");
                    false
                }
            }
        })
    })
}
