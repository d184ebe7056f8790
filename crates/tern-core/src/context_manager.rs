//! Per-turn context preparation: mode decision, rolling summarization,
//! shrink-to-budget, and skill routing.
//!
//! Three modes:
//! - **native**: provider keeps conversation state server-side; only the
//!   current user turn is sent, referenced by `previous_response_id`.
//! - **reset**: native-capable but starting fresh; full system prompt +
//!   recent history, server state cleared.
//! - **stateless**: provider without native sessions; full prompt every
//!   turn.
//!
//! Force-reset triggers: hard-limit context ratio, bootstrap fingerprint
//! change, a "length" finish reason, a summarization this turn, or an
//! explicit pending-reset flag.

use std::sync::Arc;

use chrono::Local;
use tracing::{debug, warn};

use tern_llm::provider::{ChatProvider, ChatRequest};
use tern_llm::types::ChatMessage;
use tern_types::config::ContextConfig;
use tern_types::session::Session;
use tern_types::Result;

use crate::context::ContextBuilder;

/// Everything the loop needs to call the provider for one turn.
pub struct ContextBundle {
    /// Provider-shaped messages.
    pub messages: Vec<ChatMessage>,
    /// Opaque session state for the provider (`None` when stateless).
    pub session_state: Option<serde_json::Value>,
    /// Turn statistics and routing results.
    pub stats: ContextStats,
}

/// Per-turn context statistics.
#[derive(Debug, Clone, Default)]
pub struct ContextStats {
    /// "native", "reset", or "stateless".
    pub mode: String,
    /// Estimated prompt tokens for the built messages.
    pub estimated_tokens: u64,
    /// `estimated_tokens / effective_window`.
    pub estimated_ratio: f64,
    /// Estimated tokens of summary + unsummarized history.
    pub conversation_tokens: u64,
    /// Ratio of the above against the effective window.
    pub conversation_ratio: f64,
    /// Whether a rolling summarization happened this turn.
    pub summarized: bool,
    /// Whether this turn performed a synchronized native reset.
    pub synced_reset: bool,
    /// Skills routed for this message, highest confidence first.
    pub matched_skills: Vec<String>,
}

/// Maximum skills routed per message.
const MAX_SKILLS_PER_MESSAGE: usize = 2;

/// Prepares conversation context, summaries, and native session state.
pub struct ContextManager {
    provider: Arc<dyn ChatProvider>,
    config: ContextConfig,
    builder: Arc<ContextBuilder>,
    default_model: String,
}

impl ContextManager {
    /// Create a manager bound to a provider and builder.
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        config: ContextConfig,
        builder: Arc<ContextBuilder>,
        default_model: String,
    ) -> Self {
        Self {
            provider,
            config,
            builder,
            default_model,
        }
    }

    /// The context configuration.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build the context for one turn, updating session metadata
    /// (summary state, fingerprint, reset bookkeeping) in place.
    pub async fn build_context(
        &self,
        session: &mut Session,
        current_message: &str,
        media: Option<&[String]>,
        channel: Option<&str>,
        chat_id: Option<&str>,
    ) -> Result<ContextBundle> {
        let mut ctx_meta = session.context_meta();
        let mut llm_meta = session.llm_meta();

        let mut summary: String = ctx_meta.summary.trim().to_string();
        let mut summary_index: usize = ctx_meta.summary_index.min(session.messages.len());

        let native_enabled = self.config.enable_native_session;
        let native_supported = self.provider.supports_native_session();
        let native_ready = native_enabled && native_supported;

        let (new_summary, new_index, summarized) = self
            .maybe_summarize(session, summary, summary_index)
            .await;
        summary = new_summary;
        summary_index = new_index;

        ctx_meta.summary = summary.clone();
        ctx_meta.summary_index = summary_index;
        if summarized {
            ctx_meta.summary_updated_at = Some(Local::now().to_rfc3339());
        }

        let mut pending_reset = llm_meta.pending_reset;
        if summarized && native_ready {
            pending_reset = true;
        }

        // Bootstrap changes invalidate the provider-side conversation.
        let fingerprint = self.builder.bootstrap_fingerprint()?;
        if native_ready {
            let needs_bootstrap_reset = match llm_meta.bootstrap_fingerprint.as_deref() {
                None => llm_meta.previous_response_id.is_some(),
                Some(stored) => stored != fingerprint,
            };
            if needs_bootstrap_reset {
                pending_reset = true;
                llm_meta.pending_reset = true;
            }
        }
        llm_meta.bootstrap_fingerprint = Some(fingerprint);

        let last_ratio = llm_meta.last_context_ratio.unwrap_or(0.0);
        let mut force_reset = pending_reset || last_ratio >= self.config.hard_limit_threshold;

        // The unsummarized conversation alone can exceed the budget.
        let remaining = &session.messages[summary_index..];
        let mut conversation_tokens = 0u64;
        if !summary.is_empty() {
            conversation_tokens += estimate_text_tokens("assistant", &summary);
        }
        for msg in remaining {
            conversation_tokens += estimate_value_tokens(msg);
        }
        let conversation_ratio = conversation_tokens as f64 / self.effective_window() as f64;
        if native_ready && !force_reset && conversation_ratio >= self.config.hard_limit_threshold {
            force_reset = true;
        }

        let matched_skills = self
            .builder
            .skills
            .select_for_message(current_message, MAX_SKILLS_PER_MESSAGE);

        let mode;
        let messages;
        let session_state;

        if native_ready && !force_reset && llm_meta.previous_response_id.is_some() {
            // Continue the server-side session; send only new user input.
            session_state = Some(serde_json::json!({
                "previous_response_id": llm_meta.previous_response_id,
            }));
            messages = self.builder.build_messages(
                &[],
                current_message,
                Some(&matched_skills),
                media,
                channel,
                chat_id,
                None,
                false,
            )?;
            mode = "native";
        } else {
            let recent = self.select_recent_messages(session, summary_index);
            let built = self.builder.build_messages(
                &recent,
                current_message,
                Some(&matched_skills),
                media,
                channel,
                chat_id,
                if summary.is_empty() { None } else { Some(&summary) },
                true,
            )?;
            messages = self.shrink_to_budget(
                built,
                &summary,
                recent,
                current_message,
                &matched_skills,
                media,
                channel,
                chat_id,
            )?;
            session_state = if native_ready {
                Some(serde_json::json!({}))
            } else {
                None
            };
            mode = if native_ready && force_reset {
                llm_meta.previous_response_id = None;
                llm_meta.pending_reset = false;
                llm_meta.last_reset_at = Some(Local::now().to_rfc3339());
                "reset"
            } else {
                "stateless"
            };
        }

        let estimated_tokens: u64 = messages.iter().map(estimate_message_tokens).sum();
        let estimated_ratio = estimated_tokens as f64 / self.effective_window() as f64;
        llm_meta.last_local_tokens = Some(estimated_tokens);
        llm_meta.last_local_ratio = Some(round4(estimated_ratio));

        session.set_context_meta(&ctx_meta);
        session.set_llm_meta(&llm_meta);

        let stats = ContextStats {
            mode: mode.to_string(),
            estimated_tokens,
            estimated_ratio: round4(estimated_ratio),
            conversation_tokens,
            conversation_ratio: round4(conversation_ratio),
            summarized,
            synced_reset: mode == "reset",
            matched_skills,
        };

        debug!(
            mode = %stats.mode,
            estimated_tokens,
            summarized,
            matched_skills = ?stats.matched_skills,
            "built turn context"
        );

        Ok(ContextBundle {
            messages,
            session_state,
            stats,
        })
    }

    /// Record provider response bookkeeping into session metadata.
    pub fn update_after_response(&self, session: &mut Session, response: &tern_llm::types::LLMResponse) {
        let mut llm_meta = session.llm_meta();

        if let Some(ref id) = response.response_id {
            llm_meta.previous_response_id = Some(id.clone());
        }
        if let Some(ref id) = response.conversation_id {
            llm_meta.conversation_id = Some(id.clone());
        }
        if let Some(ref model) = response.model {
            llm_meta.model = Some(model.clone());
        }
        if let Some(ref usage) = response.usage {
            llm_meta.last_usage = serde_json::to_value(usage).ok();
            if usage.prompt_tokens > 0 {
                let ratio = usage.prompt_tokens as f64 / self.effective_window() as f64;
                llm_meta.last_context_tokens = Some(usage.prompt_tokens);
                llm_meta.last_context_ratio = Some(round4(ratio));
                if ratio >= self.config.hard_limit_threshold {
                    llm_meta.pending_reset = true;
                }
            }
        }
        if response.finish_reason.to_lowercase().contains("length") {
            llm_meta.pending_reset = true;
        }

        session.set_llm_meta(&llm_meta);
    }

    // ── Internals ────────────────────────────────────────────────────

    fn effective_window(&self) -> u64 {
        let window = self.config.window_tokens.max(1);
        window.saturating_sub(self.config.reserve_tokens).max(1)
    }

    fn select_recent_messages(&self, session: &Session, summary_index: usize) -> Vec<serde_json::Value> {
        let total = session.messages.len();
        if total == 0 {
            return Vec::new();
        }
        let recent_target = self.config.recent_messages.max(1);
        let min_recent = self.config.min_recent_messages.max(1);

        let mut start = summary_index.max(total.saturating_sub(recent_target));
        if total - start < min_recent && total > total - start {
            start = total.saturating_sub(min_recent);
        }

        session.messages[start..]
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.get("role").cloned().unwrap_or_default(),
                    "content": m.get("content").cloned().unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Summarize the history prefix when the unsummarized portion has
    /// grown past the threshold. A failed summarizer call leaves the
    /// state unchanged and is not retried this turn.
    async fn maybe_summarize(
        &self,
        session: &Session,
        summary: String,
        summary_index: usize,
    ) -> (String, usize, bool) {
        let total = session.messages.len();
        if total == 0 {
            return (summary, summary_index, false);
        }
        let recent_target = self.config.recent_messages.max(1);
        let cutoff = summary_index.max(total.saturating_sub(recent_target));
        if cutoff <= summary_index {
            return (summary, summary_index, false);
        }

        let to_summarize = &session.messages[summary_index..cutoff];
        let mut local_tokens = 0u64;
        if !summary.is_empty() {
            local_tokens += estimate_text_tokens("assistant", &summary);
        }
        for msg in to_summarize {
            local_tokens += estimate_value_tokens(msg);
        }
        let ratio = local_tokens as f64 / self.effective_window() as f64;
        if ratio < self.config.summarize_threshold {
            return (summary, summary_index, false);
        }

        match self.summarize_messages(&summary, to_summarize).await {
            Some(new_summary) => (new_summary, cutoff, true),
            None => (summary, summary_index, false),
        }
    }

    async fn summarize_messages(
        &self,
        summary: &str,
        messages: &[serde_json::Value],
    ) -> Option<String> {
        if messages.is_empty() {
            return None;
        }
        let formatted = format_messages(messages);
        let existing = if summary.trim().is_empty() {
            "(none)".to_string()
        } else {
            summary.trim().to_string()
        };

        let system_prompt = "You are a conversation summarizer. Produce a concise rolling summary that preserves: \
            user goals, preferences, constraints, decisions, TODOs, and important facts/names. \
            Omit small talk and repetitions. Use the same language as the conversation.";
        let user_prompt = format!(
            "Existing summary (may be empty):\n{existing}\n\n\
            New conversation excerpt to fold in:\n{formatted}\n\n\
            Return ONLY the updated summary text."
        );

        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_prompt),
            ],
            tools: Vec::new(),
            tool_choice: None,
            model: self
                .config
                .summary_model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            max_tokens: self.config.summary_max_tokens,
            temperature: 0.2,
            session_state: None,
        };

        let response = self.provider.chat(request, None).await;
        if response.finish_reason == "error" {
            warn!(error = %response.content, "failed to summarize context");
            return None;
        }
        let text = response.content.trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Drop the oldest retained messages until the prompt fits the
    /// window, keeping at least `min_recent_messages`.
    #[allow(clippy::too_many_arguments)]
    fn shrink_to_budget(
        &self,
        mut messages: Vec<ChatMessage>,
        summary: &str,
        recent: Vec<serde_json::Value>,
        current_message: &str,
        matched_skills: &[String],
        media: Option<&[String]>,
        channel: Option<&str>,
        chat_id: Option<&str>,
    ) -> Result<Vec<ChatMessage>> {
        if recent.is_empty() {
            return Ok(messages);
        }
        let min_recent = self.config.min_recent_messages.max(1);
        let budget = self.effective_window();
        let mut working = recent;
        let mut estimated: u64 = messages.iter().map(estimate_message_tokens).sum();

        while working.len() > min_recent && estimated > budget {
            working.remove(0);
            messages = self.builder.build_messages(
                &working,
                current_message,
                Some(matched_skills),
                media,
                channel,
                chat_id,
                if summary.is_empty() { None } else { Some(summary) },
                true,
            )?;
            estimated = messages.iter().map(estimate_message_tokens).sum();
        }
        Ok(messages)
    }
}

// ── Token estimation ─────────────────────────────────────────────────────

fn round4(v: f64) -> f64 {
    (v * 10000.0).round() / 10000.0
}

/// Rough heuristic: 4 characters per token, role labels included.
fn estimate_text_tokens(role: &str, content: &str) -> u64 {
    (((role.len() + content.len()) / 4).max(1)) as u64
}

fn estimate_value_tokens(msg: &serde_json::Value) -> u64 {
    let role = msg.get("role").and_then(|v| v.as_str()).unwrap_or("");
    let content = msg.get("content").cloned().unwrap_or_default();
    let content_len = match content {
        serde_json::Value::String(s) => s.len(),
        other => serde_json::to_string(&other).map(|s| s.len()).unwrap_or(0),
    };
    (((role.len() + content_len) / 4).max(1)) as u64
}

/// Estimate tokens of a provider-shaped message.
pub fn estimate_message_tokens(msg: &ChatMessage) -> u64 {
    let content_len = match &msg.content {
        serde_json::Value::String(s) => s.len(),
        other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
    };
    (((msg.role.len() + content_len) / 4).max(1)) as u64
}

fn format_messages(messages: &[serde_json::Value]) -> String {
    let mut lines = Vec::new();
    for msg in messages {
        let role = msg
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let content = match msg.get("content") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => serde_json::to_string(other).unwrap_or_default(),
            None => String::new(),
        };
        let label = match role.as_str() {
            "user" => "User".to_string(),
            "assistant" => "Assistant".to_string(),
            "" => "Message".to_string(),
            other => other.to_string(),
        };
        lines.push(format!("{label}: {content}"));
    }
    lines.join("\n")
}
