//! The agent loop: per-message fixed-point processing.
//!
//! ```text
//! InboundMessage (bus)
//!   |
//!   v
//! /new interception -> session rollover + greeting
//!   |
//!   v
//! Session lookup (active pointer / pinned key)
//!   |
//!   v
//! ContextManager.build_context (mode, summary, skill routing)
//!   |
//!   v
//! Tool-call fixed point (bounded):
//!   - realtime tool forcing + one retry
//!   - native probe fallback on first provider error
//!   - streaming flush (chars + interval thresholds)
//!   - duplicate-call dedup, tool-round / stagnation limits
//!   - workflow enforcement (kickoff, milestones, claims, completion)
//!   |
//!   v
//! Attachment reconciliation -> persist session -> OutboundMessage (bus)
//! ```
//!
//! The loop is strictly single-concurrent: one in-flight turn per
//! process. Nothing inside it raises past [`AgentLoop::run`]; failures
//! become a single apology message on the originating channel.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tern_llm::provider::{ChatProvider, ChatRequest};
use tern_llm::types::{ChatMessage, LLMResponse, ToolChoice};
use tern_types::config::ContextConfig;
use tern_types::event::{InboundMessage, OutboundMessage, SESSION_KEY_META};
use tern_types::workflow::FailureMode;
use tern_types::{Result, Session};

use crate::bus::MessageBus;
use crate::context::ContextBuilder;
use crate::context_manager::ContextManager;
use crate::cron::CronService;
use crate::memory::MemoryStore;
use crate::session::SessionStore;
use crate::skills::SkillsLoader;
use crate::tools::cron_tool::CronTool;
use crate::tools::message::MessageTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::spawn::{SpawnTool, SubagentManager};

use super::attachments;
use super::realtime::{is_realtime_query, narrow_to_web_tools};
use super::stream::StreamState;
use super::workflow::WorkflowState;

/// Reply to the `/new` command.
const NEW_SESSION_GREETING: &str = "✅ 已开启新会话（历史已保留）。你好！我能帮你做什么？";

/// Fallback when the loop ends without content.
const EMPTY_RESPONSE_FALLBACK: &str = "I've completed processing but have no response to give.";

/// Construction options for [`AgentLoop`].
#[derive(Debug, Clone)]
pub struct AgentLoopOptions {
    /// Model override; defaults to the provider's default model.
    pub model: Option<String>,
    /// Maximum tool-loop iterations per turn.
    pub max_iterations: usize,
    /// Maximum tokens per response.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Stream deltas to channels that support it.
    pub stream: bool,
    /// Minimum buffered characters before a streaming flush.
    pub stream_min_chars: usize,
    /// Minimum seconds between streaming flushes.
    pub stream_min_interval_s: f64,
    /// Context budget / summarization configuration.
    pub context: ContextConfig,
    /// Sessions directory override (default `~/.tern/sessions`).
    pub sessions_dir: Option<PathBuf>,
    /// Builtin skills directory.
    pub builtin_skills_dir: Option<PathBuf>,
}

impl Default for AgentLoopOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_iterations: 20,
            max_tokens: 8192,
            temperature: 0.7,
            stream: false,
            stream_min_chars: 120,
            stream_min_interval_s: 0.5,
            context: ContextConfig::default(),
            sessions_dir: None,
            builtin_skills_dir: None,
        }
    }
}

fn default_sessions_dir() -> PathBuf {
    let Some(home) = dirs::home_dir() else {
        return PathBuf::from(".tern-sessions");
    };
    let tern = home.join(".tern").join("sessions");
    let nanobot = home.join(".nanobot").join("sessions");
    if !tern.exists() && nanobot.exists() {
        return nanobot;
    }
    tern
}

/// The core agent loop.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn ChatProvider>,
    workspace: PathBuf,
    model: String,
    options: AgentLoopOptions,
    builder: Arc<ContextBuilder>,
    manager: ContextManager,
    sessions: SessionStore,
    tools: ToolRegistry,
    message_tool: Arc<MessageTool>,
    spawn_tool: Arc<SpawnTool>,
    cron_tool: Option<Arc<CronTool>>,
}

impl AgentLoop {
    /// Create a loop with all dependencies wired.
    ///
    /// `leaf_tools` should hold the filesystem/shell/web tools; the
    /// message, spawn, and cron tools are created and registered here
    /// because they need the bus and managers. `subagent_tools` is the
    /// registry background subagents execute against.
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn ChatProvider>,
        workspace: PathBuf,
        options: AgentLoopOptions,
        leaf_tools: ToolRegistry,
        subagent_tools: Arc<ToolRegistry>,
        cron_service: Option<Arc<CronService>>,
    ) -> Result<Self> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());

        let memory = Arc::new(MemoryStore::new(&workspace));
        let skills = Arc::new(SkillsLoader::new(
            &workspace,
            options.builtin_skills_dir.clone(),
        ));
        let builder = Arc::new(ContextBuilder::new(workspace.clone(), memory, skills));
        let manager = ContextManager::new(
            provider.clone(),
            options.context.clone(),
            builder.clone(),
            model.clone(),
        );
        let sessions = SessionStore::new(
            options
                .sessions_dir
                .clone()
                .unwrap_or_else(default_sessions_dir),
        )?;

        let mut tools = leaf_tools;
        let message_tool = Arc::new(MessageTool::new(bus.clone()));
        tools.register(message_tool.clone());

        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            bus.clone(),
            subagent_tools,
            model.clone(),
        ));
        let spawn_tool = Arc::new(SpawnTool::new(subagents));
        tools.register(spawn_tool.clone());

        let cron_tool = cron_service.map(|service| {
            let tool = Arc::new(CronTool::new(service));
            tools.register(tool.clone());
            tool
        });

        Ok(Self {
            bus,
            provider,
            workspace,
            model,
            options,
            builder,
            manager,
            sessions,
            tools,
            message_tool,
            spawn_tool,
            cron_tool,
        })
    }

    /// The message bus.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// The session store.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The context builder (workspace, memory, skills).
    pub fn context_builder(&self) -> &Arc<ContextBuilder> {
        &self.builder
    }

    /// Mutable access to the tool registry (startup wiring and tests;
    /// the registry is read-only once the loop runs).
    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    /// Run the loop until cancelled. Errors on individual messages are
    /// turned into apology replies, never propagated.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("agent loop started, waiting for messages");
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("agent loop cancelled, exiting");
                    break;
                }
                msg = self.bus.consume_inbound() => msg,
            };
            let Some(msg) = msg else {
                info!("inbound queue closed, agent loop exiting");
                break;
            };

            let channel = msg.channel.clone();
            let chat_id = msg.chat_id.clone();
            match self.process_message(msg).await {
                Ok(Some(outbound)) => {
                    if let Err(e) = self.bus.publish_outbound_async(outbound).await {
                        error!(error = %e, "failed to publish response");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "failed to process message");
                    let apology = OutboundMessage::new(
                        &channel,
                        &chat_id,
                        format!("Sorry, I encountered an error: {e}"),
                    );
                    let _ = self.bus.publish_outbound_async(apology).await;
                }
            }
        }
    }

    /// Process a message directly (CLI / cron entry point).
    pub async fn process_direct(&self, content: &str, channel: &str, chat_id: &str) -> Result<String> {
        let msg = InboundMessage::new(channel, "user", chat_id, content);
        let outbound = self.process_message(msg).await?;
        Ok(outbound.map(|o| o.content).unwrap_or_default())
    }

    /// Process one inbound message.
    ///
    /// Returns `None` when the reply already reached the user by
    /// another path (streaming final chunk, message-tool delivery).
    pub async fn process_message(&self, msg: InboundMessage) -> Result<Option<OutboundMessage>> {
        let mut msg = msg;

        // Sub-agent completion announces arrive on the "system" channel
        // with the origin encoded in chat_id; process under that session.
        let mut system_sender: Option<String> = None;
        if msg.channel == "system" {
            let (origin_channel, origin_chat) = match msg.chat_id.split_once(':') {
                Some((c, id)) => (c.to_string(), id.to_string()),
                None => ("cli".to_string(), msg.chat_id.clone()),
            };
            info!(sender = %msg.sender_id, origin = %msg.chat_id, "processing system message");
            system_sender = Some(msg.sender_id.clone());
            msg.channel = origin_channel;
            msg.chat_id = origin_chat;
            msg.metadata.remove(SESSION_KEY_META);
        }

        if system_sender.is_none() && is_new_session_command(&msg.content) {
            return self.handle_new_session(&msg).await.map(Some);
        }

        let trace_id = msg
            .trace_id()
            .map(String::from)
            .unwrap_or_else(|| format!("{}-{}", msg.channel, chrono::Utc::now().timestamp_millis()));

        let preview: String = msg.content.chars().take(80).collect();
        info!(
            trace = %trace_id,
            channel = %msg.channel,
            sender = %msg.sender_id,
            preview = %preview,
            "processing message"
        );

        let t_start = Instant::now();
        let mut session = self.sessions.get_or_create(&msg.session_key());

        // Point the conversation-bound tools at this turn.
        self.message_tool.set_context(&msg.channel, &msg.chat_id);
        self.spawn_tool.set_context(&msg.channel, &msg.chat_id);
        if let Some(cron_tool) = &self.cron_tool {
            cron_tool.set_context(&msg.channel, &msg.chat_id);
        }

        let media: Option<&[String]> = if msg.media.is_empty() {
            None
        } else {
            Some(&msg.media)
        };

        let t_ctx = Instant::now();
        let bundle = self
            .manager
            .build_context(
                &mut session,
                &msg.content,
                media,
                Some(&msg.channel),
                Some(&msg.chat_id),
            )
            .await?;
        let ctx_time = t_ctx.elapsed();

        let mut messages = bundle.messages;
        let mut session_state = bundle.session_state;
        let mut stats = bundle.stats;
        let mut native_mode = stats.mode == "native";

        // Turn-scoped enforcement state.
        let realtime = system_sender.is_none() && is_realtime_query(&msg.content);
        let mut realtime_forcing = realtime;
        let mut realtime_retry_used = false;
        let mut realtime_unverified = false;

        let mut workflow = WorkflowState::new(
            self.builder
                .skills
                .workflow_policy_for(&stats.matched_skills),
        );

        let limited = self
            .builder
            .skills
            .tool_round_limited(&stats.matched_skills);
        let round_limit = if limited.is_empty() {
            0
        } else {
            self.options.context.skill_tool_round_limit
        };
        let stagnation_limit = if limited.is_empty() {
            0
        } else {
            self.options.context.skill_tool_stagnation_limit
        };

        let mut llm_total = Duration::ZERO;
        let mut tool_total = Duration::ZERO;
        let mut result_cache: HashMap<String, String> = HashMap::new();
        let mut seen_signatures: HashSet<String> = HashSet::new();
        let mut tool_rounds = 0usize;
        let mut stagnant_rounds = 0usize;

        let mut final_content: Option<String> = None;
        let mut final_streamed = false;
        let mut last_response: Option<LLMResponse> = None;
        let mut pending_response: Option<LLMResponse> = None;

        // Native probe: the first call in native mode is non-streamed so
        // a stale previous_response_id can be recovered by rebuilding
        // the context as a reset.
        if native_mode {
            let request =
                self.make_request(&messages, self.tools.definitions(), None, &session_state);
            let t_llm = Instant::now();
            let probe = self.provider.chat(request, None).await;
            llm_total += t_llm.elapsed();

            if probe.finish_reason == "error" {
                warn!(
                    trace = %trace_id,
                    error = %probe.content.chars().take(200).collect::<String>(),
                    "native session failed, resetting"
                );
                let mut llm_meta = session.llm_meta();
                llm_meta.previous_response_id = None;
                llm_meta.pending_reset = false;
                session.set_llm_meta(&llm_meta);

                let rebuilt = self
                    .manager
                    .build_context(
                        &mut session,
                        &msg.content,
                        media,
                        Some(&msg.channel),
                        Some(&msg.chat_id),
                    )
                    .await?;
                messages = rebuilt.messages;
                session_state = rebuilt.session_state;
                native_mode = rebuilt.stats.mode == "native";
                stats = rebuilt.stats;
            } else {
                pending_response = Some(probe);
            }
        }

        let use_stream = self.should_stream(&msg.channel);
        let mut iteration = 0usize;

        while iteration < self.options.max_iterations {
            iteration += 1;

            let (response, streamed_any) = match pending_response.take() {
                Some(probe) => (probe, false),
                None => {
                    let (tools_for_call, tool_choice) = if realtime_forcing {
                        (
                            narrow_to_web_tools(self.tools.definitions()),
                            Some(ToolChoice::Required),
                        )
                    } else {
                        (self.tools.definitions(), None)
                    };
                    let request =
                        self.make_request(&messages, tools_for_call, tool_choice, &session_state);
                    let t_llm = Instant::now();
                    let result = self.call_provider(request, use_stream, &msg).await;
                    llm_total += t_llm.elapsed();
                    result
                }
            };
            last_response = Some(response.clone());

            if response.has_tool_calls() {
                // The verification requirement is met by any tool round.
                realtime_forcing = false;

                if native_mode {
                    messages.clear();
                    if let Some(id) = &response.response_id {
                        if id.starts_with("resp_") {
                            session_state =
                                Some(serde_json::json!({ "previous_response_id": id }));
                        }
                    }
                } else {
                    let tool_call_values: Vec<serde_json::Value> = response
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": serde_json::to_string(&tc.arguments)
                                        .unwrap_or_default(),
                                }
                            })
                        })
                        .collect();
                    self.builder.add_assistant_message(
                        &mut messages,
                        &response.content,
                        Some(tool_call_values),
                    );
                }

                if tool_rounds == 0 {
                    if let Some(text) = workflow.kickoff_milestone() {
                        self.emit_milestone(&mut session, &msg, &text).await;
                    }
                }

                let signatures_before = seen_signatures.len();
                for tc in &response.tool_calls {
                    let args_preview = serde_json::to_string(&tc.arguments).unwrap_or_default();
                    info!(
                        trace = %trace_id,
                        tool = %tc.name,
                        args = %args_preview.chars().take(200).collect::<String>(),
                        "tool call"
                    );

                    let signature = tc.signature();
                    let result = if let Some(prior) = result_cache.get(&signature) {
                        debug!(trace = %trace_id, tool = %tc.name, "duplicate tool call, reusing prior result");
                        prior.clone()
                    } else {
                        let t_tool = Instant::now();
                        let result = self.tools.execute(&tc.name, tc.arguments.clone()).await;
                        tool_total += t_tool.elapsed();
                        workflow.record(&tc.name, &tc.arguments);
                        seen_signatures.insert(signature.clone());
                        result_cache.insert(signature, result.clone());

                        if let Some(text) = workflow.researching_milestone(&tc.name) {
                            self.emit_milestone(&mut session, &msg, &text).await;
                        }
                        if let Some(text) = workflow.completion_milestone(&tc.name) {
                            self.emit_milestone(&mut session, &msg, &text).await;
                        }
                        result
                    };
                    self.builder
                        .add_tool_result(&mut messages, &tc.id, &tc.name, &result);
                }

                tool_rounds += 1;
                if seen_signatures.len() == signatures_before {
                    stagnant_rounds += 1;
                } else {
                    stagnant_rounds = 0;
                }

                if let Some(correction) = workflow.kickoff_correction() {
                    messages.push(ChatMessage::system(correction));
                }

                let round_limit_hit = round_limit > 0 && tool_rounds >= round_limit;
                let stagnation_hit = stagnation_limit > 0 && stagnant_rounds >= stagnation_limit;
                if round_limit_hit || stagnation_hit {
                    debug!(
                        trace = %trace_id,
                        tool_rounds,
                        stagnant_rounds,
                        "tool-round limit reached, forcing textual summary"
                    );
                    let request = self.make_request(
                        &messages,
                        Vec::new(),
                        Some(ToolChoice::None),
                        &session_state,
                    );
                    let t_llm = Instant::now();
                    let (summary_response, streamed) =
                        self.call_provider(request, use_stream, &msg).await;
                    llm_total += t_llm.elapsed();
                    last_response = Some(summary_response.clone());
                    final_content = Some(summary_response.content);
                    final_streamed = streamed;
                    break;
                }
            } else {
                // Text response.
                if realtime_forcing && workflow.executed_count() == 0 && !realtime_retry_used {
                    realtime_retry_used = true;
                    messages.push(ChatMessage::system(
                        "Realtime verification retry: you must call a web tool before answering",
                    ));
                    continue;
                }
                if realtime_forcing {
                    realtime_unverified = true;
                    realtime_forcing = false;
                }

                let violations = workflow.violations(&response.content);
                if !violations.is_empty() {
                    if workflow.try_retry() {
                        messages.push(ChatMessage::system(format!(
                            "Workflow enforcement retry: required tool calls not satisfied: {}",
                            violations.join("; ")
                        )));
                        continue;
                    }
                    let failure_mode = workflow
                        .policy()
                        .map(|p| p.retry.failure_mode)
                        .unwrap_or(FailureMode::ExplainMissing);
                    final_content = Some(match failure_mode {
                        FailureMode::ExplainMissing => workflow.explain_missing(&violations),
                        FailureMode::HardFail => format!(
                            "Workflow enforcement failed; unmet requirements:\n{}",
                            violations
                                .iter()
                                .map(|v| format!("- {v}"))
                                .collect::<Vec<_>>()
                                .join("\n")
                        ),
                    });
                    final_streamed = false;
                    break;
                }

                final_content = Some(response.content.clone());
                final_streamed = streamed_any;
                break;
            }
        }

        let mut final_content = final_content.unwrap_or_else(|| EMPTY_RESPONSE_FALLBACK.into());

        if let Some(response) = &last_response {
            self.manager.update_after_response(&mut session, response);
        }

        // Attachment reconciliation.
        let sent_messages = self.message_tool.drain_sent_messages();
        let delivered_media = sent_messages.iter().any(|s| !s.media.is_empty());
        let mut final_media: Vec<String> = Vec::new();
        let mut suppress_final = false;
        if attachments::claims_delivery(&final_content) {
            if delivered_media {
                // The file already went out via the message tool; a
                // second text-only ack would just duplicate it.
                debug!(trace = %trace_id, "suppressing redundant delivery ack");
                suppress_final = true;
            } else if let Some(path) =
                attachments::resolve_any_claimed_file(&self.workspace, &final_content)
            {
                final_media.push(path.display().to_string());
            } else {
                final_content = attachments::rewrite_failed_claim(&final_content);
            }
        }

        // Persist: user turn, message-tool sends, then the final reply.
        let user_record = match &system_sender {
            Some(sender) => format!("[System: {sender}] {}", msg.content),
            None => msg.content.clone(),
        };
        session.add_message("user", &user_record, None);
        for sent in &sent_messages {
            let extras = (!sent.media.is_empty()).then(|| {
                HashMap::from([("media".to_string(), serde_json::json!(sent.media))])
            });
            session.add_message("assistant", &sent.content, extras);
        }
        if !suppress_final {
            let extras = (!final_media.is_empty()).then(|| {
                HashMap::from([("media".to_string(), serde_json::json!(final_media))])
            });
            session.add_message("assistant", &final_content, extras);
        }
        self.sessions.save(&session)?;

        let total_time = t_start.elapsed();
        debug!(
            trace = %trace_id,
            context_s = ctx_time.as_secs_f64(),
            llm_s = llm_total.as_secs_f64(),
            tools_s = tool_total.as_secs_f64(),
            total_s = total_time.as_secs_f64(),
            "turn timings"
        );

        if final_streamed || suppress_final {
            return Ok(None);
        }

        let mut out_metadata = msg.metadata.clone();
        out_metadata
            .entry("trace_id".into())
            .or_insert_with(|| serde_json::json!(trace_id));
        out_metadata.insert(
            "_agent_total_s".into(),
            serde_json::json!(round3(total_time.as_secs_f64())),
        );
        out_metadata.insert(
            "_agent_llm_s".into(),
            serde_json::json!(round3(llm_total.as_secs_f64())),
        );
        out_metadata.insert(
            "_agent_tools_s".into(),
            serde_json::json!(round3(tool_total.as_secs_f64())),
        );
        out_metadata.insert("_context_mode".into(), serde_json::json!(stats.mode));
        if stats.synced_reset {
            out_metadata.insert("_context_synced_reset".into(), serde_json::json!(true));
        }

        let usage_tokens = last_response
            .as_ref()
            .and_then(|r| r.usage.as_ref())
            .map(|u| u.prompt_tokens)
            .filter(|t| *t > 0);
        match usage_tokens {
            Some(tokens) => {
                let window = self.options.context.window_tokens.max(1);
                let effective = window
                    .saturating_sub(self.options.context.reserve_tokens)
                    .max(1);
                out_metadata.insert("_context_est_tokens".into(), serde_json::json!(tokens));
                out_metadata.insert(
                    "_context_est_ratio".into(),
                    serde_json::json!(round4(tokens as f64 / effective as f64)),
                );
                out_metadata.insert("_context_source".into(), serde_json::json!("usage"));
            }
            None => {
                out_metadata.insert(
                    "_context_est_tokens".into(),
                    serde_json::json!(stats.estimated_tokens),
                );
                out_metadata.insert(
                    "_context_est_ratio".into(),
                    serde_json::json!(stats.estimated_ratio),
                );
                out_metadata.insert("_context_source".into(), serde_json::json!("estimate"));
            }
        }
        if stats.summarized {
            out_metadata.insert("_context_summarized".into(), serde_json::json!(true));
        }
        if realtime_unverified {
            out_metadata.insert("_realtime_unverified".into(), serde_json::json!(true));
        }

        Ok(Some(OutboundMessage {
            channel: msg.channel,
            chat_id: msg.chat_id,
            content: final_content,
            reply_to: None,
            media: final_media,
            metadata: out_metadata,
        }))
    }

    /// Consolidate a session's conversation into long-term memory.
    ///
    /// The LLM produces a `{history_entry, memory_update}` artifact that
    /// rewrites MEMORY.md and appends to HISTORY.md (both sanitized).
    /// Failures are logged and swallowed; consolidation is best-effort.
    pub async fn consolidate_memory(&self, session: &Session, archive_all: bool) -> Result<()> {
        let start = if archive_all {
            0
        } else {
            session.context_meta().summary_index.min(session.messages.len())
        };
        let messages = &session.messages[start..];
        if messages.is_empty() {
            return Ok(());
        }

        let mut transcript = Vec::new();
        for m in messages {
            let role = m.get("role").and_then(|v| v.as_str()).unwrap_or("user");
            let content = m.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let timestamp = m.get("timestamp").and_then(|v| v.as_str()).unwrap_or("");
            transcript.push(format!("[{timestamp}] {role}: {content}"));
        }

        let system_prompt = "You maintain the agent's long-term memory. Given the current memory \
            document and a conversation transcript, return a JSON object with exactly two string \
            fields: \"history_entry\" (a dated one-paragraph event-log entry for this \
            conversation) and \"memory_update\" (the full updated long-term memory document). \
            Return ONLY the JSON object.";
        let user_prompt = format!(
            "Current long-term memory:\n{}\n\nConversation transcript:\n{}",
            self.builder.memory.read_long_term(),
            transcript.join("\n"),
        );

        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(user_prompt),
            ],
            tools: Vec::new(),
            tool_choice: None,
            model: self.model.clone(),
            max_tokens: self.options.max_tokens,
            temperature: 0.3,
            session_state: None,
        };
        let response = self.provider.chat(request, None).await;
        if response.finish_reason == "error" {
            warn!(error = %response.content, "memory consolidation call failed");
            return Ok(());
        }

        let Some(artifact) = parse_json_artifact(&response.content) else {
            warn!("memory consolidation returned no parseable artifact");
            return Ok(());
        };
        self.builder.memory.apply_consolidation(&artifact)
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn handle_new_session(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        let key = msg.session_key();
        let base = key.split('#').next().unwrap_or(&key).to_string();

        // Rollover is the consolidation trigger: fold the outgoing
        // conversation into memory before minting a fresh session.
        let old = self.sessions.get_or_create(&base);
        if !old.messages.is_empty() {
            if let Err(e) = self.consolidate_memory(&old, true).await {
                warn!(error = %e, "consolidation on rollover failed");
            }
        }

        let session = self.sessions.start_new(&base);
        self.sessions.save(&session)?;
        info!(base = %base, key = %session.key, "started new session");

        Ok(OutboundMessage {
            channel: msg.channel.clone(),
            chat_id: msg.chat_id.clone(),
            content: NEW_SESSION_GREETING.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: msg.metadata.clone(),
        })
    }

    fn should_stream(&self, channel: &str) -> bool {
        self.options.stream && channel != "cli"
    }

    fn make_request(
        &self,
        messages: &[ChatMessage],
        tools: Vec<serde_json::Value>,
        tool_choice: Option<ToolChoice>,
        session_state: &Option<serde_json::Value>,
    ) -> ChatRequest {
        ChatRequest {
            messages: messages.to_vec(),
            tools,
            tool_choice,
            model: self.model.clone(),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
            session_state: session_state.clone(),
        }
    }

    /// Call the provider, driving the streaming drain when enabled.
    /// Returns the response and whether any stream chunk went out.
    async fn call_provider(
        &self,
        request: ChatRequest,
        use_stream: bool,
        msg: &InboundMessage,
    ) -> (LLMResponse, bool) {
        if !use_stream {
            return (self.provider.chat(request, None).await, false);
        }

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let mut state = StreamState::new(
            self.bus.clone(),
            &msg.channel,
            &msg.chat_id,
            &msg.metadata,
            self.options.stream_min_chars,
            self.options.stream_min_interval_s,
        );
        let chat_fut = self.provider.chat(request, Some(tx));
        let drain_fut = async move {
            while let Some(delta) = rx.recv().await {
                state.on_delta(&delta).await;
            }
            state
        };
        let (response, mut state) = tokio::join!(chat_fut, drain_fut);
        state.flush(!response.has_tool_calls()).await;
        (response, state.sent_any)
    }

    async fn emit_milestone(&self, session: &mut Session, msg: &InboundMessage, text: &str) {
        let outbound = OutboundMessage::new(&msg.channel, &msg.chat_id, text);
        if let Err(e) = self.bus.publish_outbound_async(outbound).await {
            warn!(error = %e, "failed to push milestone message");
        }
        session.add_message("assistant", text, None);
    }
}

/// Whether the message is a `/new` command (optionally `/new@handle`).
fn is_new_session_command(content: &str) -> bool {
    let Some(first) = content.split_whitespace().next() else {
        return false;
    };
    let first = first.split('@').next().unwrap_or(first);
    first == "/new"
}

/// Parse a JSON object out of LLM output, tolerating code fences.
fn parse_json_artifact(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();
    let candidate = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.trim_start_matches('\n').trim_end_matches('`').trim()
    } else {
        trimmed
    };
    let parsed: serde_json::Value = serde_json::from_str(candidate).ok().or_else(|| {
        // Last resort: the outermost brace span.
        let start = candidate.find('{')?;
        let end = candidate.rfind('}')?;
        serde_json::from_str(&candidate[start..=end]).ok()
    })?;
    parsed.is_object().then_some(parsed)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round4(v: f64) -> f64 {
    (v * 10000.0).round() / 10000.0
}
