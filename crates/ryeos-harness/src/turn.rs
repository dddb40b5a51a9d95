//! The per-turn harness loop
//!
//! Single-task cooperative inside one thread subprocess. Order within a
//! turn is fixed: limit policies, cancellation sentinel, before-turn
//! hooks, model call, cost accounting (ledger before tool calls),
//! context-pressure check, then tool-call execution with per-call
//! permission gating. Limit and cancellation outcomes are normal
//! branches, never panics or thrown errors.

use crate::continuation::ContinuationEngine;
use crate::hooks::{parse_hooks, Hook, HookEvent};
use crate::permission::check_permission;
use crate::policy::check_limits;
use crate::provider::{
    estimate_message_tokens, ChatMessage, ContentBlock, ModelProvider, ModelRequest,
};
use crate::transcript::TranscriptWriter;
use async_trait::async_trait;
use ryeos_core::{ArtifactId, ArtifactKind, Cost, Error, Result, ThreadStatus, Verb};
use ryeos_store::keys::SigningKey;
use ryeos_threads::spawn::{CANCEL_SENTINEL, INPUT_FILE, THREAD_SNAPSHOT_FILE, TRANSCRIPT_FILE};
use ryeos_threads::{Orchestrator, ThreadMeta};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_HANDOFF_THRESHOLD: f64 = 0.9;

/// A parsed tool call: the agent's tools are the four host verbs.
#[derive(Clone, Debug)]
pub struct ToolCallSpec {
    pub verb: Verb,
    pub kind: ArtifactKind,
    pub id: Option<ArtifactId>,
    pub params: Map<String, Value>,
}

impl ToolCallSpec {
    pub fn parse(name: &str, input: &Value) -> Result<Self> {
        let verb: Verb = name
            .parse()
            .map_err(|_| Error::validation(format!("unknown tool '{name}'")))?;
        let kind: ArtifactKind = input
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation("tool call missing 'kind'"))?
            .parse()?;
        let id = match input.get("id").and_then(|v| v.as_str()) {
            Some(id) => Some(ArtifactId::new(id)?),
            None => None,
        };
        let params = input
            .get("params")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        Ok(Self { verb, kind, id, params })
    }
}

#[derive(Clone, Debug)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: true }
    }
}

/// The harness dispatches allowed tool calls through this seam; the host
/// dispatcher implements it. Errors come back as error tool results, not
/// as harness failures.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, thread_id: &str, call: &ToolCallSpec) -> ToolOutcome;
}

#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub handoff_threshold: f64,
    pub max_output_tokens: u32,
    pub system_prompt: Option<String>,
    pub default_model: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            handoff_threshold: DEFAULT_HANDOFF_THRESHOLD,
            max_output_tokens: 8192,
            system_prompt: None,
            default_model: "small-1".to_string(),
        }
    }
}

/// How a harness run ended. Every variant is a clean, recorded outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum RunEnd {
    Completed { result: Value },
    Suspended { axis: String },
    Cancelled,
    Continued { successor: String },
    Failed { message: String },
}

pub struct Harness {
    orchestrator: Arc<Orchestrator>,
    provider: Arc<dyn ModelProvider>,
    dispatcher: Arc<dyn ToolDispatcher>,
    config: HarnessConfig,
    continuation: ContinuationEngine,
    meta: ThreadMeta,
    messages: Vec<ChatMessage>,
    transcript: TranscriptWriter,
    cost: Cost,
    started: Instant,
}

impl Harness {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        provider: Arc<dyn ModelProvider>,
        dispatcher: Arc<dyn ToolDispatcher>,
        signing_key: Option<Arc<SigningKey>>,
        thread_id: &str,
        config: HarnessConfig,
    ) -> Result<Self> {
        let meta = orchestrator.registry.get(thread_id)?;
        let dir = orchestrator.thread_dir(thread_id);
        let transcript_path = meta
            .transcript_path
            .clone()
            .unwrap_or_else(|| dir.join(TRANSCRIPT_FILE));
        let mut transcript = TranscriptWriter::create(transcript_path, signing_key)?;

        let messages = seed_messages(&dir.join(INPUT_FILE))?;
        for message in &messages {
            transcript.append("user_message", serde_json::to_value(message)?)?;
        }

        let cost = meta.cost;
        Ok(Self {
            orchestrator,
            provider,
            dispatcher,
            config,
            continuation: ContinuationEngine::default(),
            meta,
            messages,
            transcript,
            cost,
            started: Instant::now(),
        })
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Hooks come from the registry meta's directive at spawn time; they
    /// are loaded by the runner and passed in here.
    pub async fn run(&mut self, hooks: &[Hook]) -> Result<RunEnd> {
        if self.meta.status == ThreadStatus::Created {
            self.orchestrator
                .registry
                .set_status(&self.meta.thread_id, ThreadStatus::Running)?;
            self.meta.status = ThreadStatus::Running;
        }
        self.transcript.append(
            "thread_started",
            json!({"thread_id": self.meta.thread_id, "directive": self.meta.directive_id.as_str()}),
        )?;

        loop {
            self.cost.duration_s = self.started.elapsed().as_secs();
            let spawned = self
                .orchestrator
                .registry
                .list_children(&self.meta.thread_id)?
                .len() as u32;

            if let Some(limit) = check_limits(&self.cost, &self.meta.limits, spawned, self.cost.duration_s) {
                return self.suspend_on_limit(limit);
            }
            if self.cancel_requested() {
                return self.finalize_cancelled();
            }

            self.run_hooks(hooks, HookEvent::BeforeTurn, &json!({"cost": self.cost}))
                .await?;

            let model = self
                .meta
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone());
            let request = ModelRequest {
                model: model.clone(),
                system: self.config.system_prompt.clone(),
                messages: self.messages.clone(),
                max_tokens: self.config.max_output_tokens,
            };
            self.transcript.append(
                "model_call",
                json!({"n": self.cost.turns_used + 1, "model": model, "messages": self.messages.len()}),
            )?;
            self.write_snapshot()?;
            let response = match self.provider.complete(request).await {
                Ok(response) => response,
                Err(e) => return self.finalize_error(e),
            };

            // Cost lands in the ledger before any tool call runs.
            let (in_rate, out_rate) = self.provider.pricing(&model);
            let turn_spend = response.usage.spend(in_rate, out_rate);
            self.cost.add_turn(
                response.usage.input_tokens,
                response.usage.output_tokens,
                turn_spend,
            );
            self.orchestrator
                .ledger
                .record_spend(&self.meta.thread_id, turn_spend)?;
            self.orchestrator
                .registry
                .update_cost(&self.meta.thread_id, &self.cost)?;
            self.transcript.append(
                "turn",
                json!({
                    "n": self.cost.turns_used,
                    "stop_reason": response.stop_reason,
                    "usage": response.usage,
                    "spend": turn_spend,
                    "content": response.content,
                }),
            )?;
            self.write_snapshot()?;

            self.messages
                .push(ChatMessage::assistant_blocks(response.content.clone()));

            let estimated = estimate_message_tokens(
                &self.messages,
                self.config.system_prompt.as_deref(),
            );
            let window = self.provider.context_window(&model).max(1);
            let context_ratio = estimated as f64 / window as f64;
            debug!(
                thread = %self.meta.thread_id,
                turn = self.cost.turns_used,
                context_ratio,
                "turn complete"
            );

            self.run_hooks(
                hooks,
                HookEvent::AfterTurn,
                &json!({"cost": self.cost, "context_ratio": context_ratio}),
            )
            .await?;

            if context_ratio >= self.config.handoff_threshold {
                return match self.hand_off(hooks, context_ratio).await {
                    Ok(end) => Ok(end),
                    // A failed handoff still ends the thread cleanly.
                    Err(e) => self.finalize_error(e),
                };
            }

            let tool_uses = response.tool_uses();
            if tool_uses.is_empty() {
                let result = json!({"output": response.text()});
                return self.finalize_completed(result);
            }

            let mut result_blocks = Vec::with_capacity(tool_uses.len());
            for (call_id, name, input) in tool_uses {
                let outcome = self.handle_tool_call(call_id, name, input).await?;
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call_id.to_string(),
                    content: outcome.content,
                    is_error: outcome.is_error.then_some(true),
                });
            }
            let results_message = ChatMessage::tool_results(result_blocks);
            self.transcript
                .append("tool_results", serde_json::to_value(&results_message)?)?;
            self.messages.push(results_message);
        }
    }

    async fn handle_tool_call(
        &mut self,
        call_id: &str,
        name: &str,
        input: &Value,
    ) -> Result<ToolOutcome> {
        let spec = match ToolCallSpec::parse(name, input) {
            Ok(spec) => spec,
            Err(e) => {
                self.transcript
                    .append("tool_call", json!({"id": call_id, "name": name, "error": e.to_string()}))?;
                return Ok(ToolOutcome::error(format!("{}: {e}", e.kind())));
            }
        };
        self.transcript.append(
            "tool_call",
            json!({
                "id": call_id,
                "verb": spec.verb.as_str(),
                "kind": spec.kind.as_str(),
                "artifact": spec.id.as_ref().map(|i| i.as_str()),
            }),
        )?;

        if let Err(denial) =
            check_permission(&self.meta.capabilities, spec.verb, spec.kind, spec.id.as_ref())
        {
            // A denial is information for the agent; the turn continues.
            self.transcript.append(
                "permission_denied",
                json!({"id": call_id, "required": denial.to_string()}),
            )?;
            return Ok(ToolOutcome::error(format!("{}: {denial}", denial.kind())));
        }

        let outcome = self.dispatcher.dispatch(&self.meta.thread_id, &spec).await;
        self.transcript.append(
            "tool_result",
            json!({"id": call_id, "is_error": outcome.is_error}),
        )?;
        Ok(outcome)
    }

    async fn run_hooks(&mut self, hooks: &[Hook], event: HookEvent, payload: &Value) -> Result<()> {
        for hook in hooks.iter().filter(|h| h.fires(event, payload)) {
            let spec = ToolCallSpec {
                verb: Verb::Execute,
                kind: hook.action.kind,
                id: Some(ArtifactId::new(hook.action.id.clone())?),
                params: hook.action.params.clone(),
            };
            let outcome = self.dispatcher.dispatch(&self.meta.thread_id, &spec).await;
            self.transcript.append(
                "hook",
                json!({"artifact": hook.action.id, "is_error": outcome.is_error}),
            )?;
            if outcome.is_error {
                warn!(thread = %self.meta.thread_id, hook = %hook.action.id, "hook action failed");
            }
        }
        Ok(())
    }

    async fn hand_off(&mut self, hooks: &[Hook], context_ratio: f64) -> Result<RunEnd> {
        // Phase 1: optional summarizer via a context_pressure hook.
        let mut summary = None;
        for hook in hooks
            .iter()
            .filter(|h| h.fires(HookEvent::ContextPressure, &json!({"context_ratio": context_ratio})))
        {
            let spec = ToolCallSpec {
                verb: Verb::Execute,
                kind: hook.action.kind,
                id: Some(ArtifactId::new(hook.action.id.clone())?),
                params: hook.action.params.clone(),
            };
            let outcome = self.dispatcher.dispatch(&self.meta.thread_id, &spec).await;
            if !outcome.is_error {
                summary = Some(outcome.content);
                break;
            }
        }

        let (successor_id, trailing_count) = self
            .continuation
            .handoff(
                &self.orchestrator,
                &self.meta,
                &self.messages,
                summary,
            )
            .await?;

        // Phase 5: record the link in the old transcript.
        self.transcript.append(
            "thread_continued",
            json!({
                "continuation_thread_id": successor_id,
                "trailing_messages": trailing_count,
                "context_ratio": context_ratio,
            }),
        )?;
        self.orchestrator.ledger.settle(&self.meta.thread_id)?;
        self.write_snapshot()?;
        info!(thread = %self.meta.thread_id, successor = %successor_id, "context handoff complete");
        Ok(RunEnd::Continued { successor: successor_id })
    }

    fn cancel_requested(&self) -> bool {
        self.orchestrator
            .thread_dir(&self.meta.thread_id)
            .join(CANCEL_SENTINEL)
            .exists()
    }

    fn suspend_on_limit(&mut self, limit: Error) -> Result<RunEnd> {
        let axis = match &limit {
            Error::LimitExceeded { axis, .. } => axis.clone(),
            _ => "unknown".to_string(),
        };
        self.transcript
            .append("limit", json!({"kind": limit.kind(), "message": limit.to_string()}))?;
        self.orchestrator
            .registry
            .set_status(&self.meta.thread_id, ThreadStatus::Suspended)?;
        self.orchestrator
            .registry
            .update_cost(&self.meta.thread_id, &self.cost)?;
        self.write_snapshot()?;
        info!(thread = %self.meta.thread_id, axis, "suspended by limit");
        Ok(RunEnd::Suspended { axis })
    }

    fn finalize_cancelled(&mut self) -> Result<RunEnd> {
        self.transcript.append("finalized", json!({"status": "cancelled"}))?;
        self.orchestrator.registry.set_result(
            &self.meta.thread_id,
            ThreadStatus::Cancelled,
            &json!({"error": {"kind": Error::Cancelled.kind()}}),
            &self.cost,
        )?;
        self.orchestrator.ledger.settle(&self.meta.thread_id)?;
        self.write_snapshot()?;
        Ok(RunEnd::Cancelled)
    }

    fn finalize_completed(&mut self, result: Value) -> Result<RunEnd> {
        self.transcript.append("finalized", json!({"status": "completed"}))?;
        self.orchestrator.registry.set_result(
            &self.meta.thread_id,
            ThreadStatus::Completed,
            &result,
            &self.cost,
        )?;
        self.orchestrator.ledger.settle(&self.meta.thread_id)?;
        self.write_snapshot()?;
        Ok(RunEnd::Completed { result })
    }

    fn finalize_error(&mut self, error: Error) -> Result<RunEnd> {
        let message = error.to_string();
        self.transcript
            .append("finalized", json!({"status": "error", "error": {"kind": error.kind(), "message": message}}))?;
        self.orchestrator.registry.set_result(
            &self.meta.thread_id,
            ThreadStatus::Error,
            &json!({"error": {"kind": error.kind(), "message": message}}),
            &self.cost,
        )?;
        self.orchestrator.ledger.settle(&self.meta.thread_id)?;
        self.write_snapshot()?;
        Ok(RunEnd::Failed { message })
    }

    fn write_snapshot(&self) -> Result<()> {
        let snapshot = json!({
            "thread_id": self.meta.thread_id,
            "directive": self.meta.directive_id.as_str(),
            "cost": self.cost,
            "limits": self.meta.limits,
            "updated_at": chrono::Utc::now().to_rfc3339(),
        });
        let path = self
            .orchestrator
            .thread_dir(&self.meta.thread_id)
            .join(THREAD_SNAPSHOT_FILE);
        std::fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
        Ok(())
    }
}

/// Seed conversation from the thread's input file: an explicit seed array
/// (continuation successors) or a synthetic first user message.
fn seed_messages(input_path: &std::path::Path) -> Result<Vec<ChatMessage>> {
    let raw = std::fs::read_to_string(input_path).unwrap_or_default();
    let input: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);

    if let Some(seed) = input.get("seed") {
        if seed.is_array() {
            let messages: Vec<ChatMessage> = serde_json::from_value(seed.clone())?;
            if !messages.is_empty() {
                return Ok(messages);
            }
        }
    }

    let directive = input.get("directive").and_then(|v| v.as_str()).unwrap_or("?");
    let inputs = input.get("inputs").cloned().unwrap_or(json!({}));
    Ok(vec![ChatMessage::user(format!(
        "Execute workflow {directive} with inputs:\n{}",
        serde_json::to_string_pretty(&inputs)?
    ))])
}
