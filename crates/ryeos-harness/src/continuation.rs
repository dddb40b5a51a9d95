//! Continuation engine — context-window rollover
//!
//! Triggered at a turn boundary when the token estimate crosses the
//! handoff threshold, or explicitly when a user resumes a terminal
//! thread. The successor thread is seeded with an optional summary, a
//! trailing window of recent messages (capped by `resume_ceiling_tokens`
//! and trimmed to start on a user message), and an explicit continue
//! message. Registry linking is atomic; walking a chain is cycle-safe.

use crate::provider::{estimate_message_tokens, ChatMessage, ContentBlock, MessageContent};
use crate::transcript::read_events;
use ryeos_core::{Error, Result};
use ryeos_threads::spawn::SpawnRequest;
use ryeos_threads::{Orchestrator, SpawnOutcome, ThreadMeta};
use serde_json::Value;
use tracing::info;

pub const DEFAULT_RESUME_CEILING_TOKENS: u64 = 16_000;

pub struct ContinuationEngine {
    pub resume_ceiling_tokens: u64,
}

impl Default for ContinuationEngine {
    fn default() -> Self {
        Self { resume_ceiling_tokens: DEFAULT_RESUME_CEILING_TOKENS }
    }
}

impl ContinuationEngine {
    /// Automatic handoff. Returns the successor id and how many trailing
    /// messages were carried over.
    pub async fn handoff(
        &self,
        orchestrator: &Orchestrator,
        old: &ThreadMeta,
        messages: &[ChatMessage],
        summary: Option<String>,
    ) -> Result<(String, usize)> {
        // Phase 2: trailing fill under the resume ceiling.
        let trailing = trailing_fill(messages, self.resume_ceiling_tokens);
        let trailing_count = trailing.len();

        // Phase 3: seed = summary + trailing + explicit continue message.
        let mut seed = Vec::with_capacity(trailing_count + 2);
        if let Some(summary) = summary {
            seed.push(ChatMessage::user(format!(
                "Summary of the work so far:\n\n{summary}"
            )));
        }
        seed.extend(trailing);
        seed.push(ChatMessage::user(
            "The previous thread ran out of context. Continue the task from where it left off.",
        ));

        let mut req = SpawnRequest::new(old.directive_id.clone());
        req.model = old.model.clone();
        req.seed = Some(serde_json::to_value(&seed)?);
        req.detach = true;

        // Phase 4 happens inside spawn_continuation: the old thread's
        // `continued` status + forward pointer and the new row + back
        // pointer commit together.
        let outcome = orchestrator.spawn_continuation(&old.thread_id, req).await?;
        info!(
            old = %old.thread_id,
            new = %outcome.thread_id,
            trailing = trailing_count,
            "continuation successor spawned"
        );
        Ok((outcome.thread_id, trailing_count))
    }

    /// User resume of a terminal thread: full history from the transcript
    /// (no summary), plus the user's new message.
    pub async fn resume(
        &self,
        orchestrator: &Orchestrator,
        thread_id: &str,
        user_message: &str,
    ) -> Result<SpawnOutcome> {
        let old = orchestrator.registry.resolve_terminal(thread_id)?;
        if !old.status.is_terminal() {
            return Err(Error::validation(format!(
                "thread {} is {}, only terminal threads resume",
                old.thread_id, old.status
            )));
        }

        let transcript_path = old
            .transcript_path
            .clone()
            .ok_or_else(|| Error::not_found(format!("transcript for {}", old.thread_id)))?;
        let mut seed = reconstruct_messages(&read_events(&transcript_path)?);
        seed.push(ChatMessage::user(user_message));

        let mut req = SpawnRequest::new(old.directive_id.clone());
        req.model = old.model.clone();
        req.seed = Some(serde_json::to_value(&seed)?);
        req.detach = true;
        orchestrator.spawn_continuation(&old.thread_id, req).await
    }
}

/// Accumulate messages from the most recent backwards until the next one
/// would cross the ceiling, then trim the front so the list starts with a
/// plain user message.
pub fn trailing_fill(messages: &[ChatMessage], ceiling_tokens: u64) -> Vec<ChatMessage> {
    let mut taken: Vec<ChatMessage> = Vec::new();
    let mut budget = 0u64;
    for message in messages.iter().rev() {
        let cost = estimate_message_tokens(std::slice::from_ref(message), None);
        if !taken.is_empty() && budget + cost > ceiling_tokens {
            break;
        }
        budget += cost;
        taken.push(message.clone());
    }
    taken.reverse();

    while let Some(first) = taken.first() {
        if first.role == "user" {
            break;
        }
        taken.remove(0);
    }
    taken
}

/// Rebuild the message list from transcript events: seeds, assistant
/// turns, and tool-result messages, in order.
fn reconstruct_messages(events: &[Value]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    for event in events {
        match event["event"].as_str() {
            Some("user_message") | Some("tool_results") => {
                if let Ok(message) = serde_json::from_value::<ChatMessage>(event["payload"].clone()) {
                    messages.push(message);
                }
            }
            Some("turn") => {
                if let Ok(blocks) =
                    serde_json::from_value::<Vec<ContentBlock>>(event["payload"]["content"].clone())
                {
                    messages.push(ChatMessage {
                        role: "assistant".into(),
                        content: MessageContent::Blocks(blocks),
                    });
                }
            }
            _ => {}
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ScriptedProvider, Usage};
    use crate::turn::tests::{fixture, spawn_thread, write_workflow, RecordingDispatcher};
    use crate::turn::{Harness, HarnessConfig, RunEnd, ToolDispatcher};
    use ryeos_core::{Cost, ThreadStatus};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn dispatcher() -> Arc<RecordingDispatcher> {
        Arc::new(RecordingDispatcher { calls: Mutex::new(Vec::new()), reply: "ok".into() })
    }

    #[test]
    fn trailing_fill_respects_ceiling_and_user_start() {
        let messages = vec![
            ChatMessage::user("first question"),
            ChatMessage::assistant_blocks(vec![ContentBlock::Text { text: "a".repeat(400) }]),
            ChatMessage::user("second question"),
            ChatMessage::assistant_blocks(vec![ContentBlock::Text { text: "b".repeat(400) }]),
        ];
        // Generous ceiling keeps everything.
        let all = trailing_fill(&messages, 10_000);
        assert_eq!(all.len(), 4);

        // Tight ceiling keeps only the tail, then trims to a user start.
        let tail = trailing_fill(&messages, 150);
        assert!(!tail.is_empty());
        assert_eq!(tail[0].role, "user");
        assert!(tail.len() < 4);
    }

    #[tokio::test]
    async fn handoff_at_context_pressure() {
        let fx = fixture();
        write_workflow(&fx, "ops/longhaul",
            "name: longhaul\ncategory: ops\npermissions:\n  - execute.tool.files.*\n");
        let tid = spawn_thread(&fx, "ops/longhaul").await;

        // A 1000-token window and a ~1000-token response: the ratio
        // crosses 0.9 at the first turn boundary.
        let provider = ScriptedProvider::new(vec![ScriptedProvider::text_turn(
            &"x".repeat(4000),
            Usage { input_tokens: 100, output_tokens: 900 },
        )])
        .with_context_window(1000);
        let mut harness = Harness::new(
            fx.orchestrator.clone(),
            Arc::new(provider),
            dispatcher(),
            Some(fx.key.clone()),
            &tid,
            HarnessConfig::default(),
        )
        .unwrap();

        let end = harness.run(&[]).await.unwrap();
        let RunEnd::Continued { successor } = end else {
            panic!("expected continuation, got {end:?}");
        };

        let old = fx.orchestrator.registry.get(&tid).unwrap();
        assert_eq!(old.status, ThreadStatus::Continued);
        assert_eq!(old.continuation_thread_id.as_deref(), Some(successor.as_str()));

        let new = fx.orchestrator.registry.get(&successor).unwrap();
        assert_eq!(new.continuation_of.as_deref(), Some(tid.as_str()));
        assert_eq!(new.chain_root(), tid);
        assert_eq!(old.chain_root(), new.chain_root());

        // Waiting on the old id resolves to the successor's result.
        fx.orchestrator
            .registry
            .set_result(&successor, ThreadStatus::Completed, &json!("carried on"), &Cost::default())
            .unwrap();
        let report = fx
            .orchestrator
            .wait(&[tid.clone()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.results[0].resolved_thread_id, successor);
        assert_eq!(report.results[0].result, Some(json!("carried on")));
    }

    #[tokio::test]
    async fn below_threshold_completes_normally() {
        let fx = fixture();
        write_workflow(&fx, "ops/brief",
            "name: brief\ncategory: ops\npermissions:\n  - execute.tool.files.*\n");
        let tid = spawn_thread(&fx, "ops/brief").await;

        let provider = ScriptedProvider::new(vec![ScriptedProvider::text_turn(
            "short answer",
            Usage { input_tokens: 10, output_tokens: 5 },
        )])
        .with_context_window(1000);
        let mut harness = Harness::new(
            fx.orchestrator.clone(),
            Arc::new(provider),
            dispatcher(),
            None,
            &tid,
            HarnessConfig::default(),
        )
        .unwrap();
        let end = harness.run(&[]).await.unwrap();
        assert!(matches!(end, RunEnd::Completed { .. }));
        assert_eq!(
            fx.orchestrator.registry.get(&tid).unwrap().status,
            ThreadStatus::Completed
        );
    }

    #[tokio::test]
    async fn resume_terminal_thread_reconstructs_history() {
        let fx = fixture();
        write_workflow(&fx, "ops/brief",
            "name: brief\ncategory: ops\npermissions:\n  - execute.tool.files.*\n");
        let tid = spawn_thread(&fx, "ops/brief").await;

        let provider = ScriptedProvider::new(vec![ScriptedProvider::text_turn(
            "finished the first pass",
            Usage { input_tokens: 10, output_tokens: 5 },
        )]);
        let mut harness = Harness::new(
            fx.orchestrator.clone(),
            Arc::new(provider),
            dispatcher(),
            None,
            &tid,
            HarnessConfig::default(),
        )
        .unwrap();
        harness.run(&[]).await.unwrap();

        let engine = ContinuationEngine::default();
        let outcome = engine
            .resume(&fx.orchestrator, &tid, "now refine the result")
            .await
            .unwrap();

        let new = fx.orchestrator.registry.get(&outcome.thread_id).unwrap();
        assert_eq!(new.continuation_of.as_deref(), Some(tid.as_str()));

        // The old thread kept its completed status but gained the pointer.
        let old = fx.orchestrator.registry.get(&tid).unwrap();
        assert_eq!(old.status, ThreadStatus::Completed);
        assert_eq!(old.continuation_thread_id.as_deref(), Some(outcome.thread_id.as_str()));

        // The successor's seed carries the full history plus the new ask.
        let input_path = fx.orchestrator.thread_dir(&outcome.thread_id).join("input.json");
        let input: Value = serde_json::from_str(&std::fs::read_to_string(input_path).unwrap()).unwrap();
        let seed = input["seed"].as_array().unwrap();
        assert!(seed.len() >= 3);
        let last = seed.last().unwrap();
        assert!(last["content"].as_str().unwrap().contains("refine"));

        // Resuming a running thread is rejected.
        let err = engine
            .resume(&fx.orchestrator, &outcome.thread_id, "again")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }
}
