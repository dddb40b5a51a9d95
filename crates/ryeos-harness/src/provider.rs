//! Model provider interface
//!
//! The host never talks to a concrete LLM API itself; the runner process
//! supplies an implementation of `ModelProvider`. The harness consumes
//! whole turns, so the interface is non-streaming: one request in, one
//! response with content blocks, stop reason and usage out.

use async_trait::async_trait;
use ryeos_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Rough token estimate used for context-pressure decisions.
pub const CHARS_PER_TOKEN: f64 = 4.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: MessageContent::Text(content.into()) }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self { role: "assistant".into(), content: MessageContent::Blocks(blocks) }
    }

    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self { role: "user".into(), content: MessageContent::Blocks(blocks) }
    }

    pub fn is_user_text(&self) -> bool {
        self.role == "user" && matches!(self.content, MessageContent::Text(_))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: String,
    pub usage: Usage,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    /// Dollar estimate from per-megatoken rates.
    pub fn spend(&self, input_per_mtok: f64, output_per_mtok: f64) -> f64 {
        (self.input_tokens as f64 * input_per_mtok
            + self.output_tokens as f64 * output_per_mtok)
            / 1_000_000.0
    }
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Context window for a model, in tokens.
    fn context_window(&self, _model: &str) -> usize {
        200_000
    }

    /// (input, output) dollar rates per megatoken for spend accounting.
    fn pricing(&self, _model: &str) -> (f64, f64) {
        (3.0, 15.0)
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse>;
}

pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as f64 / CHARS_PER_TOKEN).ceil() as u64
}

pub fn estimate_message_tokens(messages: &[ChatMessage], system: Option<&str>) -> u64 {
    let mut total = system.map(estimate_tokens).unwrap_or(0);
    for message in messages {
        total += 10;
        total += match &message.content {
            MessageContent::Text(s) => estimate_tokens(s),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => estimate_tokens(text),
                    ContentBlock::ToolUse { name, input, .. } => {
                        estimate_tokens(name) + estimate_tokens(&input.to_string())
                    }
                    ContentBlock::ToolResult { content, .. } => estimate_tokens(content),
                })
                .sum::<u64>(),
        };
    }
    total
}

/// Test provider that replays a fixed script of responses.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ModelResponse>>,
    context_window: usize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            context_window: 200_000,
        }
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    pub fn text_turn(text: &str, usage: Usage) -> ModelResponse {
        ModelResponse {
            content: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: "end_turn".into(),
            usage,
        }
    }

    pub fn tool_turn(id: &str, name: &str, input: serde_json::Value, usage: Usage) -> ModelResponse {
        ModelResponse {
            content: vec![ContentBlock::ToolUse { id: id.into(), name: name.into(), input }],
            stop_reason: "tool_use".into(),
            usage,
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn context_window(&self, _model: &str) -> usize {
        self.context_window
    }

    async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse> {
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .ok_or_else(|| Error::internal("scripted provider exhausted"))
    }
}
