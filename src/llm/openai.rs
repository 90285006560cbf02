//! OpenAI-compatible chat completions adapter.
//!
//! Streams `/v1/chat/completions` with `stream: true` and normalizes the
//! delta chunks to the [`ChatDelta`] model: accumulated content plus tool
//! calls assembled from their fragment stream. Works against any endpoint
//! speaking the same dialect.

use crate::config::LlmConfig;
use crate::error::{Result, VoiceError};
use crate::llm::sse::SseParser;
use crate::llm::{ChatDelta, ChatMessage, ChatModel, MessageStream, ToolCallData};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A tool made visible to the model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// Chat model over an OpenAI-compatible HTTP endpoint.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    config: LlmConfig,
    tools: Vec<ToolDefinition>,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config: config.clone(),
            tools: Vec::new(),
        }
    }

    /// Declare tools the model may call.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    fn build_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let messages: Vec<_> = messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
        });
        if !self.tools.is_empty()
            && let Some(obj) = body.as_object_mut()
        {
            let tools: Vec<_> = self
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), json!(tools));
        }
        body
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn stream(&self, messages: &[ChatMessage]) -> Result<MessageStream> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = self.build_body(messages);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(VoiceError::Llm(format!("HTTP {status}: {body_text}")));
        }

        let (tx, rx) = mpsc::channel::<Result<ChatDelta>>(32);
        let mut byte_stream = response.bytes_stream();

        // Receiver drop aborts this task at the next send.
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut assembler = DeltaAssembler::default();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(VoiceError::Llm(format!("stream error: {e}")))).await;
                        return;
                    }
                };
                for event in parser.push(&chunk) {
                    if event.is_done() {
                        finish(&mut assembler, &tx).await;
                        return;
                    }
                    if let Some(delta) = assembler.push(&event.data)
                        && tx.send(Ok(delta)).await.is_err()
                    {
                        return;
                    }
                }
            }
            finish(&mut assembler, &tx).await;
        });

        Ok(rx)
    }
}

/// Emit any pending tool calls before the channel closes.
async fn finish(assembler: &mut DeltaAssembler, tx: &mpsc::Sender<Result<ChatDelta>>) {
    if let Some(delta) = assembler.take_pending_tool_calls() {
        let _ = tx.send(Ok(delta)).await;
    }
}

// ── Wire format ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallFragment>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    function: FunctionFragment,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates content and tool-call fragments across chunks.
#[derive(Default)]
struct DeltaAssembler {
    content: String,
    /// index → (name, argument JSON fragments).
    partial_calls: BTreeMap<u32, (String, String)>,
}

impl DeltaAssembler {
    /// Feed one SSE `data:` payload; returns a delta when it advanced state.
    fn push(&mut self, data: &str) -> Option<ChatDelta> {
        let payload: ChunkPayload = match serde_json::from_str(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("ignoring unparseable chunk: {e}");
                return None;
            }
        };
        let choice = payload.choices.into_iter().next()?;

        let mut changed = false;
        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            self.content.push_str(&content);
            changed = true;
        }
        for fragment in choice.delta.tool_calls {
            let entry = self.partial_calls.entry(fragment.index).or_default();
            if let Some(name) = fragment.function.name {
                entry.0.push_str(&name);
            }
            if let Some(args) = fragment.function.arguments {
                entry.1.push_str(&args);
            }
        }

        if choice.finish_reason.as_deref() == Some("tool_calls")
            && let Some(delta) = self.take_pending_tool_calls()
        {
            return Some(delta);
        }
        if changed {
            return Some(ChatDelta {
                content: self.content.clone(),
                tool_calls: Vec::new(),
            });
        }
        None
    }

    /// Drain assembled tool calls into a final delta.
    fn take_pending_tool_calls(&mut self) -> Option<ChatDelta> {
        if self.partial_calls.is_empty() {
            return None;
        }
        let calls: Vec<ToolCallData> = std::mem::take(&mut self.partial_calls)
            .into_values()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, args)| {
                let arguments = serde_json::from_str(&args).unwrap_or_else(|e| {
                    warn!("tool call '{name}' has malformed arguments: {e}");
                    serde_json::Value::Object(serde_json::Map::new())
                });
                ToolCallData { name, arguments }
            })
            .collect();
        if calls.is_empty() {
            return None;
        }
        Some(ChatDelta {
            content: self.content.clone(),
            tool_calls: calls,
        })
    }
}
