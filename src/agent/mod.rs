//! Voice agent: turns a user utterance into a lazy event sequence.
//!
//! Drives a streaming [`ChatModel`], converts its cumulative content into
//! monotonic text deltas, detects `[EMO:<name>]` emotion tags, classifies
//! tool calls, and synthesizes spoken acknowledgements for action tools.
//! The event channel closes after exactly one `Finished`.

pub mod markdown;
pub mod segmenter;
pub mod tools;

use crate::config::{AgentConfig, ToolsConfig};
use crate::error::Result;
use crate::llm::{ChatMessage, ChatModel};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tools::{ActionResponseGenerator, ToolClassifier, ToolKind};
use tracing::debug;

/// Marker an LLM uses to switch the voice's emotion mid-response.
pub(crate) const EMOTION_TAG_PREFIX: &str = "[EMO:";

/// Emotion used before any tag is seen.
pub const DEFAULT_EMOTION: &str = "default";

/// One event in the agent's lazy output sequence.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// New text; `delta` extends everything emitted before it.
    TextChunk { delta: String, emotion: String },
    /// The detected emotion changed.
    EmotionChanged { emotion: String },
    /// The model requested a tool invocation.
    ToolCallRequested {
        name: String,
        args: Value,
        kind: ToolKind,
    },
    /// Exactly one, last.
    Finished { error: Option<String> },
}

/// LLM-backed conversation agent.
pub struct VoiceAgent {
    model: Arc<dyn ChatModel>,
    classifier: ToolClassifier,
    action_responses: ActionResponseGenerator,
    system_prompt: String,
}

impl VoiceAgent {
    pub fn new(model: Arc<dyn ChatModel>, agent: &AgentConfig, tools: &ToolsConfig) -> Self {
        let classifier = ToolClassifier::from_config(tools);
        let system_prompt = build_system_prompt(&agent.system_prompt, &classifier.known_tools());
        Self {
            model,
            classifier,
            action_responses: ActionResponseGenerator::from_config(tools),
            system_prompt,
        }
    }

    /// Run one turn. Events arrive lazily on the returned channel; dropping
    /// the receiver cancels the underlying model stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the chat stream cannot be opened.
    pub async fn process(&self, input: &str) -> Result<mpsc::Receiver<AgentEvent>> {
        let messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(input),
        ];
        let mut stream = self.model.stream(&messages).await?;

        let (tx, rx) = mpsc::channel::<AgentEvent>(32);
        let classifier = self.classifier.clone();
        let action_responses = self.action_responses.clone();

        tokio::spawn(async move {
            let mut last_len = 0usize;
            let mut current_emotion = DEFAULT_EMOTION.to_owned();
            let mut error: Option<String> = None;

            while let Some(delta) = stream.recv().await {
                let delta = match delta {
                    Ok(d) => d,
                    Err(e) => {
                        if !e.is_cancelled() {
                            error = Some(e.to_string());
                        }
                        break;
                    }
                };

                // Content is cumulative; emit only the new suffix. Clamp a
                // shrinking or misaligned length rather than re-emitting.
                let content = &delta.content;
                if last_len > content.len() {
                    last_len = content.len();
                }
                while last_len > 0 && !content.is_char_boundary(last_len) {
                    last_len -= 1;
                }
                let new_text = &content[last_len..];
                last_len = content.len();

                if !new_text.is_empty() {
                    if let Some(emotion) = extract_emotion(new_text)
                        && emotion != current_emotion
                    {
                        current_emotion = emotion.clone();
                        if tx.send(AgentEvent::EmotionChanged { emotion }).await.is_err() {
                            return;
                        }
                    }
                    let event = AgentEvent::TextChunk {
                        delta: new_text.to_owned(),
                        emotion: current_emotion.clone(),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }

                for call in delta.tool_calls {
                    let kind = classifier.get_type(&call.name);
                    debug!(tool = %call.name, ?kind, "tool call requested");
                    let event = AgentEvent::ToolCallRequested {
                        name: call.name.clone(),
                        args: call.arguments.clone(),
                        kind,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }

                    // Action tools speak a canned acknowledgement right away.
                    if kind == ToolKind::Action
                        && let Some(ack) = action_responses.generate(&call.name, &call.arguments)
                        && !ack.is_empty()
                    {
                        let emotion = extract_emotion(&ack)
                            .unwrap_or_else(|| current_emotion.clone());
                        let event = AgentEvent::TextChunk { delta: ack, emotion };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }

            let _ = tx.send(AgentEvent::Finished { error }).await;
        });

        Ok(rx)
    }
}

/// Compose the system prompt, declaring available tools and the emotion tag
/// convention.
fn build_system_prompt(base: &str, tool_names: &[String]) -> String {
    let mut prompt = base.to_owned();
    if !tool_names.is_empty() {
        prompt.push_str("\n\nAvailable tools: ");
        prompt.push_str(&tool_names.join(", "));
        prompt.push('.');
    }
    prompt.push_str(
        "\nYou may switch the speaking emotion with a tag like [EMO:happy] \
         at the start of a sentence.",
    );
    prompt
}

/// Find the last `[EMO:<name>]` tag in the text.
pub(crate) fn extract_emotion(text: &str) -> Option<String> {
    let mut found = None;
    let mut rest = text;
    while let Some(start) = rest.find(EMOTION_TAG_PREFIX) {
        let after = &rest[start + EMOTION_TAG_PREFIX.len()..];
        match after.find(']') {
            Some(end) => {
                let name = after[..end].trim();
                if !name.is_empty() {
                    found = Some(name.to_owned());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    found
}
