//! Streaming chat model access.
//!
//! [`ChatModel`] is the remote simplex-streaming contract the voice agent
//! drives. Each received delta carries the *accumulated* assistant content
//! (monotonically extending) and any tool calls surfaced so far; the end of
//! generation is the end of the stream.

pub mod openai;
pub mod sse;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Chat participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One conversation message.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool invocation surfaced by the model.
#[derive(Debug, Clone)]
pub struct ToolCallData {
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: serde_json::Value,
}

/// One streaming update.
#[derive(Debug, Clone, Default)]
pub struct ChatDelta {
    /// Full assistant content so far; each delta extends the previous one.
    pub content: String,
    /// Tool calls completed in this update.
    pub tool_calls: Vec<ToolCallData>,
}

/// Stream of chat updates; the channel closes at end of generation.
pub type MessageStream = mpsc::Receiver<Result<ChatDelta>>;

/// Remote streaming chat model.
///
/// Dropping the returned stream aborts the underlying request; cancellation
/// is therefore as cheap as dropping the receiver.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream(&self, messages: &[ChatMessage]) -> Result<MessageStream>;
}
