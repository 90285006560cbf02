//! Error types for the aria pipeline.

/// Top-level error type for the voice assistant.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech recognition error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Language model inference error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Tool dispatch error.
    #[error("tool error: {0}")]
    Tool(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// An operation was attempted in a state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The operation was cancelled (barge-in or shutdown). Never a failure.
    #[error("cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl VoiceError {
    /// Whether this error was caused by cooperative cancellation.
    ///
    /// Cancellation is part of normal barge-in control flow and must never
    /// be logged as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
