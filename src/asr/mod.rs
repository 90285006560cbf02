//! Streaming speech recognition.
//!
//! [`Recognizer`] is the remote duplex contract the input pipe drives: PCM
//! frames go up, partial and final transcripts come back through a result
//! handler. The pipeline core never sees provider specifics; [`ws`] supplies
//! a WebSocket-backed implementation.

pub mod ws;

use crate::error::Result;
use async_trait::async_trait;

/// One recognition result.
///
/// Partial transcripts (`!is_final`) may arrive arbitrarily often; a final
/// transcript closes a user turn.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    /// Recognized text so far.
    pub text: String,
    /// Whether this transcript is final.
    pub is_final: bool,
    /// Utterance start, in ms from session start.
    pub begin_ms: u64,
    /// Utterance end, in ms from session start; only set on finals.
    pub end_ms: Option<u64>,
}

/// Callback receiving every recognition result.
pub type TranscriptHandler = Box<dyn Fn(TranscriptEvent) + Send + Sync>;

/// Remote duplex speech recognizer.
///
/// Startable exactly once per instance; `send_audio` is legal only between
/// `start` and `finish`.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Open the recognition session.
    async fn start(&self) -> Result<()>;

    /// Stream one PCM frame (16-bit LE).
    async fn send_audio(&self, pcm: &[u8]) -> Result<()>;

    /// Signal end of audio; the provider flushes pending results.
    async fn finish(&self) -> Result<()>;

    /// Tear down the session. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Install the result handler. Must be called before `start`.
    fn on_result(&self, handler: TranscriptHandler);
}
