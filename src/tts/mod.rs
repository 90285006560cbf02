//! Streaming text-to-speech.
//!
//! [`Synthesizer`] is the remote duplex contract: a started stream accepts
//! text chunks and exposes a PCM reader that yields audio as the provider
//! produces it. [`pipeline::TtsPipeline`] bounds generation concurrency
//! while keeping playback strictly in enqueue order.

pub mod pipeline;
pub mod ws;

use crate::audio::stream::PcmStream;
use crate::error::Result;
use async_trait::async_trait;

/// Per-stream synthesis parameters resolved by the output pipe.
#[derive(Debug, Clone)]
pub struct SynthRequest {
    /// Provider voice id (already emotion-resolved).
    pub voice: String,
    /// Desired output sample rate.
    pub sample_rate: u32,
    /// Speaking rate, percent of normal.
    pub rate: u32,
    /// Pitch, percent of normal.
    pub pitch: u32,
    /// Volume, 0–100.
    pub volume: u32,
}

/// One synthesis stream.
///
/// May be written to multiple times; after [`close`](SynthStream::close) no
/// more audio arrives once the reader returns end of stream.
#[async_trait]
pub trait SynthStream: Send {
    /// Append text to the stream.
    async fn write_text_chunk(&mut self, text: &str) -> Result<()>;

    /// Signal end of input. Must be called exactly once.
    async fn close(&mut self) -> Result<()>;

    /// The PCM audio produced by this stream.
    fn audio_reader(&self) -> Box<dyn PcmStream>;

    /// Output sample rate.
    fn sample_rate(&self) -> u32;

    /// Output channel count.
    fn channels(&self) -> u16;
}

/// Remote duplex speech synthesizer.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Open a synthesis stream.
    async fn start(&self, request: &SynthRequest) -> Result<Box<dyn SynthStream>>;
}
