//! Acoustic echo control.
//!
//! Prevents the bot's own loudspeaker output from being re-recognized as
//! user speech. Two modes:
//!
//! - **Gate** (default): while the reference buffer reports recent playback,
//!   the microphone frame is replaced with silence. Zero DSP cost, zero
//!   convergence time.
//! - **Cancel**: each frame is run through an [`EchoCanceller`] together with
//!   a delay-aligned reference frame. Ships with [`NoopEchoCanceller`] as the
//!   identity placeholder; a real adaptive filter plugs into the same trait.
//!
//! ```text
//! Mic → [AecSource] → VAD → ASR
//!           ↑
//!           └── ReferenceBuffer ◄── reference tap (played TTS audio)
//! ```

use crate::audio::source::AudioSource;
use crate::audio::stream::ReferenceSink;
use crate::config::AecConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Echo cancellation DSP contract.
///
/// `process` receives one near-end (microphone) frame and the matching
/// far-end (reference) frame, both `frame_bytes` long, and returns the
/// cleaned near-end frame of the same length.
pub trait EchoCanceller: Send {
    fn process(&mut self, near: &[u8], far: &[u8]) -> Result<Vec<u8>>;
}

/// Identity canceller: returns the near-end frame unchanged.
pub struct NoopEchoCanceller;

impl EchoCanceller for NoopEchoCanceller {
    fn process(&mut self, near: &[u8], _far: &[u8]) -> Result<Vec<u8>> {
        Ok(near.to_vec())
    }
}

struct RingState {
    frames: VecDeque<Vec<u8>>,
    /// Partial bytes from a write that did not fill a whole frame.
    partial: Vec<u8>,
    last_write: Option<Instant>,
}

/// Overwritable ring of fixed-size reference frames written by the output
/// stage and drained by the AEC wrapper.
///
/// Reads lag writes by `delay_frames` so cancellation aligns with the
/// acoustic path latency.
pub struct ReferenceBuffer {
    state: Mutex<RingState>,
    frame_bytes: usize,
    max_frames: usize,
    delay_frames: usize,
    active_window: Duration,
}

impl ReferenceBuffer {
    /// # Errors
    ///
    /// Returns an error when the configuration produces a zero frame size.
    pub fn new(config: &AecConfig, sample_rate: u32, channels: u16) -> Result<Self> {
        let frame_bytes =
            (sample_rate as usize * channels as usize * config.frame_ms as usize * 2) / 1000;
        if frame_bytes == 0 {
            return Err(VoiceError::Config(format!(
                "AEC frame size is zero (sample_rate={sample_rate}, frame_ms={})",
                config.frame_ms
            )));
        }
        let delay_frames = (config.far_end_delay_ms / config.frame_ms.max(1)) as usize;
        // Hold up to two seconds of reference audio.
        let max_frames = (2000 / config.frame_ms.max(1)) as usize + delay_frames;
        Ok(Self {
            state: Mutex::new(RingState {
                frames: VecDeque::with_capacity(max_frames),
                partial: Vec::new(),
                last_write: None,
            }),
            frame_bytes,
            max_frames,
            delay_frames,
            active_window: Duration::from_millis(u64::from(config.reference_active_window_ms)),
        })
    }

    /// Size of one reference frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Append played-back PCM, split into frame-sized entries.
    ///
    /// A trailing partial chunk is carried over to the next write; the ring
    /// overwrites its oldest entries when full.
    pub fn write(&self, pcm: &[u8]) {
        if pcm.is_empty() {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.last_write = Some(Instant::now());
        state.partial.extend_from_slice(pcm);
        while state.partial.len() >= self.frame_bytes {
            let frame: Vec<u8> = state.partial.drain(..self.frame_bytes).collect();
            if state.frames.len() == self.max_frames {
                let _ = state.frames.pop_front();
            }
            state.frames.push_back(frame);
        }
    }

    /// Pop the next delay-aligned reference frame.
    ///
    /// Returns silence until the write backlog exceeds `delay_frames`, so the
    /// frame handed to the canceller is the one played `far_end_delay_ms`
    /// ago.
    pub fn read_frame(&self) -> Vec<u8> {
        let Ok(mut state) = self.state.lock() else {
            return vec![0; self.frame_bytes];
        };
        if state.frames.len() > self.delay_frames {
            match state.frames.pop_front() {
                Some(f) => f,
                None => vec![0; self.frame_bytes],
            }
        } else {
            vec![0; self.frame_bytes]
        }
    }

    /// Whether the loudspeaker path has been active within the configured
    /// window.
    pub fn is_active(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        match state.last_write {
            Some(t) => t.elapsed() <= self.active_window,
            None => false,
        }
    }

    /// Drop all buffered reference audio (e.g. on barge-in).
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.frames.clear();
            state.partial.clear();
        }
    }
}

impl ReferenceSink for ReferenceBuffer {
    fn write_reference(&self, pcm: &[u8]) {
        self.write(pcm);
    }
}

/// AEC operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AecMode {
    /// Substitute silence for the mic signal while playback is active.
    Gate,
    /// Run an [`EchoCanceller`] over delay-aligned frame pairs.
    Cancel,
}

/// An [`AudioSource`] wrapper applying echo control to every frame.
pub struct AecSource {
    inner: Box<dyn AudioSource>,
    reference: std::sync::Arc<ReferenceBuffer>,
    mode: AecMode,
    canceller: Mutex<Box<dyn EchoCanceller>>,
}

impl AecSource {
    pub fn new(
        inner: Box<dyn AudioSource>,
        reference: std::sync::Arc<ReferenceBuffer>,
        mode: AecMode,
        canceller: Box<dyn EchoCanceller>,
    ) -> Self {
        Self {
            inner,
            reference,
            mode,
            canceller: Mutex::new(canceller),
        }
    }

    fn cancel_frame(&self, frame: &[u8]) -> Vec<u8> {
        let frame_bytes = self.reference.frame_bytes();
        let mut out = Vec::with_capacity(frame.len());
        let mut offset = 0;

        while offset + frame_bytes <= frame.len() {
            let near = &frame[offset..offset + frame_bytes];
            let far = self.reference.read_frame();
            let cleaned = match self.canceller.lock() {
                Ok(mut c) => c.process(near, &far),
                Err(_) => Ok(near.to_vec()),
            };
            match cleaned {
                Ok(c) if c.len() == near.len() => out.extend_from_slice(&c),
                Ok(c) => {
                    warn!("echo canceller returned {} bytes for a {} byte frame", c.len(), near.len());
                    out.extend_from_slice(near);
                }
                Err(e) => {
                    warn!("echo canceller failed: {e}");
                    out.extend_from_slice(near);
                }
            }
            offset += frame_bytes;
        }
        // Sub-frame remainder passes through unprocessed.
        if offset < frame.len() {
            out.extend_from_slice(&frame[offset..]);
        }
        out
    }
}

#[async_trait]
impl AudioSource for AecSource {
    async fn read(&mut self) -> Result<Vec<u8>> {
        let frame = self.inner.read().await?;
        if frame.is_empty() {
            return Ok(frame);
        }
        match self.mode {
            AecMode::Gate => {
                if self.reference.is_active() {
                    Ok(vec![0; frame.len()])
                } else {
                    Ok(frame)
                }
            }
            AecMode::Cancel => Ok(self.cancel_frame(&frame)),
        }
    }

    fn close(&self) {
        self.inner.close();
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::AecConfig;
    use crate::test_utils::ScriptedSource;
    use std::sync::Arc;

    fn test_config() -> AecConfig {
        AecConfig {
            enable: true,
            mode: "gate".into(),
            frame_ms: 20,
            far_end_delay_ms: 0,
            reference_active_window_ms: 120,
        }
    }

    fn ref_buf(config: &AecConfig) -> Arc<ReferenceBuffer> {
        Arc::new(ReferenceBuffer::new(config, 16_000, 1).unwrap())
    }

    #[test]
    fn frame_bytes_from_rate_and_window() {
        let buf = ref_buf(&test_config());
        // 16kHz mono, 20ms, 2 bytes/sample.
        assert_eq!(buf.frame_bytes(), 640);
    }

    #[test]
    fn inactive_before_first_write() {
        let buf = ref_buf(&test_config());
        assert!(!buf.is_active());
    }

    #[test]
    fn active_window_expires() {
        let buf = ref_buf(&test_config());
        buf.write(&[1u8; 640]);
        assert!(buf.is_active());
        std::thread::sleep(Duration::from_millis(130));
        assert!(!buf.is_active());
    }

    #[test]
    fn partial_writes_accumulate_into_frames() {
        let buf = ref_buf(&test_config());
        buf.write(&[1u8; 400]);
        buf.write(&[2u8; 400]);
        // 800 bytes written, one full 640-byte frame available.
        let frame = buf.read_frame();
        assert_eq!(frame.len(), 640);
        assert_eq!(frame[0], 1);
        assert_eq!(frame[639], 2);
    }

    #[test]
    fn read_lags_by_delay_frames() {
        let config = AecConfig {
            far_end_delay_ms: 40, // 2 frames at 20ms
            ..test_config()
        };
        let buf = ref_buf(&config);
        buf.write(&[9u8; 640]);
        buf.write(&[8u8; 640]);
        // Backlog (2) not above delay (2): still silence.
        assert!(buf.read_frame().iter().all(|&b| b == 0));
        buf.write(&[7u8; 640]);
        // Now 3 > 2: the oldest frame pops.
        assert_eq!(buf.read_frame()[0], 9);
    }

    #[tokio::test]
    async fn gate_substitutes_silence_while_active() {
        let config = test_config();
        let buf = ref_buf(&config);
        let source = ScriptedSource::new(vec![vec![5u8; 320], vec![5u8; 320]], 16_000, 1);
        let mut aec = AecSource::new(
            Box::new(source),
            Arc::clone(&buf),
            AecMode::Gate,
            Box::new(NoopEchoCanceller),
        );

        buf.write(&vec![1u8; 640 * 10]); // 200ms of reference
        let gated = aec.read().await.unwrap();
        assert_eq!(gated, vec![0u8; 320]);

        std::thread::sleep(Duration::from_millis(130));
        let open = aec.read().await.unwrap();
        assert_eq!(open, vec![5u8; 320]);
    }

    #[tokio::test]
    async fn cancel_mode_with_noop_is_passthrough() {
        let config = AecConfig {
            mode: "cancel".into(),
            ..test_config()
        };
        let buf = ref_buf(&config);
        // 640-byte frame plus an 88-byte remainder.
        let source = ScriptedSource::new(vec![vec![3u8; 728]], 16_000, 1);
        let mut aec = AecSource::new(
            Box::new(source),
            buf,
            AecMode::Cancel,
            Box::new(NoopEchoCanceller),
        );
        let out = aec.read().await.unwrap();
        assert_eq!(out, vec![3u8; 728]);
    }

    struct WrongLengthCanceller;

    impl EchoCanceller for WrongLengthCanceller {
        fn process(&mut self, _near: &[u8], _far: &[u8]) -> Result<Vec<u8>> {
            Ok(vec![0; 3])
        }
    }

    #[tokio::test]
    async fn wrong_length_canceller_falls_back_to_near_end() {
        let buf = ref_buf(&test_config());
        let source = ScriptedSource::new(vec![vec![4u8; 640]], 16_000, 1);
        let mut aec = AecSource::new(
            Box::new(source),
            buf,
            AecMode::Cancel,
            Box::new(WrongLengthCanceller),
        );
        let out = aec.read().await.unwrap();
        assert_eq!(out, vec![4u8; 640]);
    }
}
