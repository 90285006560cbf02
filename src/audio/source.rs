//! Microphone audio capture.
//!
//! [`AudioSource`] is the capture contract consumed by the input pipe;
//! [`CpalSource`] implements it over the system microphone, capturing at the
//! device's native configuration. Captured audio is folded to mono i16 and
//! run through [`LinearResampler`] to reach the pipeline rate.

use crate::audio::pcm::{f32_to_i16, i16_to_bytes};
use crate::audio::resample::LinearResampler;
use crate::config::InPipeConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Producer of 16-bit LE PCM frames.
#[async_trait]
pub trait AudioSource: Send {
    /// Read the next PCM frame.
    ///
    /// Returns an empty buffer at end of stream (after [`close`]), and
    /// [`VoiceError::Cancelled`] when the surrounding context is cancelled.
    ///
    /// [`close`]: AudioSource::close
    async fn read(&mut self) -> Result<Vec<u8>>;

    /// Stop the source and unblock any pending read. Idempotent.
    fn close(&self);

    /// Sample rate of produced frames.
    fn sample_rate(&self) -> u32;

    /// Channel count of produced frames.
    fn channels(&self) -> u16;
}

/// Audio capture from the system microphone via cpal.
///
/// A dedicated thread owns the cpal stream and pushes fixed-size frames into
/// a bounded channel; `read` pulls from that channel. Frames are dropped
/// (and counted) rather than blocking the audio callback when the pipeline
/// falls behind.
pub struct CpalSource {
    rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    sample_rate: u32,
    channels: u16,
}

impl CpalSource {
    /// Open the configured (or default) input device and start capturing.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available or the stream cannot
    /// be built.
    pub fn open(config: &InPipeConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.input_device {
            let requested = host
                .input_devices()
                .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| match d.description() {
                    Ok(desc) => desc.name() == name,
                    Err(_) => false,
                });
            match requested {
                Some(device) => device,
                None => {
                    warn!("input device '{name}' not found, falling back to default");
                    host.default_input_device()
                        .ok_or_else(|| VoiceError::Audio("no default input device".into()))?
                }
            }
        } else {
            host.default_input_device()
                .ok_or_else(|| VoiceError::Audio("no default input device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| VoiceError::Audio(format!("no default input config: {e}")))?;
        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();

        let target_rate = config.sample_rate;
        let chunk_samples = (config.buffer_size as usize).max(1);
        if native_rate != target_rate {
            info!("will resample from {native_rate}Hz to {target_rate}Hz");
        }
        let resampler = LinearResampler::new(native_rate, target_rate, 1)?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(if config.high_latency { 64 } else { 16 });
        let cancel = CancellationToken::new();
        let thread_cancel = cancel.clone();

        std::thread::Builder::new()
            .name("aria-capture".into())
            .spawn(move || {
                run_capture_thread(
                    &device,
                    native_rate,
                    native_channels,
                    target_rate,
                    chunk_samples,
                    resampler,
                    tx,
                    thread_cancel,
                );
            })
            .map_err(|e| VoiceError::Audio(format!("failed to spawn capture thread: {e}")))?;

        Ok(Self {
            rx,
            cancel,
            sample_rate: target_rate,
            channels: 1,
        })
    }
}

#[async_trait]
impl AudioSource for CpalSource {
    async fn read(&mut self) -> Result<Vec<u8>> {
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            // Sender dropped: the capture thread exited after close().
            None => Ok(Vec::new()),
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

fn run_capture_thread(
    device: &cpal::Device,
    native_rate: u32,
    native_channels: u16,
    target_rate: u32,
    chunk_samples: usize,
    resampler: LinearResampler,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: VecDeque<i16> = VecDeque::with_capacity(chunk_samples * 4);
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_cb = Arc::clone(&dropped);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _info: &cpal::InputCallbackInfo| {
            let mono = fold_to_mono(data, native_channels as usize);
            pending.extend(resampler.process(&mono));

            // Emit fixed-size frames so downstream timing stays consistent.
            while pending.len() >= chunk_samples {
                let frame: Vec<i16> = pending.drain(..chunk_samples).collect();
                if tx.try_send(i16_to_bytes(&frame)).is_err() {
                    dropped_cb.fetch_add(1, Ordering::Relaxed);
                }
            }
        },
        move |err| {
            error!("audio input stream error: {err}");
        },
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            error!("failed to build input stream: {e}");
            return;
        }
    };
    if let Err(e) = stream.play() {
        error!("failed to start input stream: {e}");
        return;
    }

    info!("audio capture started: native {native_rate}Hz -> target {target_rate}Hz");

    // Hold the stream alive until cancelled.
    while !cancel.is_cancelled() {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    let n = dropped.load(Ordering::Relaxed);
    if n > 0 {
        debug!("capture dropped {n} frames while pipeline was busy");
    }
    drop(stream);
    info!("audio capture stopped");
}

/// Fold interleaved f32 frames down to mono i16, averaging the channels.
fn fold_to_mono(data: &[f32], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.iter().copied().map(f32_to_i16).collect();
    }
    data.chunks_exact(channels)
        .map(|frame| f32_to_i16(frame.iter().sum::<f32>() / channels as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn mono_input_converts_in_place() {
        let out = fold_to_mono(&[0.5, -0.5], 1);
        assert_eq!(out, vec![16_384, -16_384]);
    }

    #[test]
    fn stereo_frames_average_to_one_sample() {
        // (1.0 + 0.0) / 2 and (0.5 + 0.5) / 2 both come out at 0.5.
        let out = fold_to_mono(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(out, vec![16_384, 16_384]);
    }

    #[test]
    fn hot_samples_clip_instead_of_wrapping() {
        let out = fold_to_mono(&[2.0, 2.0], 2);
        assert_eq!(out, vec![i16::MAX]);
    }

    #[test]
    fn capture_chain_hits_target_rate() {
        // 480 samples at 48kHz through the pipeline resampler -> 160 at 16kHz.
        let resampler = LinearResampler::new(48_000, 16_000, 1).unwrap();
        let mono = fold_to_mono(&vec![0.25; 480], 1);
        assert_eq!(resampler.process(&mono).len(), 160);
    }
}
