//! Stereo output mixer.
//!
//! Continuously renders stereo PCM at the system rate, summing a TTS channel
//! and a resource channel with per-channel volume. While the bot is speaking
//! the resource channel is side-chain ducked to half its configured volume.
//!
//! The audio callback never blocks on application logic: collaborator
//! references and volumes are snapshotted under a brief lock and stream
//! reads are best-effort (`WouldBlock` renders as silence).

use crate::audio::pcm::{clip, i16_to_f32};
use crate::audio::stream::SharedPcm;
use crate::config::MixerConfig;
use crate::error::{Result, VoiceError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::io;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Ducking factor applied to the resource channel while TTS is active.
const DUCK_FACTOR: f32 = 0.5;

/// Render callback: fills the left and right output planes.
pub type RenderFn = Box<dyn FnMut(&mut [f32], &mut [f32]) + Send>;

/// A stereo PCM sink with a pull-based render callback.
pub trait OutputBackend: Send {
    /// Launch the output stream; `render` is invoked for every buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be created.
    fn start(&mut self, render: RenderFn) -> Result<()>;

    /// Stop and close the stream. Idempotent.
    fn stop(&mut self);
}

/// Mixer-facing contract used by the TTS pipeline and the output pipe.
pub trait AudioMixer: Send + Sync {
    /// TTS playback is about to start; duck the resource channel.
    fn on_tts_started(&self);
    /// TTS playback finished; restore the resource volume.
    fn on_tts_finished(&self);
    /// Install (or replace) the TTS stream.
    fn add_tts_stream(&self, stream: SharedPcm);
    /// Remove the TTS stream.
    fn remove_tts_stream(&self);
    /// Install (or replace) the resource stream.
    fn add_resource_stream(&self, stream: SharedPcm);
    /// Remove the resource stream.
    fn remove_resource_stream(&self);
}

struct MixerState {
    tts: Option<SharedPcm>,
    resource: Option<SharedPcm>,
    tts_volume: f32,
    resource_volume: f32,
    /// Unducked resource volume to restore after TTS ends.
    resource_base: f32,
}

/// Two-channel mixer feeding an [`OutputBackend`].
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
    backend: Mutex<Option<Box<dyn OutputBackend>>>,
}

impl Mixer {
    /// Create a mixer. Does not touch any audio backend; see [`Mixer::start`].
    pub fn new(config: &MixerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState {
                tts: None,
                resource: None,
                tts_volume: config.tts_volume,
                resource_volume: config.resource_volume,
                resource_base: config.resource_volume,
            })),
            backend: Mutex::new(None),
        }
    }

    /// Launch the given backend with this mixer's render callback.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend stream cannot be created or the mixer
    /// is already started.
    pub fn start(&self, mut backend: Box<dyn OutputBackend>) -> Result<()> {
        let Ok(mut slot) = self.backend.lock() else {
            return Err(VoiceError::Audio("mixer backend lock poisoned".into()));
        };
        if slot.is_some() {
            return Err(VoiceError::InvalidState("mixer already started".into()));
        }
        let state = Arc::clone(&self.state);
        let mut scratch = Vec::new();
        backend.start(Box::new(move |left, right| {
            render_frame(&state, left, right, &mut scratch);
        }))?;
        *slot = Some(backend);
        Ok(())
    }

    /// Stop the backend stream. Idempotent.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.backend.lock()
            && let Some(mut backend) = slot.take()
        {
            backend.stop();
        }
    }

    /// Set the TTS channel volume.
    pub fn set_tts_volume(&self, volume: f32) {
        if let Ok(mut s) = self.state.lock() {
            s.tts_volume = volume;
        }
    }

    /// Set the unducked resource channel volume.
    pub fn set_resource_volume(&self, volume: f32) {
        if let Ok(mut s) = self.state.lock() {
            s.resource_base = volume;
            s.resource_volume = volume;
        }
    }
}

impl AudioMixer for Mixer {
    fn on_tts_started(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.resource_volume = s.resource_base * DUCK_FACTOR;
        }
    }

    fn on_tts_finished(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.resource_volume = s.resource_base;
        }
    }

    fn add_tts_stream(&self, stream: SharedPcm) {
        if let Ok(mut s) = self.state.lock() {
            s.tts = Some(stream);
        }
    }

    fn remove_tts_stream(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.tts = None;
        }
    }

    fn add_resource_stream(&self, stream: SharedPcm) {
        if let Ok(mut s) = self.state.lock() {
            s.resource = Some(stream);
        }
    }

    fn remove_resource_stream(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.resource = None;
        }
    }
}

/// Fill one stereo buffer from the mixer state.
fn render_frame(
    state: &Arc<Mutex<MixerState>>,
    left: &mut [f32],
    right: &mut [f32],
    scratch: &mut Vec<u8>,
) {
    left.fill(0.0);
    right.fill(0.0);

    // Snapshot under a brief lock; reads happen outside it.
    let (tts, resource, tts_vol, res_vol) = {
        let Ok(s) = state.lock() else { return };
        (
            s.tts.clone(),
            s.resource.clone(),
            s.tts_volume,
            s.resource_volume,
        )
    };

    if let Some(stream) = tts {
        accumulate(&stream, left, right, tts_vol, scratch);
    }
    if let Some(stream) = resource {
        accumulate(&stream, left, right, res_vol, scratch);
    }

    for s in left.iter_mut() {
        *s = clip(*s);
    }
    for s in right.iter_mut() {
        *s = clip(*s);
    }
}

/// Best-effort read of one mono i16 frame, accumulated into both planes.
fn accumulate(
    stream: &SharedPcm,
    left: &mut [f32],
    right: &mut [f32],
    volume: f32,
    scratch: &mut Vec<u8>,
) {
    let want = left.len() * 2;
    scratch.resize(want, 0);
    let n = {
        let Ok(mut s) = stream.lock() else { return };
        match s.read(&mut scratch[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(_) => 0,
        }
    };
    for (i, b) in scratch[..n].chunks_exact(2).enumerate() {
        let sample = i16_to_f32(i16::from_le_bytes([b[0], b[1]])) * volume;
        left[i] += sample;
        right[i] += sample;
    }
}

/// cpal-backed stereo output stream.
///
/// A dedicated thread owns the cpal stream (cpal streams are not `Send` on
/// every platform) and lives until [`OutputBackend::stop`].
pub struct CpalBackend {
    sample_rate: u32,
    output_device: Option<String>,
    cancel: Option<CancellationToken>,
}

impl CpalBackend {
    pub fn new(sample_rate: u32, output_device: Option<String>) -> Self {
        Self {
            sample_rate,
            output_device,
            cancel: None,
        }
    }
}

impl OutputBackend for CpalBackend {
    fn start(&mut self, mut render: RenderFn) -> Result<()> {
        if self.cancel.is_some() {
            return Err(VoiceError::InvalidState("output backend already started".into()));
        }
        let host = cpal::default_host();
        let device = if let Some(ref name) = self.output_device {
            host.output_devices()
                .map_err(|e| VoiceError::Audio(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| VoiceError::Audio(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| VoiceError::Audio("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        let stream_config = StreamConfig {
            channels: 2,
            sample_rate: self.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let cancel = CancellationToken::new();
        let thread_cancel = cancel.clone();

        std::thread::Builder::new()
            .name("aria-output".into())
            .spawn(move || {
                let mut left = Vec::new();
                let mut right = Vec::new();
                let stream = device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / 2;
                        left.resize(frames, 0.0);
                        right.resize(frames, 0.0);
                        render(&mut left, &mut right);
                        for (i, frame) in data.chunks_exact_mut(2).enumerate() {
                            frame[0] = left[i];
                            frame[1] = right[i];
                        }
                    },
                    move |err| {
                        error!("audio output stream error: {err}");
                    },
                    None,
                );

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        error!("failed to build output stream: {e}");
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    error!("failed to start output stream: {e}");
                    return;
                }

                while !thread_cancel.is_cancelled() {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                drop(stream);
                info!("audio output stopped");
            })
            .map_err(|e| VoiceError::Audio(format!("failed to spawn output thread: {e}")))?;

        self.cancel = Some(cancel);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::pcm::i16_to_bytes;
    use crate::audio::stream::{MemoryStream, shared};
    use crate::config::MixerConfig;

    fn mixer() -> Mixer {
        Mixer::new(&MixerConfig {
            tts_volume: 1.0,
            resource_volume: 0.8,
            sample_rate: 16_000,
            channels: 2,
        })
    }

    fn render(m: &Mixer, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        let mut scratch = Vec::new();
        render_frame(&m.state, &mut left, &mut right, &mut scratch);
        (left, right)
    }

    #[test]
    fn silence_when_no_streams() {
        let m = mixer();
        let (left, right) = render(&m, 8);
        assert!(left.iter().all(|&s| s == 0.0));
        assert!(right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn tts_stream_reaches_both_channels() {
        let m = mixer();
        let samples = vec![16_384i16; 8]; // 0.5 in f32
        m.add_tts_stream(shared(Box::new(MemoryStream::new(i16_to_bytes(&samples)))));
        let (left, right) = render(&m, 8);
        for i in 0..8 {
            assert!((left[i] - 0.5).abs() < 1e-3);
            assert!((right[i] - 0.5).abs() < 1e-3);
        }
    }

    #[test]
    fn channels_sum_and_clip() {
        let m = mixer();
        m.set_resource_volume(1.0);
        let loud = vec![i16::MAX; 8];
        m.add_tts_stream(shared(Box::new(MemoryStream::new(i16_to_bytes(&loud)))));
        m.add_resource_stream(shared(Box::new(MemoryStream::new(i16_to_bytes(&loud)))));
        let (left, _right) = render(&m, 8);
        for s in left {
            assert!(s <= 1.0);
        }
    }

    #[test]
    fn ducking_halves_resource_volume() {
        let m = mixer();
        m.on_tts_started();
        let samples = vec![16_384i16; 4];
        m.add_resource_stream(shared(Box::new(MemoryStream::new(i16_to_bytes(&samples)))));
        let (left, _) = render(&m, 4);
        // 0.5 sample * 0.8 resource volume * 0.5 duck = 0.2
        assert!((left[0] - 0.2).abs() < 1e-3, "left[0] = {}", left[0]);

        m.on_tts_finished();
        let samples = vec![16_384i16; 4];
        m.add_resource_stream(shared(Box::new(MemoryStream::new(i16_to_bytes(&samples)))));
        let (left, _) = render(&m, 4);
        assert!((left[0] - 0.4).abs() < 1e-3, "left[0] = {}", left[0]);
    }

    #[test]
    fn add_replaces_existing_stream() {
        let m = mixer();
        m.add_tts_stream(shared(Box::new(MemoryStream::new(i16_to_bytes(&[100i16; 4])))));
        m.add_tts_stream(shared(Box::new(MemoryStream::new(i16_to_bytes(&[16_384i16; 4])))));
        let (left, _) = render(&m, 4);
        assert!((left[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn remove_silences_channel() {
        let m = mixer();
        m.add_tts_stream(shared(Box::new(MemoryStream::new(i16_to_bytes(&[16_384i16; 4])))));
        m.remove_tts_stream();
        let (left, _) = render(&m, 4);
        assert!(left.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn stop_without_start_is_clean() {
        let m = mixer();
        m.stop();
        m.stop();
    }
}
