//! Output pipe: bridges the orchestrator to the TTS pipeline and the mixer.
//!
//! Owns the voice map (per-emotion provider voices) and the synthesizer.
//! Every synthesized stream is rate-adapted to the mixer's system rate
//! before playback; the AEC reference tap is installed on the pipeline so
//! played audio is copied into the reference buffer.

use crate::audio::resample::ResamplingReader;
use crate::audio::stream::{PcmStream, ReferenceSink, shared};
use crate::audio::mixer::AudioMixer;
use crate::config::{MixerConfig, TtsConfig, TtsPipelineConfig};
use crate::error::{Result, VoiceError};
use crate::tts::pipeline::{SentenceSynth, TtsPipeline};
use crate::tts::{SynthRequest, Synthesizer};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Back-off before the single retry of a failed stream start.
const START_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Emotion-aware voice selection over the configured voice map.
///
/// Unknown emotions fall back to the `default` entry, then to the
/// configured base voice.
pub fn voice_for(config: &TtsConfig, emotion: &str) -> String {
    if let Some(voice) = config.voice_map.get(emotion) {
        return voice.clone();
    }
    if let Some(voice) = config.voice_map.get("default") {
        return voice.clone();
    }
    config.voice.clone()
}

/// TTS → mixer bridge.
pub struct OutPipe {
    pipeline: Arc<TtsPipeline>,
    mixer: Arc<dyn AudioMixer>,
}

impl OutPipe {
    pub fn new(
        tts_config: &TtsConfig,
        mixer_config: &MixerConfig,
        pipeline_config: &TtsPipelineConfig,
        synthesizer: Arc<dyn Synthesizer>,
        mixer: Arc<dyn AudioMixer>,
    ) -> Self {
        let synth = Arc::new(EmotionVoiceSynth {
            synthesizer,
            config: tts_config.clone(),
            target_rate: mixer_config.sample_rate,
        });
        let pipeline = Arc::new(TtsPipeline::new(pipeline_config, synth));
        pipeline.set_mixer(Arc::clone(&mixer));
        Self { pipeline, mixer }
    }

    /// The pipeline handle (lifecycle, stats, interrupt, callbacks).
    pub fn pipeline(&self) -> Arc<TtsPipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Install the AEC reference tap.
    pub fn set_reference_sink(&self, sink: Arc<dyn ReferenceSink>) {
        self.pipeline.set_reference_sink(sink);
    }

    /// Enqueue one sentence for speech. Empty text is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates pipeline enqueue errors (`InvalidState`, `Cancelled`).
    pub async fn play_tts(&self, text: &str, emotion: &str) -> Result<()> {
        self.pipeline.enqueue_text(text, emotion).await
    }

    /// Route a resource stream (e.g. tool audio) into the mixer.
    pub fn play_resource(&self, reader: Box<dyn PcmStream>) {
        self.mixer.add_resource_stream(shared(reader));
    }

    /// Remove any resource stream from the mixer.
    pub fn stop_resource(&self) {
        self.mixer.remove_resource_stream();
    }
}

/// [`SentenceSynth`] implementation: voice lookup, provider round-trip,
/// rate adaptation.
struct EmotionVoiceSynth {
    synthesizer: Arc<dyn Synthesizer>,
    config: TtsConfig,
    target_rate: u32,
}

#[async_trait]
impl SentenceSynth for EmotionVoiceSynth {
    async fn synth(&self, text: &str, emotion: &str) -> Result<Box<dyn PcmStream>> {
        let request = SynthRequest {
            voice: voice_for(&self.config, emotion),
            sample_rate: self.config.sample_rate,
            rate: self.config.rate,
            pitch: self.config.pitch,
            volume: self.config.volume,
        };

        // Transient start failures get one retry with a small backoff.
        let mut stream = match self.synthesizer.start(&request).await {
            Ok(stream) => stream,
            Err(first) => {
                if first.is_cancelled() {
                    return Err(first);
                }
                debug!("TTS start failed ({first}), retrying once");
                tokio::time::sleep(START_RETRY_BACKOFF).await;
                self.synthesizer
                    .start(&request)
                    .await
                    .map_err(|_| VoiceError::Tts(format!("stream start failed twice: {first}")))?
            }
        };

        stream.write_text_chunk(text).await?;
        stream.close().await?;

        let reader = stream.audio_reader();
        if stream.sample_rate() == self.target_rate {
            return Ok(reader);
        }
        let resampled = ResamplingReader::new(
            reader,
            stream.sample_rate(),
            self.target_rate,
            stream.channels() as usize,
        )?;
        Ok(Box::new(resampled))
    }
}
