//! Configuration types for the voice assistant.
//!
//! Every key is optional in the TOML file; missing keys take the defaults
//! below. A handful of environment variables override the file at startup
//! (log level/format and provider API keys) so secrets can stay out of
//! configuration files.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log verbosity and encoding.
    pub logging: LoggingConfig,
    /// Chat model endpoint for the agent.
    pub llm: LlmConfig,
    /// Speech recognizer endpoint.
    pub asr: AsrConfig,
    /// Synthesizer defaults and per-emotion voice overrides.
    pub tts: TtsConfig,
    /// Agent behavior (system prompt, sentence segmentation).
    pub agent: AgentConfig,
    /// Audio path configuration.
    pub audio: AudioConfig,
    /// Tool routing and spoken-acknowledgement templates.
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from a TOML file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VoiceError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Self = toml::from_str(&text)
            .map_err(|e| VoiceError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.apply_env();
        Ok(config)
    }

    /// Default config file location (`~/.config/aria/config.toml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aria")
            .join("config.toml")
    }

    /// Apply environment variable overrides.
    ///
    /// Recognized: `LOG_LEVEL`, `LOG_FORMAT`, `ARIA_LLM_API_KEY`,
    /// `ARIA_ASR_API_KEY`, `ARIA_TTS_API_KEY`.
    pub fn apply_env(&mut self) {
        if let Ok(level) = std::env::var("LOG_LEVEL")
            && !level.is_empty()
        {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT")
            && !format.is_empty()
        {
            self.logging.format = format;
        }
        if let Ok(key) = std::env::var("ARIA_LLM_API_KEY")
            && !key.is_empty()
        {
            self.llm.api_key = key;
        }
        if let Ok(key) = std::env::var("ARIA_ASR_API_KEY")
            && !key.is_empty()
        {
            self.asr.api_key = key;
        }
        if let Ok(key) = std::env::var("ARIA_TTS_API_KEY")
            && !key.is_empty()
        {
            self.tts.api_key = key;
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (e.g. `info`, `aria=debug`).
    pub level: String,
    /// Encoder: `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Chat model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API key for the provider.
    pub api_key: String,
    /// Base URL of an OpenAI-compatible endpoint.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".into(),
            model: "gpt-4o-mini".into(),
        }
    }
}

/// Speech recognizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// API key for the provider.
    pub api_key: String,
    /// Recognition model identifier.
    pub model: String,
    /// WebSocket endpoint.
    pub endpoint: String,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "streaming-asr-general".into(),
            endpoint: "wss://asr.example.com/v1/stream".into(),
        }
    }
}

/// Synthesizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// API key for the provider.
    pub api_key: String,
    /// WebSocket endpoint.
    pub endpoint: String,
    /// Synthesis model identifier.
    pub model: String,
    /// Default voice id (used when an emotion has no mapping).
    pub voice: String,
    /// Audio container/encoding requested from the provider (`pcm`).
    pub format: String,
    /// Sample rate requested from the provider.
    pub sample_rate: u32,
    /// Synthesis volume, 0–100.
    pub volume: u32,
    /// Speaking rate, percent of normal.
    pub rate: u32,
    /// Pitch, percent of normal.
    pub pitch: u32,
    /// `plain` or `ssml` input.
    pub text_type: String,
    /// Whether SSML markup may be passed through.
    pub enable_ssml: bool,
    /// Emotion tag → provider voice id. Lookup of an unknown emotion falls
    /// back to the `default` entry, then to `voice`.
    pub voice_map: HashMap<String, String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: "wss://tts.example.com/v1/stream".into(),
            model: "streaming-tts".into(),
            voice: "default-female".into(),
            format: "pcm".into(),
            sample_rate: 24_000,
            volume: 50,
            rate: 100,
            pitch: 100,
            text_type: "plain".into(),
            enable_ssml: false,
            voice_map: HashMap::new(),
        }
    }
}

/// Agent behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// System prompt for the chat model.
    pub system_prompt: String,
    /// Force a sentence cut after this many characters; `0` disables the
    /// length cut and only punctuation boundaries apply.
    pub max_sentence_runes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful voice assistant. Keep answers short and \
                            conversational; they will be spoken aloud."
                .into(),
            max_sentence_runes: 120,
        }
    }
}

/// Audio path configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output mixer.
    pub mixer: MixerConfig,
    /// Microphone input path.
    pub in_pipe: InPipeConfig,
    /// TTS pipeline shape.
    pub tts_pipeline: TtsPipelineConfig,
}

/// Mixer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// TTS channel volume.
    pub tts_volume: f32,
    /// Unducked resource channel volume.
    pub resource_volume: f32,
    /// System output sample rate in Hz.
    pub sample_rate: u32,
    /// Output channel count (stereo).
    pub channels: u16,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            tts_volume: 1.0,
            resource_volume: 1.0,
            sample_rate: 16_000,
            channels: 2,
        }
    }
}

/// Input pipe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InPipeConfig {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Capture channel count.
    pub channels: u16,
    /// Whether energy-based VAD runs on captured frames.
    pub enable_vad: bool,
    /// RMS threshold for speech detection (f32 samples in [-1, 1]).
    pub vad_threshold: f32,
    /// Minimum interval between user-speaking events, in ms.
    pub vad_min_interval_ms: u64,
    /// Capture frame size in samples.
    pub buffer_size: u32,
    /// Trade latency for fewer dropped frames on slow machines.
    pub high_latency: bool,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Echo control.
    pub aec: AecConfig,
}

impl Default for InPipeConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            enable_vad: true,
            vad_threshold: 0.01,
            vad_min_interval_ms: 300,
            buffer_size: 512,
            high_latency: false,
            input_device: None,
            aec: AecConfig::default(),
        }
    }
}

/// Echo control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AecConfig {
    /// Whether echo control wraps the audio source.
    pub enable: bool,
    /// `gate` or `cancel`.
    pub mode: String,
    /// Reference frame duration in ms.
    pub frame_ms: u32,
    /// Acoustic path delay between playback and the microphone, in ms.
    pub far_end_delay_ms: u32,
    /// Window after the last reference write during which the gate holds.
    pub reference_active_window_ms: u32,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            enable: true,
            mode: "gate".into(),
            frame_ms: 20,
            far_end_delay_ms: 60,
            reference_active_window_ms: 300,
        }
    }
}

/// TTS pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsPipelineConfig {
    /// Capacity of the ordered audio buffer feeding the player.
    pub max_tts_buffer: usize,
    /// Simultaneous provider synthesis calls.
    pub max_concurrent_tts: usize,
    /// Capacity of the text queue; producers block beyond this.
    pub text_queue_size: usize,
}

impl Default for TtsPipelineConfig {
    fn default() -> Self {
        Self {
            max_tts_buffer: 8,
            max_concurrent_tts: 3,
            text_queue_size: 16,
        }
    }
}

/// Tool routing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tool name → `query` | `action`. Unknown tools default to query.
    pub types: HashMap<String, String>,
    /// Action tool name → spoken acknowledgement template
    /// (`"正在为您播放{{song}}"`).
    pub action_responses: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.audio.mixer.sample_rate, 16_000);
        assert_eq!(config.audio.in_pipe.buffer_size, 512);
        assert!(config.audio.in_pipe.enable_vad);
        assert_eq!(config.audio.tts_pipeline.max_concurrent_tts, 3);
        assert_eq!(config.audio.in_pipe.aec.mode, "gate");
    }

    #[test]
    fn partial_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[logging]
level = "debug"

[tts]
sample_rate = 48000

[tts.voice_map]
happy = "voice-a"
default = "voice-b"

[audio.in_pipe]
vad_threshold = 0.02

[tools.types]
playMusic = "action"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.tts.sample_rate, 48_000);
        assert_eq!(config.tts.voice_map.get("happy").unwrap(), "voice-a");
        assert!((config.audio.in_pipe.vad_threshold - 0.02).abs() < 1e-6);
        assert_eq!(config.tools.types.get("playMusic").unwrap(), "action");
        // Untouched sections keep defaults.
        assert_eq!(config.audio.mixer.sample_rate, 16_000);
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let err = Config::load(Path::new("/nonexistent/aria.toml")).unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }
}
