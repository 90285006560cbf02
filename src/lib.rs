//! Aria: real-time full-duplex voice assistant.
//!
//! This crate provides the concurrent orchestration pipeline for a voice
//! conversation loop: Microphone → VAD → ASR → LLM → TTS → Speaker, with
//! barge-in cancelling in-flight work within one frame period.
//!
//! # Architecture
//!
//! Five always-running subsystems glued by a dialogue orchestrator:
//! - **Input pipe**: pulls PCM frames from an [`audio::source::AudioSource`],
//!   runs energy-based VAD, and streams frames to a remote [`asr::Recognizer`]
//! - **AEC stage**: gates or cancels the loudspeaker echo using a reference
//!   tap from the output path
//! - **Voice agent**: drives a streaming [`llm::ChatModel`], segments delta
//!   text into sentences, and classifies tool calls
//! - **TTS pipeline**: bounded-concurrency synthesis with strict in-order
//!   playback and O(1) interruption
//! - **Mixer**: sums the TTS channel and a resource channel into stereo PCM,
//!   side-chain ducking the resource while the bot speaks

pub mod agent;
pub mod asr;
pub mod audio;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod trace;
pub mod tts;

#[doc(hidden)]
pub mod test_utils;

pub use config::Config;
pub use error::{Result, VoiceError};
pub use pipeline::orchestrator::Orchestrator;
pub use pipeline::state::State;
