//! Shared mock collaborators used across unit and integration tests.
//!
//! All mocks speak the real capability traits, so tests exercise the same
//! code paths as production wiring. Mock TTS "audio" is simply the sentence
//! text as UTF-8 bytes, which lets tests assert on playback order by
//! content.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::agent::tools::{ToolExecutor, ToolOutput};
use crate::asr::{Recognizer, TranscriptEvent, TranscriptHandler};
use crate::audio::mixer::AudioMixer;
use crate::audio::source::AudioSource;
use crate::audio::stream::{MemoryStream, PcmStream, SharedPcm};
use crate::error::{Result, VoiceError};
use crate::llm::{ChatDelta, ChatMessage, ChatModel, MessageStream};
use crate::tts::pipeline::SentenceSynth;
use crate::tts::{SynthRequest, SynthStream, Synthesizer};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Audio source ──────────────────────────────────────────────

/// Audio source that plays back a scripted list of frames.
pub struct ScriptedSource {
    frames: Mutex<VecDeque<Vec<u8>>>,
    sample_rate: u32,
    channels: u16,
    hold_open: bool,
    cancel: CancellationToken,
}

impl ScriptedSource {
    /// Yields the frames, then EOF.
    pub fn new(frames: Vec<Vec<u8>>, sample_rate: u32, channels: u16) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            sample_rate,
            channels,
            hold_open: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Yields the frames, then blocks until closed.
    pub fn hold_open(frames: Vec<Vec<u8>>, sample_rate: u32, channels: u16) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            sample_rate,
            channels,
            hold_open: true,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl AudioSource for ScriptedSource {
    async fn read(&mut self) -> Result<Vec<u8>> {
        if self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let next = self.frames.lock().unwrap().pop_front();
        match next {
            Some(frame) => Ok(frame),
            None if self.hold_open => {
                self.cancel.cancelled().await;
                Ok(Vec::new())
            }
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

// ── Recognizer ────────────────────────────────────────────────

/// Recognizer that records sent audio and lets tests inject results.
pub struct MockRecognizer {
    handler: Mutex<Option<Arc<TranscriptHandler>>>,
    sent: AtomicUsize,
    started: AtomicBool,
}

impl MockRecognizer {
    pub fn new() -> Self {
        Self {
            handler: Mutex::new(None),
            sent: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Number of audio frames received.
    pub fn sent_frames(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Fire a result through the installed handler.
    pub fn emit(&self, event: TranscriptEvent) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

impl Default for MockRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Recognizer for MockRecognizer {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(VoiceError::InvalidState("recognizer already started".into()));
        }
        Ok(())
    }

    async fn send_audio(&self, _pcm: &[u8]) -> Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn on_result(&self, handler: TranscriptHandler) {
        *self.handler.lock().unwrap() = Some(Arc::new(handler));
    }
}

// ── Chat model ────────────────────────────────────────────────

enum ScriptedOutcome {
    Deltas(Vec<ChatDelta>),
    Failure(String),
}

/// Chat model that streams scripted delta sequences, one per `stream` call.
pub struct MockChatModel {
    scripts: Mutex<VecDeque<ScriptedOutcome>>,
    delay: Duration,
    /// Inputs passed to `stream`, for asserting follow-up turns.
    pub seen_inputs: Arc<Mutex<Vec<String>>>,
}

impl MockChatModel {
    pub fn new(deltas: Vec<ChatDelta>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::from([ScriptedOutcome::Deltas(deltas)])),
            delay: Duration::ZERO,
            seen_inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Stream that yields one error and ends.
    pub fn failing(message: &str) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::from([ScriptedOutcome::Failure(
                message.to_owned(),
            )])),
            delay: Duration::ZERO,
            seen_inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Script a further turn (served by the next `stream` call).
    pub fn then(self, deltas: Vec<ChatDelta>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .push_back(ScriptedOutcome::Deltas(deltas));
        self
    }

    /// Pause between deltas.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn stream(&self, messages: &[ChatMessage]) -> Result<MessageStream> {
        if let Some(user) = messages.last() {
            self.seen_inputs.lock().unwrap().push(user.content.clone());
        }
        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedOutcome::Deltas(Vec::new()));
        let delay = self.delay;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            match outcome {
                ScriptedOutcome::Deltas(deltas) => {
                    for delta in deltas {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if tx.send(Ok(delta)).await.is_err() {
                            return;
                        }
                    }
                }
                ScriptedOutcome::Failure(message) => {
                    let _ = tx.send(Err(VoiceError::Llm(message))).await;
                }
            }
        });
        Ok(rx)
    }
}

// ── TTS ───────────────────────────────────────────────────────

/// Sentence synthesizer with per-sentence delays and failures; the produced
/// audio is the sentence text as bytes.
pub struct DelayedSynth {
    delays: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashMap<String, ()>>,
    /// Sentences in the order synthesis started.
    pub started: Arc<Mutex<Vec<String>>>,
}

impl DelayedSynth {
    pub fn instant() -> Self {
        Self {
            delays: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(self, text: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(text.to_owned(), delay);
        self
    }

    pub fn with_failure(self, text: &str) -> Self {
        self.failures.lock().unwrap().insert(text.to_owned(), ());
        self
    }
}

#[async_trait]
impl SentenceSynth for DelayedSynth {
    async fn synth(&self, text: &str, _emotion: &str) -> Result<Box<dyn PcmStream>> {
        self.started.lock().unwrap().push(text.to_owned());
        let delay = self.delays.lock().unwrap().get(text).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.lock().unwrap().contains_key(text) {
            return Err(VoiceError::Tts(format!("scripted failure for '{text}'")));
        }
        Ok(Box::new(MemoryStream::new(text.as_bytes().to_vec())))
    }
}

/// Full [`Synthesizer`] mock: collects written text, audio is that text.
pub struct MockSynthesizer {
    /// Voices requested per stream start, in order.
    pub voices: Arc<Mutex<Vec<String>>>,
    sample_rate: u32,
    /// Per-sentence artificial generation delay.
    delays: Mutex<HashMap<String, Duration>>,
    /// When set, the next `start` fails once (retry testing).
    fail_first_start: AtomicBool,
}

impl MockSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            voices: Arc::new(Mutex::new(Vec::new())),
            sample_rate,
            delays: Mutex::new(HashMap::new()),
            fail_first_start: AtomicBool::new(false),
        }
    }

    /// Delay generation of one sentence (simulates a slow provider).
    pub fn with_delay(self, text: &str, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(text.to_owned(), delay);
        self
    }

    pub fn fail_next_start(&self) {
        self.fail_first_start.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn start(&self, request: &SynthRequest) -> Result<Box<dyn SynthStream>> {
        if self.fail_first_start.swap(false, Ordering::SeqCst) {
            return Err(VoiceError::Tts("transient connect failure".into()));
        }
        self.voices.lock().unwrap().push(request.voice.clone());
        Ok(Box::new(MockSynthStream {
            written: String::new(),
            closed: false,
            sample_rate: self.sample_rate,
            delays: self.delays.lock().unwrap().clone(),
        }))
    }
}

pub struct MockSynthStream {
    written: String,
    closed: bool,
    sample_rate: u32,
    delays: HashMap<String, Duration>,
}

#[async_trait]
impl SynthStream for MockSynthStream {
    async fn write_text_chunk(&mut self, text: &str) -> Result<()> {
        if self.closed {
            return Err(VoiceError::InvalidState("stream closed".into()));
        }
        self.written.push_str(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Some(delay) = self.delays.get(&self.written) {
            tokio::time::sleep(*delay).await;
        }
        Ok(())
    }

    fn audio_reader(&self) -> Box<dyn PcmStream> {
        Box::new(MemoryStream::new(self.written.as_bytes().to_vec()))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        1
    }
}

// ── Mixer ─────────────────────────────────────────────────────

/// Mixer that drains every installed TTS stream on a helper thread and
/// records what it consumed.
pub struct RecordingMixer {
    played: Arc<Mutex<Vec<Vec<u8>>>>,
    resources: Arc<Mutex<Vec<SharedPcm>>>,
    ducked: AtomicBool,
    /// Installed-stream balance; must only ever be 0 or 1.
    installed: AtomicIsize,
    max_installed: AtomicIsize,
}

impl RecordingMixer {
    pub fn new() -> Self {
        Self {
            played: Arc::new(Mutex::new(Vec::new())),
            resources: Arc::new(Mutex::new(Vec::new())),
            ducked: AtomicBool::new(false),
            installed: AtomicIsize::new(0),
            max_installed: AtomicIsize::new(0),
        }
    }

    /// Consumed TTS payloads, in playback order.
    pub fn played(&self) -> Vec<Vec<u8>> {
        self.played.lock().unwrap().clone()
    }

    /// Consumed TTS payloads decoded as text.
    pub fn played_texts(&self) -> Vec<String> {
        self.played()
            .into_iter()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .collect()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.lock().unwrap().len()
    }

    pub fn has_resource(&self) -> bool {
        !self.resources.lock().unwrap().is_empty()
    }

    pub fn is_ducked(&self) -> bool {
        self.ducked.load(Ordering::SeqCst)
    }

    /// Highest simultaneous TTS stream count observed.
    pub fn max_installed(&self) -> isize {
        self.max_installed.load(Ordering::SeqCst)
    }

    /// Wait until `n` items were fully consumed.
    pub async fn wait_for_played(&self, n: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.played.lock().unwrap().len() >= n {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {n} played items");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for RecordingMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioMixer for RecordingMixer {
    fn on_tts_started(&self) {
        self.ducked.store(true, Ordering::SeqCst);
    }

    fn on_tts_finished(&self) {
        self.ducked.store(false, Ordering::SeqCst);
    }

    fn add_tts_stream(&self, stream: SharedPcm) {
        let installed = self.installed.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_installed.fetch_max(installed, Ordering::SeqCst);

        // Drain on a helper thread so the player's EOF signal fires the
        // same way it does with a real audio callback.
        let played = Arc::clone(&self.played);
        std::thread::spawn(move || {
            let mut collected = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                let result = stream.lock().unwrap().read(&mut buf);
                match result {
                    Ok(0) => break,
                    Ok(n) => collected.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(_) => break,
                }
            }
            if !collected.is_empty() {
                played.lock().unwrap().push(collected);
            }
        });
    }

    fn remove_tts_stream(&self) {
        self.installed.fetch_sub(1, Ordering::SeqCst);
    }

    fn add_resource_stream(&self, stream: SharedPcm) {
        self.resources.lock().unwrap().push(stream);
    }

    fn remove_resource_stream(&self) {
        self.resources.lock().unwrap().clear();
    }
}

// ── Tools ─────────────────────────────────────────────────────

/// Tool executor that records invocations and returns a canned output.
pub struct RecordingTool {
    pub calls: Arc<Mutex<Vec<Value>>>,
    text: String,
    audio: Option<Vec<u8>>,
}

impl RecordingTool {
    pub fn new(text: &str) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            text: text.to_owned(),
            audio: None,
        }
    }

    pub fn with_audio(mut self, audio: Vec<u8>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolExecutor for RecordingTool {
    async fn execute(&self, args: &Value) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(args.clone());
        Ok(ToolOutput {
            text: self.text.clone(),
            audio: self
                .audio
                .clone()
                .map(|bytes| Box::new(MemoryStream::new(bytes)) as Box<dyn PcmStream>),
        })
    }
}
