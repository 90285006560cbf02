//! Input pipe: audio source → VAD → streaming recognizer.
//!
//! A single reader task pulls frames from the [`AudioSource`], computes RMS
//! energy for voice-activity detection, and forwards every frame to the
//! [`Recognizer`]. Transcripts and user-speaking signals are dispatched
//! upward through callbacks installed before [`InPipe::start`].

use crate::asr::{Recognizer, TranscriptEvent};
use crate::audio::pcm::rms_of_bytes;
use crate::audio::source::AudioSource;
use crate::config::InPipeConfig;
use crate::error::{Result, VoiceError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Input pipe lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InPipeState {
    Idle,
    Listening,
    Stopping,
}

/// Callback fired when the VAD detects user speech.
pub type UserSpeakingCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback fired for every recognition result.
pub type TranscriptCallback = Arc<dyn Fn(TranscriptEvent) + Send + Sync>;

/// Owns the audio source and drives the recognizer.
pub struct InPipe {
    config: InPipeConfig,
    source: Mutex<Option<Box<dyn AudioSource>>>,
    recognizer: Arc<dyn Recognizer>,
    state: Arc<Mutex<InPipeState>>,
    on_user_speaking: Mutex<Option<UserSpeakingCallback>>,
    cancel: Mutex<Option<CancellationToken>>,
    reader: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InPipe {
    pub fn new(
        config: &InPipeConfig,
        source: Box<dyn AudioSource>,
        recognizer: Arc<dyn Recognizer>,
    ) -> Self {
        Self {
            config: config.clone(),
            source: Mutex::new(Some(source)),
            recognizer,
            state: Arc::new(Mutex::new(InPipeState::Idle)),
            on_user_speaking: Mutex::new(None),
            cancel: Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
        }
    }

    /// Install the user-speaking callback. Call before `start`.
    pub fn set_on_user_speaking(&self, callback: UserSpeakingCallback) {
        if let Ok(mut slot) = self.on_user_speaking.lock() {
            *slot = Some(callback);
        }
    }

    /// Install the transcript callback. Call before `start`.
    pub fn set_on_transcript(&self, callback: TranscriptCallback) {
        self.recognizer.on_result(Box::new(move |event| callback(event)));
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InPipeState {
        self.state.lock().map(|s| *s).unwrap_or(InPipeState::Idle)
    }

    /// Start the recognizer and the reader loop. Legal only from `Idle`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when not idle, or the recognizer's start
    /// error.
    pub async fn start(&self) -> Result<()> {
        {
            let Ok(mut state) = self.state.lock() else {
                return Err(VoiceError::Pipeline("state lock poisoned".into()));
            };
            if *state != InPipeState::Idle {
                return Err(VoiceError::InvalidState(format!(
                    "input pipe cannot start from {:?}",
                    *state
                )));
            }
            *state = InPipeState::Listening;
        }

        if let Err(e) = self.recognizer.start().await {
            if let Ok(mut state) = self.state.lock() {
                *state = InPipeState::Idle;
            }
            return Err(e);
        }

        let source = self.source.lock().ok().and_then(|mut s| s.take());
        let Some(source) = source else {
            if let Ok(mut state) = self.state.lock() {
                *state = InPipeState::Idle;
            }
            return Err(VoiceError::InvalidState("input pipe already consumed its source".into()));
        };

        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = Some(cancel.clone());
        }

        let loop_ctx = ReaderContext {
            config: self.config.clone(),
            recognizer: Arc::clone(&self.recognizer),
            state: Arc::clone(&self.state),
            on_user_speaking: self.on_user_speaking.lock().ok().and_then(|s| s.clone()),
            cancel,
        };
        let handle = tokio::spawn(run_reader_loop(source, loop_ctx));
        *self.reader.lock().await = Some(handle);

        info!("input pipe listening");
        Ok(())
    }

    /// Stop the pipe: cancel the loop, close the source and recognizer,
    /// wait for the reader. Idempotent; a no-op from `Idle`.
    pub async fn stop(&self) {
        {
            let Ok(mut state) = self.state.lock() else { return };
            match *state {
                InPipeState::Idle => return,
                InPipeState::Stopping => {}
                InPipeState::Listening => *state = InPipeState::Stopping,
            }
        }

        // Cancelling unblocks the reader loop, which closes the source on
        // its way out.
        if let Ok(mut slot) = self.cancel.lock()
            && let Some(cancel) = slot.take()
        {
            cancel.cancel();
        }

        let _ = self.recognizer.finish().await;
        let _ = self.recognizer.close().await;

        let handle = self.reader.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if let Ok(mut state) = self.state.lock() {
            *state = InPipeState::Idle;
        }
        info!("input pipe stopped");
    }
}

struct ReaderContext {
    config: InPipeConfig,
    recognizer: Arc<dyn Recognizer>,
    state: Arc<Mutex<InPipeState>>,
    on_user_speaking: Option<UserSpeakingCallback>,
    cancel: CancellationToken,
}

/// Pump frames until EOF, cancellation, or a hard send error.
async fn run_reader_loop(mut source: Box<dyn AudioSource>, ctx: ReaderContext) {
    let min_interval = Duration::from_millis(ctx.config.vad_min_interval_ms);
    let mut last_speech_event: Option<Instant> = None;

    loop {
        let frame = tokio::select! {
            () = ctx.cancel.cancelled() => break,
            frame = source.read() => frame,
        };
        let frame = match frame {
            Ok(f) => f,
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                warn!("audio source error: {e}");
                break;
            }
        };
        if frame.is_empty() {
            debug!("audio source EOF");
            break;
        }

        // Only forward while listening; a pipe mid-stop drops frames.
        let listening = ctx
            .state
            .lock()
            .map(|s| *s == InPipeState::Listening)
            .unwrap_or(false);
        if !listening {
            continue;
        }

        if ctx.config.enable_vad {
            let rms = rms_of_bytes(&frame);
            if rms >= ctx.config.vad_threshold {
                let due = match last_speech_event {
                    Some(t) => t.elapsed() >= min_interval,
                    None => true,
                };
                if due {
                    last_speech_event = Some(Instant::now());
                    if let Some(ref callback) = ctx.on_user_speaking {
                        callback();
                    }
                }
            }
        }

        if let Err(e) = ctx.recognizer.send_audio(&frame).await {
            if ctx.cancel.is_cancelled() || e.is_cancelled() {
                // Stopping; a late send error is expected.
                break;
            }
            warn!("recognizer send failed: {e}");
            break;
        }
    }

    source.close();
}
