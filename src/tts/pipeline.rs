//! Ordered TTS pipeline.
//!
//! Bounds concurrent synthesis with a semaphore while guaranteeing that
//! playback order equals enqueue order, and provides O(1) interruption.
//!
//! # Structure
//!
//! ```text
//! EnqueueText ─► text queue ─► dispatcher ─► workers (≤ max_concurrent_tts)
//!                                               │ notify_seq_completed
//!                                               ▼
//!                                          pending map ─► ordered buffer ─► player ─► mixer
//! ```
//!
//! Sequence numbers are assigned on enqueue. Workers finish in arbitrary
//! order and park results in the pending map; contiguous runs starting at
//! `next_play_seq` are released to the ordered buffer, so a slow generation
//! holds back later sentences and a failed one is skipped without stalling
//! them. The single player task feeds the mixer one item at a time.

use crate::audio::mixer::AudioMixer;
use crate::audio::stream::{EofNotifyReader, PcmStream, ReferenceSink, SharedPcm, TeeReader, shared};
use crate::config::TtsPipelineConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Wall-clock limit for one sentence's synthesis (start + write + close).
const SENTENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// One sentence → one PCM stream at the mixer rate.
///
/// Implemented by the output pipe, which resolves the voice for the emotion
/// and wraps the provider stream with rate adaptation.
#[async_trait]
pub trait SentenceSynth: Send + Sync {
    async fn synth(&self, text: &str, emotion: &str) -> Result<Box<dyn PcmStream>>;
}

/// Callback invoked after each item finishes playback.
pub type PlaybackCallback = Arc<dyn Fn() + Send + Sync>;

/// Observable pipeline counters. Never a control input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TtsPipelineStats {
    pub text_queue_size: usize,
    pub tts_buffer_size: usize,
    pub is_playing: bool,
    pub total_enqueued: u64,
    pub total_played: u64,
    pub total_interrupts: u64,
}

#[derive(Default)]
struct StatsInner {
    text_queue_size: AtomicUsize,
    tts_buffer_size: AtomicUsize,
    is_playing: AtomicBool,
    total_enqueued: AtomicU64,
    total_played: AtomicU64,
    total_interrupts: AtomicU64,
}

struct TextJob {
    seq: u64,
    text: String,
    emotion: String,
}

struct TtsItem {
    seq: u64,
    reader: Box<dyn PcmStream>,
}

struct PendingMap {
    items: HashMap<u64, Option<TtsItem>>,
    next_play_seq: u64,
    ordered_tx: mpsc::Sender<TtsItem>,
}

/// Per-generation runtime state, replaced wholesale on interrupt.
struct Epoch {
    cancel: CancellationToken,
    text_tx: mpsc::Sender<TextJob>,
    next_seq: Arc<AtomicU64>,
    pending: Arc<tokio::sync::Mutex<PendingMap>>,
    ordered_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TtsItem>>>,
    tracker: TaskTracker,
}

struct Inner {
    config: TtsPipelineConfig,
    synth: Arc<dyn SentenceSynth>,
    mixer: Mutex<Option<Arc<dyn AudioMixer>>>,
    reference_sink: Mutex<Option<Arc<dyn ReferenceSink>>>,
    on_playback_finished: Mutex<Option<PlaybackCallback>>,
    /// Stream handle of the item currently installed in the mixer.
    current: Mutex<Option<SharedPcm>>,
    stats: StatsInner,
    epoch: tokio::sync::Mutex<Option<Epoch>>,
    parent_cancel: Mutex<Option<CancellationToken>>,
    /// Serializes interrupt/stop; never acquired while holding `epoch`.
    interrupt_mu: tokio::sync::Mutex<()>,
}

/// Bounded-concurrency, strictly ordered TTS pipeline.
pub struct TtsPipeline {
    inner: Arc<Inner>,
}

impl TtsPipeline {
    pub fn new(config: &TtsPipelineConfig, synth: Arc<dyn SentenceSynth>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                synth,
                mixer: Mutex::new(None),
                reference_sink: Mutex::new(None),
                on_playback_finished: Mutex::new(None),
                current: Mutex::new(None),
                stats: StatsInner::default(),
                epoch: tokio::sync::Mutex::new(None),
                parent_cancel: Mutex::new(None),
                interrupt_mu: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Install (or replace) the mixer the player feeds.
    pub fn set_mixer(&self, mixer: Arc<dyn AudioMixer>) {
        if let Ok(mut slot) = self.inner.mixer.lock() {
            *slot = Some(mixer);
        }
    }

    /// Install the AEC reference tap applied to every played stream.
    pub fn set_reference_sink(&self, sink: Arc<dyn ReferenceSink>) {
        if let Ok(mut slot) = self.inner.reference_sink.lock() {
            *slot = Some(sink);
        }
    }

    /// Install the playback-finished callback.
    pub fn set_on_playback_finished(&self, callback: PlaybackCallback) {
        if let Ok(mut slot) = self.inner.on_playback_finished.lock() {
            *slot = Some(callback);
        }
    }

    /// Start workers. Legal exactly once; `stop` ends the pipeline.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if already started.
    pub async fn start(&self, parent: CancellationToken) -> Result<()> {
        let mut epoch = self.inner.epoch.lock().await;
        if epoch.is_some() {
            return Err(VoiceError::InvalidState("tts pipeline already started".into()));
        }
        if let Ok(mut slot) = self.inner.parent_cancel.lock() {
            *slot = Some(parent.clone());
        }
        *epoch = Some(spawn_epoch(&self.inner, &parent));
        Ok(())
    }

    /// Enqueue one sentence for synthesis.
    ///
    /// Empty text is a no-op. Blocks when the text queue is full
    /// (back-pressure on the producer).
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before [`start`](Self::start), `Cancelled` when
    /// an interrupt discarded the sentence mid-enqueue.
    pub async fn enqueue_text(&self, text: &str, emotion: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let (text_tx, seq) = {
            let epoch = self.inner.epoch.lock().await;
            let Some(epoch) = epoch.as_ref() else {
                return Err(VoiceError::InvalidState("tts pipeline not started".into()));
            };
            let seq = epoch.next_seq.fetch_add(1, Ordering::SeqCst);
            (epoch.text_tx.clone(), seq)
        };

        self.inner.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.text_queue_size.fetch_add(1, Ordering::Relaxed);
        let job = TextJob {
            seq,
            text: text.to_owned(),
            emotion: emotion.to_owned(),
        };
        if text_tx.send(job).await.is_err() {
            // The epoch was torn down by an interrupt while we were blocked.
            self.inner.stats.text_queue_size.fetch_sub(1, Ordering::Relaxed);
            return Err(VoiceError::Cancelled);
        }
        Ok(())
    }

    /// Abort all in-flight work and restart workers.
    ///
    /// On return no audio from previously enqueued items will reach the
    /// mixer, every queue is empty, and the pipeline accepts fresh input.
    /// Idempotent; concurrent calls serialize.
    pub async fn interrupt(&self) {
        let _guard = self.inner.interrupt_mu.lock().await;
        let mut epoch_slot = self.inner.epoch.lock().await;
        let Some(epoch) = epoch_slot.take() else {
            return;
        };

        self.teardown_epoch(epoch).await;
        self.inner.stats.total_interrupts.fetch_add(1, Ordering::Relaxed);

        // Restart workers so the pipeline is ready for the next EnqueueText.
        let parent = self
            .inner
            .parent_cancel
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(parent) = parent
            && !parent.is_cancelled()
        {
            *epoch_slot = Some(spawn_epoch(&self.inner, &parent));
        }
    }

    /// Drain and close all resources. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.inner.interrupt_mu.lock().await;
        if let Ok(mut slot) = self.inner.parent_cancel.lock()
            && let Some(parent) = slot.take()
        {
            parent.cancel();
        }
        let mut epoch_slot = self.inner.epoch.lock().await;
        if let Some(epoch) = epoch_slot.take() {
            self.teardown_epoch(epoch).await;
        }
    }

    /// Snapshot of the internal counters.
    pub fn stats(&self) -> TtsPipelineStats {
        let s = &self.inner.stats;
        TtsPipelineStats {
            text_queue_size: s.text_queue_size.load(Ordering::Relaxed),
            tts_buffer_size: s.tts_buffer_size.load(Ordering::Relaxed),
            is_playing: s.is_playing.load(Ordering::Relaxed),
            total_enqueued: s.total_enqueued.load(Ordering::Relaxed),
            total_played: s.total_played.load(Ordering::Relaxed),
            total_interrupts: s.total_interrupts.load(Ordering::Relaxed),
        }
    }

    /// Cancel tasks, wait for them, then drain every queue.
    ///
    /// Order: close the current item (unblocking the mixer and the player),
    /// wait for all tasks (the dispatcher discards queued text on its way
    /// out), then drain the pending map and the ordered buffer. Each item
    /// is owned by exactly one location, so every reader is closed exactly
    /// once.
    async fn teardown_epoch(&self, epoch: Epoch) {
        epoch.cancel.cancel();

        // Unblock the mixer and fire the player's done signal.
        let current = self.inner.current.lock().ok().and_then(|mut c| c.take());
        if let Some(handle) = current
            && let Ok(mut stream) = handle.lock()
        {
            stream.close();
        }

        epoch.tracker.close();
        epoch.tracker.wait().await;

        let mut pending = epoch.pending.lock().await;
        for (_, entry) in pending.items.drain() {
            if let Some(mut item) = entry {
                item.reader.close();
            }
        }
        drop(pending);

        let mut ordered_rx = epoch.ordered_rx.lock().await;
        while let Ok(mut item) = ordered_rx.try_recv() {
            item.reader.close();
        }
        drop(ordered_rx);

        self.inner.stats.text_queue_size.store(0, Ordering::Relaxed);
        self.inner.stats.tts_buffer_size.store(0, Ordering::Relaxed);
        self.inner.stats.is_playing.store(false, Ordering::Relaxed);
    }
}

/// Create channels and spawn the dispatcher and player for a fresh epoch.
///
/// Sequence counters start at 1.
fn spawn_epoch(inner: &Arc<Inner>, parent: &CancellationToken) -> Epoch {
    let cancel = parent.child_token();
    let (text_tx, text_rx) = mpsc::channel::<TextJob>(inner.config.text_queue_size.max(1));
    let (ordered_tx, ordered_rx) = mpsc::channel::<TtsItem>(inner.config.max_tts_buffer.max(1));
    let pending = Arc::new(tokio::sync::Mutex::new(PendingMap {
        items: HashMap::new(),
        next_play_seq: 1,
        ordered_tx,
    }));
    let ordered_rx = Arc::new(tokio::sync::Mutex::new(ordered_rx));
    let tracker = TaskTracker::new();

    tracker.spawn(run_dispatcher(
        Arc::clone(inner),
        cancel.clone(),
        text_rx,
        Arc::clone(&pending),
        tracker.clone(),
    ));
    tracker.spawn(run_player(
        Arc::clone(inner),
        cancel.clone(),
        Arc::clone(&ordered_rx),
    ));

    Epoch {
        cancel,
        text_tx,
        next_seq: Arc::new(AtomicU64::new(1)),
        pending,
        ordered_rx,
        tracker,
    }
}

/// Pulls jobs off the text queue and spawns one worker per job, gated by the
/// concurrency semaphore.
async fn run_dispatcher(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    mut text_rx: mpsc::Receiver<TextJob>,
    pending: Arc<tokio::sync::Mutex<PendingMap>>,
    tracker: TaskTracker,
) {
    let semaphore = Arc::new(Semaphore::new(inner.config.max_concurrent_tts.max(1)));

    loop {
        let job = tokio::select! {
            () = cancel.cancelled() => break,
            job = text_rx.recv() => job,
        };
        let Some(job) = job else { break };
        inner.stats.text_queue_size.fetch_sub(1, Ordering::Relaxed);

        let permit = tokio::select! {
            () = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => permit,
        };
        let Ok(permit) = permit else { break };

        tracker.spawn(run_worker(
            Arc::clone(&inner),
            cancel.clone(),
            job,
            permit,
            Arc::clone(&pending),
        ));
    }

    // Discard queued text on shutdown; there are no resources behind it.
    while text_rx.try_recv().is_ok() {
        inner.stats.text_queue_size.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Synthesize one sentence, then release contiguous completed items in order.
async fn run_worker(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    job: TextJob,
    permit: tokio::sync::OwnedSemaphorePermit,
    pending: Arc<tokio::sync::Mutex<PendingMap>>,
) {
    let synth = tokio::select! {
        () = cancel.cancelled() => None,
        result = tokio::time::timeout(SENTENCE_TIMEOUT, inner.synth.synth(&job.text, &job.emotion)) => {
            Some(result)
        }
    };

    let item = match synth {
        None => None,
        Some(Ok(Ok(reader))) => Some(TtsItem {
            seq: job.seq,
            reader,
        }),
        Some(Ok(Err(e))) => {
            if !e.is_cancelled() {
                warn!(seq = job.seq, "TTS generation failed: {e}");
            }
            None
        }
        Some(Err(_)) => {
            warn!(seq = job.seq, "TTS generation timed out");
            None
        }
    };

    notify_seq_completed(&inner, &cancel, &pending, job.seq, item).await;
    // The permit is held across the ordered-buffer handoff: a saturated
    // buffer also blocks new synthesis starts.
    drop(permit);
}

/// Record a finished (or failed) item and flush the contiguous run starting
/// at `next_play_seq` to the ordered buffer.
///
/// The pending lock is held across the buffer sends so that two workers
/// finishing back-to-back cannot reorder their releases; the send may block
/// on `max_tts_buffer` back-pressure, which is the intended memory bound.
/// Cancellation aborts a blocked send so interrupt teardown never waits on a
/// full buffer.
async fn notify_seq_completed(
    inner: &Inner,
    cancel: &CancellationToken,
    pending: &tokio::sync::Mutex<PendingMap>,
    seq: u64,
    item: Option<TtsItem>,
) {
    let mut map = pending.lock().await;
    map.items.insert(seq, item);

    loop {
        let next = map.next_play_seq;
        let Some(entry) = map.items.remove(&next) else { break };
        map.next_play_seq += 1;
        let Some(mut item) = entry else {
            // Failed item: skip without stalling later successes.
            continue;
        };
        let permit = tokio::select! {
            () = cancel.cancelled() => None,
            permit = map.ordered_tx.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => {
                inner.stats.tts_buffer_size.fetch_add(1, Ordering::Relaxed);
                permit.send(item);
            }
            None => {
                item.reader.close();
                break;
            }
        }
    }
}

/// Single consumer of the ordered buffer; feeds the mixer one item at a time.
async fn run_player(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    ordered_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TtsItem>>>,
) {
    let mut rx = ordered_rx.lock().await;

    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break,
            item = rx.recv() => item,
        };
        let Some(item) = item else { break };
        inner.stats.tts_buffer_size.fetch_sub(1, Ordering::Relaxed);
        debug!(seq = item.seq, "playing TTS item");

        // Reference tap first, then the EOF signal the player waits on.
        let reference_sink = inner.reference_sink.lock().ok().and_then(|s| s.clone());
        let reader: Box<dyn PcmStream> = match reference_sink {
            Some(sink) => Box::new(TeeReader::new(item.reader, sink)),
            None => item.reader,
        };
        let notify = EofNotifyReader::new(reader);
        let done = notify.done();
        let handle = shared(Box::new(notify));

        if let Ok(mut current) = inner.current.lock() {
            *current = Some(handle.clone());
        }
        inner.stats.is_playing.store(true, Ordering::Relaxed);

        let mixer = inner.mixer.lock().ok().and_then(|m| m.clone());
        let interrupted = match mixer {
            Some(ref mixer) => {
                mixer.on_tts_started();
                mixer.add_tts_stream(handle.clone());
                let interrupted = tokio::select! {
                    () = done.cancelled() => false,
                    () = cancel.cancelled() => true,
                };
                mixer.on_tts_finished();
                mixer.remove_tts_stream();
                interrupted
            }
            // No mixer installed: the item completes immediately.
            None => false,
        };

        if let Ok(mut stream) = handle.lock() {
            stream.close();
        }
        if let Ok(mut current) = inner.current.lock() {
            *current = None;
        }
        inner.stats.is_playing.store(false, Ordering::Relaxed);

        if interrupted {
            break;
        }

        inner.stats.total_played.fetch_add(1, Ordering::Relaxed);
        let callback = inner.on_playback_finished.lock().ok().and_then(|c| c.clone());
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::TtsPipelineConfig;
    use crate::test_utils::{DelayedSynth, RecordingMixer};
    use std::time::Duration;

    fn config() -> TtsPipelineConfig {
        TtsPipelineConfig {
            max_tts_buffer: 8,
            max_concurrent_tts: 3,
            text_queue_size: 16,
        }
    }

    async fn started_pipeline(synth: Arc<DelayedSynth>) -> (TtsPipeline, Arc<RecordingMixer>) {
        let pipeline = TtsPipeline::new(&config(), synth);
        let mixer = Arc::new(RecordingMixer::new());
        pipeline.set_mixer(Arc::clone(&mixer) as Arc<dyn AudioMixer>);
        pipeline.start(CancellationToken::new()).await.unwrap();
        (pipeline, mixer)
    }

    #[tokio::test]
    async fn enqueue_before_start_fails() {
        let pipeline = TtsPipeline::new(&config(), Arc::new(DelayedSynth::instant()));
        let err = pipeline.enqueue_text("hello", "default").await.unwrap_err();
        assert!(matches!(err, VoiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn empty_text_is_a_no_op() {
        let (pipeline, _mixer) = started_pipeline(Arc::new(DelayedSynth::instant())).await;
        pipeline.enqueue_text("", "default").await.unwrap();
        pipeline.enqueue_text("   ", "default").await.unwrap();
        assert_eq!(pipeline.stats().total_enqueued, 0);
        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn playback_order_matches_enqueue_order() {
        // First sentence is the slowest, third is mid, second instant: the
        // mixer must still see them in enqueue order.
        let synth = Arc::new(
            DelayedSynth::instant()
                .with_delay("First.", Duration::from_millis(100))
                .with_delay("Second.", Duration::from_millis(10))
                .with_delay("Third.", Duration::from_millis(50)),
        );
        let (pipeline, mixer) = started_pipeline(Arc::clone(&synth)).await;

        pipeline.enqueue_text("First.", "default").await.unwrap();
        pipeline.enqueue_text("Second.", "default").await.unwrap();
        pipeline.enqueue_text("Third.", "default").await.unwrap();

        mixer.wait_for_played(3, Duration::from_secs(5)).await;
        assert_eq!(mixer.played_texts(), vec!["First.", "Second.", "Third."]);
        // All three generations ran concurrently, whatever order they started.
        assert_eq!(synth.started.lock().unwrap().len(), 3);

        let stats = pipeline.stats();
        assert_eq!(stats.total_enqueued, 3);
        assert_eq!(stats.total_played, 3);
        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_item_does_not_stall_later_ones() {
        let synth = Arc::new(
            DelayedSynth::instant()
                .with_failure("Second.")
                .with_delay("First.", Duration::from_millis(20)),
        );
        let (pipeline, mixer) = started_pipeline(synth).await;

        pipeline.enqueue_text("First.", "default").await.unwrap();
        pipeline.enqueue_text("Second.", "default").await.unwrap();
        pipeline.enqueue_text("Third.", "default").await.unwrap();

        mixer.wait_for_played(2, Duration::from_secs(5)).await;
        assert_eq!(mixer.played_texts(), vec!["First.", "Third."]);
        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interrupt_then_fresh_sentence_plays_next() {
        let synth = Arc::new(
            DelayedSynth::instant().with_delay("Slow one.", Duration::from_millis(300)),
        );
        let (pipeline, mixer) = started_pipeline(Arc::clone(&synth)).await;

        pipeline.enqueue_text("Slow one.", "default").await.unwrap();
        pipeline.enqueue_text("Queued.", "default").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pipeline.interrupt().await;
        let stats = pipeline.stats();
        assert_eq!(stats.text_queue_size, 0);
        assert_eq!(stats.tts_buffer_size, 0);
        assert_eq!(stats.total_interrupts, 1);

        pipeline.enqueue_text("Fresh.", "default").await.unwrap();
        mixer.wait_for_played(1, Duration::from_secs(5)).await;
        assert_eq!(mixer.played_texts(), vec!["Fresh."]);
        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interrupt_is_idempotent() {
        let (pipeline, _mixer) = started_pipeline(Arc::new(DelayedSynth::instant())).await;
        pipeline.interrupt().await;
        pipeline.interrupt().await;
        assert_eq!(pipeline.stats().total_interrupts, 2);
        // Still accepts work afterwards.
        pipeline.enqueue_text("Hello.", "default").await.unwrap();
        pipeline.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn playback_finished_callback_fires_per_item() {
        let (pipeline, mixer) = started_pipeline(Arc::new(DelayedSynth::instant())).await;
        let count = Arc::new(AtomicU64::new(0));
        let cb_count = Arc::clone(&count);
        pipeline.set_on_playback_finished(Arc::new(move || {
            cb_count.fetch_add(1, Ordering::Relaxed);
        }));

        pipeline.enqueue_text("One.", "default").await.unwrap();
        pipeline.enqueue_text("Two.", "default").await.unwrap();
        mixer.wait_for_played(2, Duration::from_secs(5)).await;
        // The callback fires after the mixer consumed each item.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::Relaxed), 2);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn stop_from_idle_returns_cleanly() {
        let pipeline = TtsPipeline::new(&config(), Arc::new(DelayedSynth::instant()));
        pipeline.stop().await;
    }
}
