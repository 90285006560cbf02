//! Dialogue orchestrator.
//!
//! Single coordinator of a turn: owns the state machine, the event bus, the
//! agent cancellation handle and the outstanding-playback counter. Wires
//! transcripts into agent turns, agent text into the segmenter and the TTS
//! pipeline, and user speech into the barge-in protocol.

use crate::agent::segmenter::Segmenter;
use crate::agent::tools::{ToolKind, ToolRegistry};
use crate::agent::{AgentEvent, DEFAULT_EMOTION, VoiceAgent, markdown};
use crate::asr::TranscriptEvent;
use crate::error::Result;
use crate::pipeline::bus::{BusEvent, EventBus, EventHandler, EventTag};
use crate::pipeline::inpipe::InPipe;
use crate::pipeline::outpipe::OutPipe;
use crate::pipeline::state::{State, is_valid_transition};
use crate::trace;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct TurnState {
    state: State,
    turn_cancel: Option<CancellationToken>,
    outstanding_tts: usize,
    current_emotion: String,
    /// Whether an agent consumer is still producing sentences.
    agent_active: bool,
    /// Monotonic turn id; a stale consumer's finish must not clobber a
    /// newer turn (tool follow-ups start before the old consumer exits).
    turn_id: u64,
}

struct Inner {
    bus: EventBus,
    agent: Arc<VoiceAgent>,
    outpipe: Arc<OutPipe>,
    tools: Arc<ToolRegistry>,
    segmenter: Mutex<Segmenter>,
    turn: Mutex<TurnState>,
    parent_cancel: Mutex<Option<CancellationToken>>,
    /// Signalled whenever a turn's consumer finishes; query-tool follow-ups
    /// wait on this instead of cancelling a still-streaming turn.
    turn_done: tokio::sync::Notify,
}

/// Coordinator of the conversation loop.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        agent: Arc<VoiceAgent>,
        outpipe: Arc<OutPipe>,
        tools: Arc<ToolRegistry>,
        max_sentence_runes: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus: EventBus::new(),
                agent,
                outpipe,
                tools,
                segmenter: Mutex::new(Segmenter::new(max_sentence_runes)),
                turn: Mutex::new(TurnState {
                    state: State::Idle,
                    turn_cancel: None,
                    outstanding_tts: 0,
                    current_emotion: DEFAULT_EMOTION.to_owned(),
                    agent_active: false,
                    turn_id: 0,
                }),
                parent_cancel: Mutex::new(None),
                turn_done: tokio::sync::Notify::new(),
            }),
        }
    }

    /// Start the TTS pipeline and wire its playback callback.
    ///
    /// # Errors
    ///
    /// Propagates pipeline start errors.
    pub async fn start(&self, parent: CancellationToken) -> Result<()> {
        if let Ok(mut slot) = self.inner.parent_cancel.lock() {
            *slot = Some(parent.clone());
        }
        let pipeline = self.inner.outpipe.pipeline();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        pipeline.set_on_playback_finished(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                Inner::handle_playback_finished(&inner);
            }
        }));
        pipeline.start(parent.child_token()).await?;
        info!("orchestrator started");
        Ok(())
    }

    /// Stop the TTS pipeline and cancel any running turn.
    pub async fn shutdown(&self) {
        if let Ok(mut slot) = self.inner.parent_cancel.lock()
            && let Some(parent) = slot.take()
        {
            parent.cancel();
        }
        if let Ok(mut turn) = self.inner.turn.lock()
            && let Some(cancel) = turn.turn_cancel.take()
        {
            cancel.cancel();
        }
        self.inner.outpipe.pipeline().stop().await;
        info!("orchestrator stopped");
    }

    /// Wire an input pipe's callbacks into this orchestrator.
    pub fn attach_input(&self, inpipe: &InPipe) {
        let inner = Arc::clone(&self.inner);
        inpipe.set_on_user_speaking(Arc::new(move || {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                Inner::handle_user_speaking(inner).await;
            });
        }));
        let inner = Arc::clone(&self.inner);
        inpipe.set_on_transcript(Arc::new(move |event| {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                Inner::handle_transcript(inner, event).await;
            });
        }));
    }

    /// Inject a user-speaking signal (used by tests and external VADs).
    pub fn notify_user_speaking(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::handle_user_speaking(inner).await;
        });
    }

    /// Inject a transcript (used by tests and external recognizers).
    pub fn notify_transcript(&self, event: TranscriptEvent) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::handle_transcript(inner, event).await;
        });
    }

    /// Subscribe a handler on the event bus.
    pub fn subscribe(&self, tag: EventTag, handler: EventHandler) {
        self.inner.bus.subscribe(tag, handler);
    }

    /// Current dialogue state.
    pub fn state(&self) -> State {
        self.inner.turn.lock().map(|t| t.state).unwrap_or(State::Idle)
    }

    /// Number of enqueued-but-unfinished TTS items.
    pub fn outstanding_tts(&self) -> usize {
        self.inner.turn.lock().map(|t| t.outstanding_tts).unwrap_or(0)
    }
}

impl Inner {
    /// Guarded state transition. Invalid requests are logged and ignored.
    fn set_state(self: &Arc<Self>, to: State) -> bool {
        let from = {
            let Ok(mut turn) = self.turn.lock() else {
                return false;
            };
            let from = turn.state;
            if !is_valid_transition(from, to) {
                drop(turn);
                debug!("ignoring invalid transition {from} -> {to}");
                return false;
            }
            turn.state = to;
            from
        };
        info!(turn = trace::current_turn(), "state {from} -> {to}");
        self.bus.publish(BusEvent::StateChanged { from, to });
        true
    }

    async fn handle_transcript(self: Arc<Self>, event: TranscriptEvent) {
        if event.is_final {
            Self::start_turn(self, event.text, true).await;
        } else {
            // Partial transcripts double as barge-in triggers.
            Self::handle_user_speaking(self).await;
        }
    }

    async fn handle_user_speaking(self: Arc<Self>) {
        self.bus.publish(BusEvent::UserSpeaking);

        let needs_barge_in = {
            let Ok(turn) = self.turn.lock() else { return };
            matches!(turn.state, State::Speaking | State::Processing) || turn.outstanding_tts > 0
        };

        if needs_barge_in {
            Self::barge_in(&self).await;
        } else {
            let is_idle = self.turn.lock().map(|t| t.state == State::Idle).unwrap_or(false);
            if is_idle {
                self.set_state(State::Listening);
            }
            // Already listening: nothing to do.
        }
    }

    /// Barge-in protocol: every step is bounded, no long blocking work.
    async fn barge_in(self: &Arc<Self>) {
        info!(turn = trace::current_turn(), "barge-in");

        // (a) cancel the agent task context
        if let Ok(mut turn) = self.turn.lock() {
            if let Some(cancel) = turn.turn_cancel.take() {
                cancel.cancel();
            }
            turn.agent_active = false;
        }
        // (b) abort TTS: clears queues, closes the current stream
        self.outpipe.pipeline().interrupt().await;
        // (c) flush any buffered sentence fragment
        if let Ok(mut segmenter) = self.segmenter.lock() {
            segmenter.reset();
        }
        // (d) no playback is outstanding anymore
        if let Ok(mut turn) = self.turn.lock() {
            turn.outstanding_tts = 0;
        }
        // (e) silence any resource stream
        self.outpipe.stop_resource();
        self.bus.publish(BusEvent::TtsInterrupted);

        // (f) back to listening; from Processing the machine passes
        // through Idle.
        if !self.set_state(State::Listening) {
            self.set_state(State::Idle);
            self.set_state(State::Listening);
        }
    }

    /// Begin an agent turn for a final transcript (or a tool follow-up).
    ///
    /// Returns a boxed future rather than `async fn` because this function
    /// and [`Self::run_tool`] call each other (tool follow-up turns loop
    /// back through here); an opaque `impl Future` return on either side
    /// of that cycle cannot have its hidden type resolved by the compiler.
    fn start_turn(
        inner: Arc<Self>,
        input: String,
        from_user: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let text = input.trim().to_owned();
            if text.is_empty() {
                return;
            }

            let (turn_number, trace_id) = trace::begin_turn();
            info!(turn = turn_number, trace = %trace_id, "turn started: {text}");
            if from_user {
                inner.bus.publish(BusEvent::AsrFinal { text: text.clone() });
            }

            let (turn_cancel, turn_id) = {
                let Ok(mut turn) = inner.turn.lock() else { return };
                if let Some(previous) = turn.turn_cancel.take() {
                    previous.cancel();
                }
                let parent = inner
                    .parent_cancel
                    .lock()
                    .ok()
                    .and_then(|p| p.clone())
                    .unwrap_or_default();
                let cancel = parent.child_token();
                turn.turn_cancel = Some(cancel.clone());
                turn.agent_active = true;
                turn.current_emotion = DEFAULT_EMOTION.to_owned();
                turn.turn_id += 1;
                (cancel, turn.turn_id)
            };

            inner.set_state(State::Processing);
            Self::run_agent_consumer(inner, text, turn_cancel, turn_id).await;
        })
    }

    /// Consume the agent's lazy event sequence for one turn.
    async fn run_agent_consumer(
        inner: Arc<Self>,
        input: String,
        turn_cancel: CancellationToken,
        turn_id: u64,
    ) {
        let mut events: mpsc::Receiver<AgentEvent> = match inner.agent.process(&input).await {
            Ok(rx) => rx,
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(turn = trace::current_turn(), "agent start failed: {e}");
                }
                Self::finish_turn(&inner, Some(e.to_string()), turn_id);
                return;
            }
        };

        loop {
            let event = tokio::select! {
                () = turn_cancel.cancelled() => return, // barge-in cleaned up
                event = events.recv() => event,
            };
            let Some(event) = event else {
                // Stream closed without Finished; treat as a clean finish.
                Self::finish_turn(&inner, None, turn_id);
                return;
            };

            match event {
                AgentEvent::TextChunk { delta, emotion } => {
                    let sentences = match inner.segmenter.lock() {
                        Ok(mut segmenter) => segmenter.feed(&delta),
                        Err(_) => Vec::new(),
                    };
                    for sentence in sentences {
                        Self::enqueue_sentence(&inner, &sentence, &emotion).await;
                    }
                }
                AgentEvent::EmotionChanged { emotion } => {
                    if let Ok(mut turn) = inner.turn.lock() {
                        turn.current_emotion = emotion.clone();
                    }
                    inner.bus.publish(BusEvent::EmotionChanged { emotion });
                }
                AgentEvent::ToolCallRequested { name, args, kind } => {
                    inner
                        .bus
                        .publish(BusEvent::ToolCallRequested { name: name.clone() });
                    let tool_inner = Arc::clone(&inner);
                    let tool_cancel = turn_cancel.clone();
                    tokio::spawn(async move {
                        Self::run_tool(tool_inner, name, args, kind, tool_cancel, turn_id).await;
                    });
                }
                AgentEvent::Finished { error } => {
                    let tail = inner
                        .segmenter
                        .lock()
                        .ok()
                        .and_then(|mut segmenter| segmenter.flush());
                    if let Some(tail) = tail {
                        let emotion = inner
                            .turn
                            .lock()
                            .map(|t| t.current_emotion.clone())
                            .unwrap_or_else(|_| DEFAULT_EMOTION.to_owned());
                        Self::enqueue_sentence(&inner, &tail, &emotion).await;
                    }
                    Self::finish_turn(&inner, error, turn_id);
                    return;
                }
            }
        }
    }

    /// Markdown-strip and enqueue one sentence; bumps the outstanding count.
    async fn enqueue_sentence(inner: &Arc<Self>, raw: &str, emotion: &str) {
        let text = markdown::strip(raw);
        if text.trim().is_empty() {
            return;
        }
        if let Ok(mut turn) = inner.turn.lock() {
            turn.outstanding_tts += 1;
        }
        match inner.outpipe.play_tts(&text, emotion).await {
            Ok(()) => {
                let processing = inner
                    .turn
                    .lock()
                    .map(|t| t.state == State::Processing)
                    .unwrap_or(false);
                if processing {
                    inner.set_state(State::Speaking);
                }
            }
            Err(e) => {
                if let Ok(mut turn) = inner.turn.lock() {
                    turn.outstanding_tts = turn.outstanding_tts.saturating_sub(1);
                }
                if !e.is_cancelled() {
                    warn!(turn = trace::current_turn(), "TTS enqueue failed: {e}");
                }
            }
        }
    }

    /// Agent stream ended. Idle only once all playback has drained.
    ///
    /// The Idle transition happens under the same lock as the bookkeeping
    /// so a waiting follow-up turn always observes the settled state.
    fn finish_turn(inner: &Arc<Self>, error: Option<String>, turn_id: u64) {
        if let Some(ref e) = error {
            warn!(turn = trace::current_turn(), "agent turn failed: {e}");
        }
        let transition = {
            let Ok(mut turn) = inner.turn.lock() else { return };
            if turn.turn_id != turn_id {
                // A newer turn (barge-in or tool follow-up) took over.
                return;
            }
            turn.agent_active = false;
            turn.turn_cancel = None;
            // Processing → Idle (nothing was spoken) or Speaking → Idle
            // (everything already played).
            if turn.outstanding_tts == 0 && is_valid_transition(turn.state, State::Idle) {
                let from = turn.state;
                turn.state = State::Idle;
                Some(from)
            } else {
                None
            }
        };
        if let Some(from) = transition {
            inner.announce_transition(from, State::Idle);
        }
        inner.turn_done.notify_waiters();
    }

    /// Player callback: one TTS item finished playing.
    fn handle_playback_finished(inner: &Arc<Self>) {
        let transition = {
            let Ok(mut turn) = inner.turn.lock() else { return };
            turn.outstanding_tts = turn.outstanding_tts.saturating_sub(1);
            if turn.outstanding_tts == 0 && turn.state == State::Speaking && !turn.agent_active {
                turn.state = State::Idle;
                Some(State::Speaking)
            } else {
                None
            }
        };
        if let Some(from) = transition {
            inner.announce_transition(from, State::Idle);
        }
    }

    /// Log and publish a transition that was applied under the turn lock.
    fn announce_transition(&self, from: State, to: State) {
        info!(turn = trace::current_turn(), "state {from} -> {to}");
        self.bus.publish(BusEvent::StateChanged { from, to });
    }

    /// Execute one tool call; failures never abort the turn.
    async fn run_tool(
        inner: Arc<Self>,
        name: String,
        args: Value,
        kind: ToolKind,
        turn_cancel: CancellationToken,
        turn_id: u64,
    ) {
        let result = tokio::select! {
            () = turn_cancel.cancelled() => return,
            result = inner.tools.execute(&name, &args) => result,
        };
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = %name, "tool failed: {e}");
                return;
            }
        };

        if let Some(audio) = output.audio {
            inner.outpipe.play_resource(audio);
            inner.bus.publish(BusEvent::ToolAudioReady { name: name.clone() });
        }

        // Query results flow back through the model for summarization in a
        // follow-up turn; action tools already spoke their acknowledgement.
        // The originating stream keeps running alongside the tool call, so
        // the follow-up starts only once that consumer has finished.
        if kind == ToolKind::Query
            && !output.text.trim().is_empty()
            && Self::wait_for_turn_end(&inner, &turn_cancel, turn_id).await
        {
            let input = format!("Tool {name} returned: {}", output.text);
            Self::start_turn(inner, input, false).await;
        }
    }

    /// Wait until the turn identified by `turn_id` has finished streaming.
    ///
    /// Returns `false` when the turn was cancelled (barge-in) or superseded
    /// by a newer one; the caller drops its follow-up in that case.
    async fn wait_for_turn_end(
        inner: &Arc<Self>,
        turn_cancel: &CancellationToken,
        turn_id: u64,
    ) -> bool {
        loop {
            // Register for the notification before checking so a finish
            // between the check and the await is not missed.
            let notified = inner.turn_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if turn_cancel.is_cancelled() {
                return false;
            }
            {
                let Ok(turn) = inner.turn.lock() else { return false };
                if turn.turn_id != turn_id {
                    return false;
                }
                if !turn.agent_active {
                    return true;
                }
            }
            tokio::select! {
                () = turn_cancel.cancelled() => return false,
                () = &mut notified => {}
            }
        }
    }
}
