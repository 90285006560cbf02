//! End-to-end conversation scenarios over mock providers.
//!
//! Builds the real orchestrator / output pipe / TTS pipeline graph with a
//! scripted chat model, a mock synthesizer whose "audio" is the sentence
//! text, and a recording mixer, then drives it with injected transcripts.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use aria::agent::VoiceAgent;
use aria::agent::tools::ToolRegistry;
use aria::audio::mixer::AudioMixer;
use aria::config::{AgentConfig, MixerConfig, ToolsConfig, TtsConfig, TtsPipelineConfig};
use aria::llm::{ChatDelta, ToolCallData};
use aria::pipeline::bus::{BusEvent, EventTag};
use aria::pipeline::orchestrator::Orchestrator;
use aria::pipeline::outpipe::OutPipe;
use aria::pipeline::state::{State, is_valid_transition};
use aria::asr::TranscriptEvent;
use aria::test_utils::{MockChatModel, MockSynthesizer, RecordingMixer, RecordingTool};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIXER_RATE: u32 = 16_000;

struct Harness {
    orchestrator: Orchestrator,
    mixer: Arc<RecordingMixer>,
    synth: Arc<MockSynthesizer>,
    transitions: Arc<Mutex<Vec<(State, State)>>>,
}

impl Harness {
    async fn build(model: MockChatModel, tools_config: ToolsConfig, registry: ToolRegistry) -> Self {
        Self::build_with_synth(model, tools_config, registry, MockSynthesizer::new(MIXER_RATE))
            .await
    }

    async fn build_with_synth(
        model: MockChatModel,
        tools_config: ToolsConfig,
        registry: ToolRegistry,
        synthesizer: MockSynthesizer,
    ) -> Self {
        Self::build_full(model, tools_config, registry, synthesizer, TtsConfig::default()).await
    }

    async fn build_full(
        model: MockChatModel,
        tools_config: ToolsConfig,
        registry: ToolRegistry,
        synthesizer: MockSynthesizer,
        tts_config: TtsConfig,
    ) -> Self {
        let agent = Arc::new(VoiceAgent::new(
            Arc::new(model),
            &AgentConfig::default(),
            &tools_config,
        ));
        let mixer = Arc::new(RecordingMixer::new());
        let synth = Arc::new(synthesizer);
        let outpipe = Arc::new(OutPipe::new(
            &tts_config,
            &MixerConfig {
                sample_rate: MIXER_RATE,
                ..MixerConfig::default()
            },
            &TtsPipelineConfig::default(),
            Arc::clone(&synth) as _,
            Arc::clone(&mixer) as Arc<dyn AudioMixer>,
        ));
        let orchestrator = Orchestrator::new(agent, outpipe, Arc::new(registry), 120);

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&transitions);
        orchestrator.subscribe(
            EventTag::StateChanged,
            Box::new(move |event| {
                if let BusEvent::StateChanged { from, to } = event {
                    sink.lock().unwrap().push((from, to));
                }
            }),
        );

        orchestrator.start(CancellationToken::new()).await.unwrap();
        Self {
            orchestrator,
            mixer,
            synth,
            transitions,
        }
    }

    fn final_transcript(&self, text: &str) {
        self.orchestrator.notify_transcript(TranscriptEvent {
            text: text.into(),
            is_final: true,
            begin_ms: 0,
            end_ms: Some(800),
        });
    }

    async fn wait_for_state(&self, want: State, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.orchestrator.state() == want {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for state {want}, still {}",
                    self.orchestrator.state()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn assert_transitions_legal(&self) {
        for (from, to) in self.transitions.lock().unwrap().iter() {
            assert!(is_valid_transition(*from, *to), "illegal {from} -> {to}");
        }
    }
}

fn text_delta(content: &str) -> ChatDelta {
    ChatDelta {
        content: content.into(),
        tool_calls: vec![],
    }
}

// ── Scenario: silent tail ─────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simple_turn_speaks_and_returns_to_idle() {
    let model = MockChatModel::new(vec![text_delta("现在是上午十点。")]);
    let harness = Harness::build(model, ToolsConfig::default(), ToolRegistry::new()).await;

    harness.final_transcript("现在几点");
    harness.mixer.wait_for_played(1, Duration::from_secs(5)).await;
    harness.wait_for_state(State::Idle, Duration::from_secs(5)).await;

    assert_eq!(harness.mixer.played_texts(), vec!["现在是上午十点。"]);
    let transitions = harness.transitions.lock().unwrap().clone();
    let speaking = transitions
        .iter()
        .filter(|(_, to)| *to == State::Speaking)
        .count();
    assert_eq!(speaking, 1, "expected exactly one Speaking transition");
    harness.assert_transitions_legal();
    assert_eq!(harness.orchestrator.outstanding_tts(), 0);
    // Ducking released once playback ended.
    assert!(!harness.mixer.is_ducked());
}

// ── Scenario: out-of-order generation, in-order playback ──────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn playback_order_survives_uneven_generation() {
    let model = MockChatModel::new(vec![
        text_delta("First."),
        text_delta("First.Second."),
        text_delta("First.Second.Third."),
    ]);
    let synthesizer = MockSynthesizer::new(MIXER_RATE)
        .with_delay("First.", Duration::from_millis(100))
        .with_delay("Second.", Duration::from_millis(10))
        .with_delay("Third.", Duration::from_millis(50));
    let harness =
        Harness::build_with_synth(model, ToolsConfig::default(), ToolRegistry::new(), synthesizer)
            .await;

    harness.final_transcript("count");
    harness.mixer.wait_for_played(3, Duration::from_secs(5)).await;

    assert_eq!(
        harness.mixer.played_texts(),
        vec!["First.", "Second.", "Third."]
    );
    // The mixer never held more than one TTS stream at a time.
    assert!(harness.mixer.max_installed() <= 1);
    harness.wait_for_state(State::Idle, Duration::from_secs(5)).await;
}

// ── Scenario: barge-in during playback ────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn barge_in_cancels_turn_and_returns_to_listening() {
    // A slow model that keeps extending its answer.
    let model = MockChatModel::new(vec![
        text_delta("Sentence one."),
        text_delta("Sentence one.Sentence two."),
        text_delta("Sentence one.Sentence two.Sentence three."),
        text_delta("Sentence one.Sentence two.Sentence three.Sentence four."),
    ])
    .with_delay(Duration::from_millis(80));
    let harness = Harness::build(model, ToolsConfig::default(), ToolRegistry::new()).await;

    harness.final_transcript("talk to me");
    harness.mixer.wait_for_played(1, Duration::from_secs(5)).await;

    harness.orchestrator.notify_user_speaking();
    harness
        .wait_for_state(State::Listening, Duration::from_millis(500))
        .await;

    let played_at_barge_in = harness.mixer.played_texts().len();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The cancelled agent produced no further audio.
    assert_eq!(harness.mixer.played_texts().len(), played_at_barge_in);
    assert_eq!(harness.orchestrator.outstanding_tts(), 0);
    assert_eq!(harness.orchestrator.state(), State::Listening);
    harness.assert_transitions_legal();
}

// ── Scenario: action tool with spoken acknowledgement ─────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn action_tool_speaks_template_and_runs_once() {
    let mut tools_config = ToolsConfig::default();
    tools_config.types.insert("playMusic".into(), "action".into());
    tools_config
        .action_responses
        .insert("playMusic".into(), "正在为您播放{{song}}".into());

    let model = MockChatModel::new(vec![ChatDelta {
        content: String::new(),
        tool_calls: vec![ToolCallData {
            name: "playMusic".into(),
            arguments: json!({"song": "稻香"}),
        }],
    }]);

    let tool = Arc::new(RecordingTool::new(""));
    let mut registry = ToolRegistry::new();
    registry.register("playMusic", Arc::clone(&tool) as _);

    let harness = Harness::build(model, tools_config, registry).await;
    harness.final_transcript("放一首稻香");

    harness.mixer.wait_for_played(1, Duration::from_secs(5)).await;
    assert_eq!(harness.mixer.played_texts(), vec!["正在为您播放稻香"]);

    harness.wait_for_state(State::Idle, Duration::from_secs(5)).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tool.call_count() < 1 {
        assert!(tokio::time::Instant::now() < deadline, "executor never invoked");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(tool.call_count(), 1);
}

// ── Scenario: query tool result feeds a follow-up turn ────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn query_tool_result_is_summarized_in_follow_up_turn() {
    let mut tools_config = ToolsConfig::default();
    tools_config.types.insert("time".into(), "query".into());

    // The tool call arrives first and its executor resolves immediately,
    // while the model keeps streaming a trailing sentence. The follow-up
    // must not cut that sentence off.
    let model = MockChatModel::new(vec![
        ChatDelta {
            content: String::new(),
            tool_calls: vec![ToolCallData {
                name: "time".into(),
                arguments: json!({}),
            }],
        },
        text_delta("我看一下。"),
    ])
    .with_delay(Duration::from_millis(50))
    .then(vec![text_delta("现在是上午十点。")]);
    let seen_inputs = Arc::clone(&model.seen_inputs);

    let tool = Arc::new(RecordingTool::new("10:00"));
    let mut registry = ToolRegistry::new();
    registry.register("time", Arc::clone(&tool) as _);

    let harness = Harness::build(model, tools_config, registry).await;
    harness.final_transcript("现在几点");

    harness.mixer.wait_for_played(2, Duration::from_secs(5)).await;
    assert_eq!(
        harness.mixer.played_texts(),
        vec!["我看一下。", "现在是上午十点。"]
    );
    assert_eq!(tool.call_count(), 1);
    harness.wait_for_state(State::Idle, Duration::from_secs(5)).await;
    harness.assert_transitions_legal();

    // The follow-up turn carried the tool result back to the model.
    let inputs = seen_inputs.lock().unwrap().clone();
    assert_eq!(inputs.len(), 2);
    assert!(inputs[1].contains("10:00"), "follow-up input: {}", inputs[1]);
}

// ── Scenario: per-emotion voice selection ─────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn emotion_tag_selects_voice_and_is_never_spoken() {
    let mut tts_config = TtsConfig::default();
    tts_config.voice_map.insert("happy".into(), "voice-happy".into());
    tts_config.voice_map.insert("default".into(), "voice-plain".into());

    let model = MockChatModel::new(vec![text_delta("[EMO:happy]好消息！")]);
    let harness = Harness::build_full(
        model,
        ToolsConfig::default(),
        ToolRegistry::new(),
        MockSynthesizer::new(MIXER_RATE),
        tts_config,
    )
    .await;

    harness.final_transcript("说点好消息");
    harness.mixer.wait_for_played(1, Duration::from_secs(5)).await;

    // The tag never reaches the synthesizer's text, but it picks the voice.
    assert_eq!(harness.mixer.played_texts(), vec!["好消息！"]);
    assert_eq!(*harness.synth.voices.lock().unwrap(), vec!["voice-happy"]);
}

// ── Scenario: transient TTS start failure is retried once ─────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_stream_start_failure_is_retried() {
    let model = MockChatModel::new(vec![text_delta("还在呢。")]);
    let harness = Harness::build(model, ToolsConfig::default(), ToolRegistry::new()).await;

    harness.synth.fail_next_start();
    harness.final_transcript("你还在吗");

    harness.mixer.wait_for_played(1, Duration::from_secs(5)).await;
    assert_eq!(harness.mixer.played_texts(), vec!["还在呢。"]);
}

// ── Scenario: tool audio reaches the resource channel ─────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tool_audio_plays_through_resource_channel() {
    let mut tools_config = ToolsConfig::default();
    tools_config.types.insert("chime".into(), "action".into());

    let model = MockChatModel::new(vec![ChatDelta {
        content: String::new(),
        tool_calls: vec![ToolCallData {
            name: "chime".into(),
            arguments: json!({}),
        }],
    }]);

    let tool = Arc::new(RecordingTool::new("").with_audio(vec![1u8; 64]));
    let mut registry = ToolRegistry::new();
    registry.register("chime", Arc::clone(&tool) as _);

    let harness = Harness::build(model, tools_config, registry).await;
    harness.final_transcript("ding");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !harness.mixer.has_resource() {
        assert!(tokio::time::Instant::now() < deadline, "no resource stream arrived");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.mixer.resource_count(), 1);
}

// ── Scenario: agent failure returns silently to idle ──────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn agent_error_returns_to_idle_without_speaking() {
    let model = MockChatModel::failing("upstream 500");
    let harness = Harness::build(model, ToolsConfig::default(), ToolRegistry::new()).await;

    harness.final_transcript("hello");
    harness.wait_for_state(State::Idle, Duration::from_secs(5)).await;

    assert!(harness.mixer.played_texts().is_empty());
    harness.assert_transitions_legal();
}

// ── Scenario: markdown never reaches the synthesizer ──────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn markdown_is_stripped_before_synthesis() {
    let model = MockChatModel::new(vec![text_delta("**Bold** and [a link](x) matter.")]);
    let harness = Harness::build(model, ToolsConfig::default(), ToolRegistry::new()).await;

    harness.final_transcript("test");
    harness.mixer.wait_for_played(1, Duration::from_secs(5)).await;
    assert_eq!(harness.mixer.played_texts(), vec!["Bold and a link matter."]);
}
