//! Aria host binary: wires the microphone, remote providers, mixer and
//! orchestrator together and runs the conversation loop until Ctrl-C.

use anyhow::{Context, Result};
use aria::agent::VoiceAgent;
use aria::agent::tools::{ToolExecutor, ToolOutput, ToolRegistry};
use aria::asr::ws::WsRecognizer;
use aria::audio::aec::{AecMode, AecSource, NoopEchoCanceller, ReferenceBuffer};
use aria::audio::mixer::{AudioMixer, CpalBackend, Mixer};
use aria::audio::source::{AudioSource, CpalSource};
use aria::config::Config;
use aria::llm::openai::OpenAiChatModel;
use aria::pipeline::inpipe::InPipe;
use aria::pipeline::orchestrator::Orchestrator;
use aria::pipeline::outpipe::OutPipe;
use aria::tts::ws::WsSynthesizer;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Query tool: current wall-clock time.
struct TimeTool;

#[async_trait]
impl ToolExecutor for TimeTool {
    async fn execute(&self, _args: &Value) -> aria::Result<ToolOutput> {
        let now = chrono::Local::now();
        Ok(ToolOutput {
            text: now.format("%H:%M").to_string(),
            audio: None,
        })
    }
}

/// Action tool: music playback is acknowledged via its configured template;
/// the actual player integration is out of scope here.
struct PlayMusicTool;

#[async_trait]
impl ToolExecutor for PlayMusicTool {
    async fn execute(&self, _args: &Value) -> aria::Result<ToolOutput> {
        Ok(ToolOutput {
            text: String::new(),
            audio: None,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = if config_path.exists() {
        Config::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?
    } else {
        let mut config = Config::default();
        config.apply_env();
        config
    };

    aria::logging::init(&config.logging);
    info!("aria starting (config: {})", config_path.display());

    let parent = CancellationToken::new();

    // Output path: mixer + backend, synthesizer, output pipe.
    let mixer = Arc::new(Mixer::new(&config.audio.mixer));
    let backend = CpalBackend::new(config.audio.mixer.sample_rate, None);
    mixer.start(Box::new(backend)).context("starting mixer")?;

    let synthesizer = Arc::new(WsSynthesizer::new(&config.tts));
    let outpipe = Arc::new(OutPipe::new(
        &config.tts,
        &config.audio.mixer,
        &config.audio.tts_pipeline,
        synthesizer,
        Arc::clone(&mixer) as Arc<dyn AudioMixer>,
    ));

    // Echo control: reference buffer fed by the output pipe's tap.
    let aec_config = &config.audio.in_pipe.aec;
    let reference = Arc::new(
        ReferenceBuffer::new(
            aec_config,
            config.audio.in_pipe.sample_rate,
            config.audio.in_pipe.channels,
        )
        .context("building reference buffer")?,
    );
    if aec_config.enable {
        outpipe.set_reference_sink(Arc::clone(&reference) as _);
    }

    // Input path: microphone, optional AEC wrapper, recognizer.
    let capture = CpalSource::open(&config.audio.in_pipe).context("opening microphone")?;
    let source: Box<dyn AudioSource> = if aec_config.enable {
        let mode = match aec_config.mode.as_str() {
            "cancel" => AecMode::Cancel,
            _ => AecMode::Gate,
        };
        Box::new(AecSource::new(
            Box::new(capture),
            Arc::clone(&reference),
            mode,
            Box::new(NoopEchoCanceller),
        ))
    } else {
        Box::new(capture)
    };
    let recognizer = Arc::new(WsRecognizer::new(
        &config.asr,
        config.audio.in_pipe.sample_rate,
    ));
    let inpipe = InPipe::new(&config.audio.in_pipe, source, recognizer);

    // Agent and tools.
    let model = Arc::new(OpenAiChatModel::new(&config.llm));
    let agent = Arc::new(VoiceAgent::new(model, &config.agent, &config.tools));
    let mut tools = ToolRegistry::new();
    tools.register("time", Arc::new(TimeTool));
    tools.register("playMusic", Arc::new(PlayMusicTool));

    let orchestrator = Orchestrator::new(
        agent,
        Arc::clone(&outpipe),
        Arc::new(tools),
        config.agent.max_sentence_runes,
    );
    orchestrator.start(parent.clone()).await.context("starting orchestrator")?;
    orchestrator.attach_input(&inpipe);
    inpipe.start().await.context("starting input pipe")?;

    info!("listening; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");

    inpipe.stop().await;
    orchestrator.shutdown().await;
    parent.cancel();
    mixer.stop();

    Ok(())
}
