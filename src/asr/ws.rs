//! WebSocket recognizer adapter.
//!
//! Speaks a small JSON control protocol with binary PCM frames in between:
//! a `start` message configures the session, audio flows as binary frames,
//! `finish` flushes, and the server pushes `result` messages until the
//! socket closes. A background task owns the connection; the [`Recognizer`]
//! methods talk to it over a command channel.

use crate::asr::{Recognizer, TranscriptEvent, TranscriptHandler};
use crate::config::AsrConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Messages sent from client to server.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Start {
        model: String,
        sample_rate: u32,
        format: String,
    },
    Finish,
}

/// Messages received from the server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Result {
        text: String,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        begin_ms: u64,
        #[serde(default)]
        end_ms: Option<u64>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

enum Command {
    Audio(Vec<u8>),
    Finish,
}

/// Recognizer over a provider WebSocket.
pub struct WsRecognizer {
    config: AsrConfig,
    sample_rate: u32,
    handler: Arc<Mutex<Option<TranscriptHandler>>>,
    cmd_tx: Mutex<Option<mpsc::Sender<Command>>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl WsRecognizer {
    pub fn new(config: &AsrConfig, sample_rate: u32) -> Self {
        Self {
            config: config.clone(),
            sample_rate,
            handler: Arc::new(Mutex::new(None)),
            cmd_tx: Mutex::new(None),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Recognizer for WsRecognizer {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(VoiceError::InvalidState("recognizer already started".into()));
        }

        let mut request = self
            .config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| VoiceError::Asr(format!("invalid endpoint: {e}")))?;
        if !self.config.api_key.is_empty() {
            let value = format!("Bearer {}", self.config.api_key)
                .parse()
                .map_err(|_| VoiceError::Asr("API key is not header-safe".into()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| VoiceError::Asr(format!("connect failed: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        let start = ClientMessage::Start {
            model: self.config.model.clone(),
            sample_rate: self.sample_rate,
            format: "pcm_s16le".into(),
        };
        let text = serde_json::to_string(&start)
            .map_err(|e| VoiceError::Asr(format!("encode start: {e}")))?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| VoiceError::Asr(format!("send start: {e}")))?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(64);
        if let Ok(mut slot) = self.cmd_tx.lock() {
            *slot = Some(cmd_tx);
        }

        // Writer task: forwards audio frames and the finish marker.
        let writer_cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_cancel.cancelled() => break,
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        let result = match cmd {
                            Command::Audio(pcm) => {
                                sink.send(Message::Binary(pcm.into())).await
                            }
                            Command::Finish => {
                                match serde_json::to_string(&ClientMessage::Finish) {
                                    Ok(text) => sink.send(Message::Text(text.into())).await,
                                    Err(_) => Ok(()),
                                }
                            }
                        };
                        if let Err(e) = result {
                            if !writer_cancel.is_cancelled() {
                                warn!("ASR send failed: {e}");
                            }
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        // Reader task: dispatches server results to the handler.
        let handler = Arc::clone(&self.handler);
        let reader_cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    msg = stream.next() => {
                        let Some(msg) = msg else { break };
                        let msg = match msg {
                            Ok(m) => m,
                            Err(e) => {
                                if !reader_cancel.is_cancelled() {
                                    warn!("ASR socket error: {e}");
                                }
                                break;
                            }
                        };
                        let Message::Text(text) = msg else { continue };
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(ServerMessage::Result { text, is_final, begin_ms, end_ms }) => {
                                let event = TranscriptEvent { text, is_final, begin_ms, end_ms };
                                if let Ok(guard) = handler.lock()
                                    && let Some(h) = guard.as_ref()
                                {
                                    h(event);
                                }
                            }
                            Ok(ServerMessage::Error { message }) => {
                                warn!("ASR provider error: {message}");
                            }
                            Err(e) => debug!("ignoring unparseable ASR message: {e}"),
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn send_audio(&self, pcm: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }
        let tx = {
            let Ok(slot) = self.cmd_tx.lock() else {
                return Err(VoiceError::Asr("command channel lock poisoned".into()));
            };
            slot.clone()
        };
        let Some(tx) = tx else {
            return Err(VoiceError::InvalidState("recognizer not started".into()));
        };
        tx.send(Command::Audio(pcm.to_vec()))
            .await
            .map_err(|_| VoiceError::Asr("recognizer connection closed".into()))
    }

    async fn finish(&self) -> Result<()> {
        let tx = {
            let Ok(slot) = self.cmd_tx.lock() else {
                return Ok(());
            };
            slot.clone()
        };
        if let Some(tx) = tx {
            let _ = tx.send(Command::Finish).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if let Ok(mut slot) = self.cmd_tx.lock() {
            *slot = None;
        }
        Ok(())
    }

    fn on_result(&self, handler: TranscriptHandler) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(handler);
        }
    }
}
