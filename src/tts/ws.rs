//! WebSocket synthesizer adapter.
//!
//! One WebSocket connection per synthesis stream. Text chunks go up as JSON
//! control messages; audio comes back as binary PCM frames, which the reader
//! task writes into a [`BufferedPipe`] so the network side never blocks on a
//! slow consumer.

use crate::audio::pipe::BufferedPipe;
use crate::audio::stream::PcmStream;
use crate::config::TtsConfig;
use crate::error::{Result, VoiceError};
use crate::tts::{SynthRequest, SynthStream, Synthesizer};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, warn};

/// Messages sent from client to server.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Start {
        model: String,
        voice: String,
        format: String,
        sample_rate: u32,
        volume: u32,
        rate: u32,
        pitch: u32,
        text_type: String,
    },
    Text {
        text: String,
    },
    Finish,
}

/// Control messages received from the server (audio arrives as binary).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    End,
    Error {
        #[serde(default)]
        message: String,
    },
}

enum Command {
    Text(String),
    Finish,
}

/// Synthesizer over a provider WebSocket.
pub struct WsSynthesizer {
    config: TtsConfig,
}

impl WsSynthesizer {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Synthesizer for WsSynthesizer {
    async fn start(&self, request: &SynthRequest) -> Result<Box<dyn SynthStream>> {
        let mut ws_request = self
            .config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| VoiceError::Tts(format!("invalid endpoint: {e}")))?;
        if !self.config.api_key.is_empty() {
            let value = format!("Bearer {}", self.config.api_key)
                .parse()
                .map_err(|_| VoiceError::Tts("API key is not header-safe".into()))?;
            ws_request.headers_mut().insert("Authorization", value);
        }

        let (socket, _) = connect_async(ws_request)
            .await
            .map_err(|e| VoiceError::Tts(format!("connect failed: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        let start = ClientMessage::Start {
            model: self.config.model.clone(),
            voice: request.voice.clone(),
            format: self.config.format.clone(),
            sample_rate: request.sample_rate,
            volume: request.volume,
            rate: request.rate,
            pitch: request.pitch,
            text_type: self.config.text_type.clone(),
        };
        let text = serde_json::to_string(&start)
            .map_err(|e| VoiceError::Tts(format!("encode start: {e}")))?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| VoiceError::Tts(format!("send start: {e}")))?;

        let pipe = BufferedPipe::new();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(16);

        // Writer task: text chunks and the finish marker. Ends when the
        // stream handle is dropped (command sender closed).
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let msg = match cmd {
                    Command::Text(text) => ClientMessage::Text { text },
                    Command::Finish => ClientMessage::Finish,
                };
                let Ok(encoded) = serde_json::to_string(&msg) else { continue };
                if let Err(e) = sink.send(Message::Text(encoded.into())).await {
                    warn!("TTS send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader task: binary audio frames into the pipe until end/close.
        // A closed pipe (reader torn down by an interrupt) fails the write
        // and ends the task.
        let reader_pipe = pipe.clone();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(audio)) => {
                        if reader_pipe.write(&audio).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::End) => break,
                        Ok(ServerMessage::Error { message }) => {
                            warn!("TTS provider error: {message}");
                            break;
                        }
                        Err(e) => debug!("ignoring unparseable TTS message: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("TTS socket error: {e}");
                        break;
                    }
                }
            }
            // No more audio after end-of-stream: let readers drain then EOF.
            reader_pipe.close();
        });

        Ok(Box::new(WsSynthStream {
            cmd_tx: Some(cmd_tx),
            pipe,
            sample_rate: request.sample_rate,
            channels: 1,
        }))
    }
}

/// One live WebSocket synthesis stream.
pub struct WsSynthStream {
    cmd_tx: Option<mpsc::Sender<Command>>,
    pipe: BufferedPipe,
    sample_rate: u32,
    channels: u16,
}

#[async_trait]
impl SynthStream for WsSynthStream {
    async fn write_text_chunk(&mut self, text: &str) -> Result<()> {
        let Some(tx) = self.cmd_tx.as_ref() else {
            return Err(VoiceError::InvalidState("stream already closed".into()));
        };
        tx.send(Command::Text(text.to_owned()))
            .await
            .map_err(|_| VoiceError::Tts("synthesis connection closed".into()))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(Command::Finish).await;
        }
        Ok(())
    }

    fn audio_reader(&self) -> Box<dyn PcmStream> {
        Box::new(self.pipe.reader())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

impl Drop for WsSynthStream {
    fn drop(&mut self) {
        // Dropping the command sender ends the writer task and closes the
        // socket's send half. Audio already in flight keeps streaming into
        // the pipe until the server's end marker; the pipe itself is closed
        // by whoever owns the reader.
        let _ = self.cmd_tx.take();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn start_message_carries_voice_parameters() {
        let msg = ClientMessage::Start {
            model: "m".into(),
            voice: "v-happy".into(),
            format: "pcm".into(),
            sample_rate: 24_000,
            volume: 50,
            rate: 100,
            pitch: 100,
            text_type: "plain".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["voice"], "v-happy");
        assert_eq!(json["sample_rate"], 24_000);
    }

    #[test]
    fn end_message_parses() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"end"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::End));
    }
}
