//! FunASR local engine over WebSocket
//!
//! Protocol: a JSON start message, binary PCM16LE audio, then a JSON
//! `{"is_speaking": false}` end marker. The engine answers with JSON
//! messages carrying `text`, `mode` and `is_final`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::{RecognitionBackend, RecognitionResult, RecognitionStream};
use crate::config::OptionBag;
use crate::utterance::AudioStream;
use crate::{Error, Result};

/// Time allowed for the close handshake before the socket is dropped
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Online chunking hint sent with the start message
const CHUNK_SIZE: [u32; 3] = [5, 10, 5];

type EngineSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Validated FunASR options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunAsrConfig {
    pub host: String,
    pub port: u16,
    /// "online", "offline" or "2pass"
    pub mode: String,
    pub chunk_interval: u32,
    pub use_ssl: bool,
    pub connect_timeout: Duration,
    /// Inverse text normalization
    pub itn: bool,
}

impl Default for FunAsrConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10095,
            mode: "online".to_string(),
            chunk_interval: 10,
            use_ssl: false,
            connect_timeout: Duration::from_secs(5),
            itn: true,
        }
    }
}

impl FunAsrConfig {
    /// Normalize a loose option bag, defaulting anything missing or mistyped
    #[must_use]
    pub fn from_options(options: &OptionBag) -> Self {
        let defaults = Self::default();

        let port = options.u64_or("port", u64::from(defaults.port));
        let port = u16::try_from(port).unwrap_or_else(|_| {
            tracing::warn!(port, "funasr port out of range, using default");
            defaults.port
        });

        let mode = options.string_or("mode", &defaults.mode).to_lowercase();
        let mode = if matches!(mode.as_str(), "online" | "offline" | "2pass") {
            mode
        } else {
            tracing::warn!(mode, "unknown funasr mode, using default");
            defaults.mode
        };

        Self {
            host: options.string_or("host", &defaults.host),
            port,
            mode,
            chunk_interval: u32::try_from(
                options.u64_or("chunk_interval", u64::from(defaults.chunk_interval)),
            )
            .unwrap_or(defaults.chunk_interval),
            use_ssl: options.bool_or("use_ssl", defaults.use_ssl),
            connect_timeout: Duration::from_secs(
                options.u64_or("connect_timeout", defaults.connect_timeout.as_secs()),
            ),
            itn: options.bool_or("itn", defaults.itn),
        }
    }

    /// Engine WebSocket URL
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

#[derive(Serialize)]
struct StartMessage<'a> {
    mode: &'a str,
    chunk_size: [u32; 3],
    chunk_interval: u32,
    wav_name: String,
    wav_format: &'static str,
    audio_fs: u32,
    is_speaking: bool,
    itn: bool,
}

#[derive(Serialize)]
struct EndMessage {
    is_speaking: bool,
}

#[derive(Debug, Deserialize)]
struct EngineMessage {
    #[serde(default)]
    text: String,
    #[serde(default)]
    mode: String,
    #[serde(default)]
    is_final: bool,
}

/// Running transcript assembled from engine messages
///
/// Online messages carry increments; an offline message carries the
/// corrected sentence, replaces the pending online text and ends the
/// utterance.
#[derive(Debug, Default)]
struct Transcript {
    committed: String,
    pending: String,
}

impl Transcript {
    fn apply(&mut self, message: &EngineMessage) -> Option<RecognitionResult> {
        if message.mode.ends_with("offline") {
            self.committed.push_str(&message.text);
            self.pending.clear();
        } else {
            self.pending.push_str(&message.text);
        }

        let text = format!("{}{}", self.committed, self.pending).trim().to_string();
        if message.is_final || message.mode.ends_with("offline") {
            Some(RecognitionResult::final_text(text))
        } else if message.text.is_empty() {
            None
        } else {
            Some(RecognitionResult::partial(text))
        }
    }
}

/// FunASR recognition backend
pub struct FunAsrBackend {
    config: FunAsrConfig,
}

impl FunAsrBackend {
    /// Create a backend from validated options
    #[must_use]
    pub const fn new(config: FunAsrConfig) -> Self {
        Self { config }
    }

    /// Active options
    #[must_use]
    pub const fn config(&self) -> &FunAsrConfig {
        &self.config
    }
}

#[async_trait]
impl RecognitionBackend for FunAsrBackend {
    fn name(&self) -> &'static str {
        "funasr"
    }

    async fn recognize(
        &self,
        audio: AudioStream,
        cancel: CancellationToken,
    ) -> Result<RecognitionStream> {
        let url = self.config.url();
        let utterance_id = audio.utterance_id();

        let connect = tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()));
        let (socket, _) = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            result = connect => result
                .map_err(|_| Error::transport(format!("connect to {url} timed out")))?
                .map_err(|e| {
                    tracing::warn!(url = %url, error = %e, "funasr connect failed");
                    Error::transport(e)
                })?,
        };
        tracing::debug!(url = %url, utterance_id, "funasr connected");

        let (mut sink, source) = socket.split();

        let start = StartMessage {
            mode: &self.config.mode,
            chunk_size: CHUNK_SIZE,
            chunk_interval: self.config.chunk_interval,
            wav_name: format!("utterance-{utterance_id}"),
            wav_format: "pcm",
            audio_fs: audio.sample_rate(),
            is_speaking: true,
            itn: self.config.itn,
        };
        let start = serde_json::to_string(&start)?;
        if let Err(e) = sink.send(Message::Text(start.into())).await {
            close(&mut sink).await;
            return Err(Error::transport(e));
        }

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(pump(sink, source, audio, tx, cancel));

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Shuttle audio out and results back until the final result
async fn pump<S>(
    mut sink: EngineSink,
    mut source: S,
    mut audio: AudioStream,
    tx: mpsc::Sender<Result<RecognitionResult>>,
    cancel: CancellationToken,
) where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let utterance_id = audio.utterance_id();
    let mut audio_done = false;
    let mut transcript = Transcript::default();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::debug!(utterance_id, "funasr cancelled, closing");
                break;
            }

            () = tx.closed() => {
                tracing::debug!(utterance_id, "result consumer gone, closing");
                break;
            }

            chunk = audio.next(), if !audio_done => {
                let message = match chunk {
                    Some(chunk) => Message::Binary(chunk.to_pcm16_le().into()),
                    None => {
                        audio_done = true;
                        match serde_json::to_string(&EndMessage { is_speaking: false }) {
                            Ok(end) => Message::Text(end.into()),
                            Err(e) => {
                                let _ = tx.send(Err(e.into())).await;
                                break;
                            }
                        }
                    }
                };

                // An engine that stops reading must not hold the socket past cancel
                let outcome = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        tracing::debug!(utterance_id, "funasr cancelled mid-send, closing");
                        break;
                    }
                    outcome = sink.send(message) => outcome,
                };
                if let Err(e) = outcome {
                    tracing::warn!(utterance_id, error = %e, "funasr send failed");
                    let _ = tx.send(Err(Error::transport(e))).await;
                    break;
                }
            }

            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let message: EngineMessage = match serde_json::from_str(text.as_str()) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(utterance_id, error = %e, "unparseable funasr message");
                            continue;
                        }
                    };

                    if let Some(result) = transcript.apply(&message) {
                        let is_final = result.is_final;
                        if tx.send(Ok(result)).await.is_err() || is_final {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::warn!(utterance_id, "funasr closed before final result");
                    let _ = tx
                        .send(Err(Error::transport("engine closed before final result")))
                        .await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(utterance_id, error = %e, "funasr receive failed");
                    let _ = tx.send(Err(Error::transport(e))).await;
                    break;
                }
            },
        }
    }

    close(&mut sink).await;
}

async fn close(sink: &mut EngineSink) {
    if tokio::time::timeout(CLOSE_GRACE, sink.close()).await.is_err() {
        tracing::debug!("funasr close handshake timed out, dropping socket");
    }
}
