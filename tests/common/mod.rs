//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use beacon_voice::audio::Frame;
use beacon_voice::config::{Config, GenerationSettings, RecognitionSettings};
use beacon_voice::generation::{
    Completion, FragmentStream, GenerationBackend, GenerationFragment, GenerationRequest,
};
use beacon_voice::recognition::{RecognitionBackend, RecognitionResult, RecognitionStream};
use beacon_voice::session::{BackendProvider, SessionEvent};
use beacon_voice::transport::{DevicePayload, DeviceTransport};
use beacon_voice::utterance::AudioStream;
use beacon_voice::{Error, Result};

pub const SAMPLE_RATE: u32 = 16_000;
pub const FRAME_MS: u32 = 20;
const FRAME_SAMPLES: usize = (SAMPLE_RATE * FRAME_MS / 1000) as usize;

/// A 20ms frame loud enough to count as speech
pub fn speech(seq: u64) -> Frame {
    Frame::new(seq, SAMPLE_RATE, 1, vec![0.5; FRAME_SAMPLES])
}

/// A 20ms frame of digital silence
pub fn silence(seq: u64) -> Frame {
    Frame::new(seq, SAMPLE_RATE, 1, vec![0.0; FRAME_SAMPLES])
}

/// `speech_ms` of speech followed by `silence_ms` of silence
pub fn utterance(first_seq: u64, speech_ms: u32, silence_ms: u32) -> Vec<Frame> {
    let speech_frames = u64::from(speech_ms / FRAME_MS);
    let silence_frames = u64::from(silence_ms / FRAME_MS);
    (0..speech_frames)
        .map(|i| speech(first_seq + i))
        .chain((0..silence_frames).map(|i| silence(first_seq + speech_frames + i)))
        .collect()
}

/// Configuration with short windows and deadlines
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.vad.onset_ms = 60;
    config.vad.end_window_ms = 200;
    config.vad.min_utterance_ms = 100;
    config.vad.max_utterance_ms = 5_000;
    config.vad.preroll_ms = 100;
    config.buffer.chunk_ms = 100;
    config.buffer.capacity_ms = 2_000;
    config.session.recognition_timeout_ms = 2_000;
    config.session.generation_timeout_ms = 2_000;
    config.session.idle_timeout_ms = 60_000;
    config.session.cancel_grace_ms = 200;
    config.server.publish_timeout_ms = 200;
    config
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive events until one matches, panicking after five seconds
pub async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("session ended before the expected event"),
        Err(_) => panic!("timed out waiting for session event"),
    }
}

/// How one scripted recognition call behaves
#[derive(Debug, Clone)]
pub enum Recognition {
    /// Read all audio, then report a partial and the final text
    Transcribe(String),
    /// Read all audio, then report an empty final result
    Empty,
    /// Fail with a transport error once the first chunk arrives
    Fail,
    /// Read all audio, then never answer
    Hang,
    /// Never read any audio
    Stall,
}

/// Recognition backend that follows a script and counts live connections
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<Recognition>>,
    open: Arc<AtomicUsize>,
    calls: AtomicUsize,
}

impl ScriptedRecognizer {
    /// Calls past the end of the script transcribe "hello"
    pub fn new(script: impl IntoIterator<Item = Recognition>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            open: Arc::new(AtomicUsize::new(0)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct Connection(Arc<AtomicUsize>);

impl Connection {
    fn open(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn drain(audio: &mut AudioStream) -> usize {
    let mut chunks = 0;
    while audio.next().await.is_some() {
        chunks += 1;
    }
    chunks
}

#[async_trait]
impl RecognitionBackend for ScriptedRecognizer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn recognize(
        &self,
        mut audio: AudioStream,
        cancel: CancellationToken,
    ) -> Result<RecognitionStream> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Recognition::Transcribe("hello".to_string()));
        self.calls.fetch_add(1, Ordering::SeqCst);
        let connection = Connection::open(&self.open);
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            let _connection = connection;
            match behavior {
                Recognition::Transcribe(text) => {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        _ = drain(&mut audio) => {}
                    }
                    let head: String = text.split_whitespace().take(1).collect();
                    let _ = tx.send(Ok(RecognitionResult::partial(head))).await;
                    let _ = tx.send(Ok(RecognitionResult::final_text(text))).await;
                }
                Recognition::Empty => {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        _ = drain(&mut audio) => {}
                    }
                    let _ = tx.send(Ok(RecognitionResult::final_text(""))).await;
                }
                Recognition::Fail => {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        _ = audio.next() => {}
                    }
                    let _ = tx.send(Err(Error::transport("connection reset"))).await;
                }
                Recognition::Hang => {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        _ = drain(&mut audio) => {}
                    }
                    cancel.cancelled().await;
                }
                Recognition::Stall => {
                    let _audio = audio;
                    cancel.cancelled().await;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// How one scripted generation turn behaves
#[derive(Debug, Clone)]
pub enum Generation {
    /// Stream these fragments and finish
    Reply(Vec<String>),
    /// Refuse to stream; the single-shot call answers with this text
    StreamFails { fallback: String },
    /// Stream these fragments, then break
    BreaksAfter(Vec<String>),
    /// Never produce anything
    Hang,
}

impl Generation {
    pub fn reply(parts: &[&str]) -> Self {
        Self::Reply(parts.iter().map(ToString::to_string).collect())
    }
}

/// Generation backend that follows a script and records requests
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Generation>>,
    current: Mutex<Option<Generation>>,
    requests: Mutex<Vec<GenerationRequest>>,
    completions: AtomicUsize,
}

impl ScriptedGenerator {
    /// Turns past the end of the script reply "ok"
    pub fn new(script: impl IntoIterator<Item = Generation>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            current: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
        })
    }

    /// Requests seen by streaming calls
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Single-shot calls made
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

fn content(parts: Vec<String>) -> Vec<Result<GenerationFragment>> {
    parts
        .into_iter()
        .map(|p| Ok(GenerationFragment::Content(p)))
        .collect()
}

#[async_trait]
impl GenerationBackend for ScriptedGenerator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        _cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        self.requests.lock().unwrap().push(request);
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Generation::reply(&["ok"]));
        *self.current.lock().unwrap() = Some(behavior.clone());

        match behavior {
            Generation::Reply(parts) => Ok(futures::stream::iter(content(parts)).boxed()),
            Generation::StreamFails { .. } => Err(Error::transport("stream refused")),
            Generation::BreaksAfter(parts) => {
                let broken = futures::stream::iter(vec![Err(Error::transport("stream reset"))]);
                Ok(futures::stream::iter(content(parts)).chain(broken).boxed())
            }
            Generation::Hang => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn complete(
        &self,
        _request: GenerationRequest,
        _cancel: CancellationToken,
    ) -> Result<Completion> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        match self.current.lock().unwrap().clone() {
            Some(Generation::StreamFails { fallback }) => Ok(Completion {
                content: fallback,
                tool_calls: Vec::new(),
            }),
            _ => Err(Error::Generation("no single-shot answer scripted".to_string())),
        }
    }
}

/// Transport that keeps everything it is given
#[derive(Default)]
pub struct RecordingTransport {
    payloads: Mutex<Vec<DevicePayload>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn payloads(&self) -> Vec<DevicePayload> {
        self.payloads.lock().unwrap().clone()
    }

    /// Response text chunks, in publish order
    pub fn response_text(&self) -> Vec<String> {
        self.payloads()
            .into_iter()
            .filter_map(|p| match p {
                DevicePayload::ResponseText { content } => Some(content),
                _ => None,
            })
            .collect()
    }

    /// Published transcripts, in order
    pub fn transcripts(&self) -> Vec<String> {
        self.payloads()
            .into_iter()
            .filter_map(|p| match p {
                DevicePayload::Transcript { text } => Some(text),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl DeviceTransport for RecordingTransport {
    async fn publish(&self, payload: DevicePayload) -> Result<()> {
        self.payloads.lock().unwrap().push(payload);
        Ok(())
    }
}

/// Hands every session the same scripted backends
pub struct StaticBackends {
    pub recognizer: Arc<ScriptedRecognizer>,
    pub generator: Arc<ScriptedGenerator>,
}

impl BackendProvider for StaticBackends {
    fn recognition(&self, _settings: &RecognitionSettings) -> Result<Arc<dyn RecognitionBackend>> {
        Ok(self.recognizer.clone())
    }

    fn generation(&self, _settings: &GenerationSettings) -> Result<Arc<dyn GenerationBackend>> {
        Ok(self.generator.clone())
    }
}
