//! Per-session pipeline coordinator
//!
//! Frames are classified and segmented inline; recognition and generation
//! run as child tasks so that ingestion never waits on a backend. Every
//! stage gets a child of the session token plus a deadline, and a stage
//! that is cancelled or times out is reaped in the background with a
//! bounded grace before it is aborted.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::{
    CloseReason, SessionCommand, SessionContext, SessionEvent, SessionReport, SessionState, Stage,
};
use crate::audio::{Frame, FrameSource};
use crate::config::{Config, SessionConfig};
use crate::generation::{DialogueHistory, GenerationBackend, ResponseDriver, ResponseOutcome};
use crate::recognition::{RecognitionBackend, guard_finality};
use crate::transport::{DevicePayload, DeviceTransport};
use crate::utterance::{AudioStream, Utterance, UtteranceStatus};
use crate::vad::{SegmentEvent, SpeechClassifier, UtteranceEnd};
use crate::{Error, ErrorKind, Result};

/// Backends and transport for one session
pub struct SessionParts {
    pub recognizer: Arc<dyn RecognitionBackend>,
    pub generator: Arc<dyn GenerationBackend>,
    pub transport: Arc<dyn DeviceTransport>,
    pub classifier: Arc<dyn SpeechClassifier>,
}

enum StageOutput {
    Transcript(Option<String>),
    Response(ResponseOutcome),
}

struct ActiveStage {
    stage: Stage,
    utterance_id: u64,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    started: Instant,
    handle: JoinHandle<Result<StageOutput>>,
}

/// Drives one device session from first frame to close
pub struct SessionCoordinator {
    ctx: SessionContext,
    settings: SessionConfig,
    recognizer: Arc<dyn RecognitionBackend>,
    driver: Arc<Mutex<ResponseDriver>>,
    transport: Arc<dyn DeviceTransport>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    control: Option<mpsc::Receiver<SessionCommand>>,
    stage: Option<ActiveStage>,
}

impl SessionCoordinator {
    #[must_use]
    pub fn new(device_id: impl Into<String>, config: &Config, parts: SessionParts) -> Self {
        let generation = &config.generation;
        let history = DialogueHistory::new(generation.system_prompt.clone(), generation.max_history);
        let driver = ResponseDriver::new(
            parts.generator,
            Arc::clone(&parts.transport),
            history,
            generation.active_tools(),
        );

        Self {
            ctx: SessionContext::new(device_id, config, parts.classifier),
            settings: config.session,
            recognizer: parts.recognizer,
            driver: Arc::new(Mutex::new(driver)),
            transport: parts.transport,
            events: None,
            control: None,
            stage: None,
        }
    }

    /// Report milestones on `events`
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Accept control commands from `control`
    #[must_use]
    pub fn with_control(mut self, control: mpsc::Receiver<SessionCommand>) -> Self {
        self.control = Some(control);
        self
    }

    /// Cancelling this token closes the session
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.ctx.session_id
    }

    /// Run until cancellation, idle timeout or the end of `source`
    ///
    /// # Errors
    ///
    /// Stage failures never end the session; the error path is reserved for
    /// failures of the session itself
    pub async fn run<S: FrameSource>(mut self, mut source: S) -> Result<SessionReport> {
        tracing::info!(
            session_id = %self.ctx.session_id,
            device_id = %self.ctx.device_id,
            recognizer = self.recognizer.name(),
            "session started"
        );
        self.set_state(SessionState::AwaitingUtterance);
        let hello = DevicePayload::Hello {
            session_id: self.ctx.session_id.clone(),
        };
        if let Err(e) = self.transport.publish(hello).await {
            tracing::warn!(session_id = %self.ctx.session_id, error = %e, "failed to greet device");
        }

        let idle_timeout = Duration::from_millis(self.settings.idle_timeout_ms);
        let mut end_of_stream = false;

        let reason = loop {
            if end_of_stream && self.stage.is_none() {
                break CloseReason::EndOfStream;
            }

            let stage_deadline = self.stage.as_ref().and_then(|s| s.deadline);
            let idle_deadline = (self.ctx.state == SessionState::AwaitingUtterance
                && !end_of_stream
                && !self.ctx.in_speech())
            .then(|| self.ctx.last_activity + idle_timeout);

            tokio::select! {
                biased;

                () = self.ctx.cancel.cancelled() => break CloseReason::Cancelled,

                result = join_stage(&mut self.stage) => self.on_stage_finished(result),

                () = sleep_until_opt(stage_deadline) => self.on_stage_timeout(),

                command = recv_command(&mut self.control) => match command {
                    Some(SessionCommand::Abort) => self.abort(),
                    None => self.control = None,
                },

                frame = source.next_frame(), if !end_of_stream => match frame {
                    Some(frame) => self.on_frame(frame),
                    None => {
                        tracing::debug!(session_id = %self.ctx.session_id, "frame source ended");
                        end_of_stream = true;
                        if let Some(SegmentEvent::End(end)) = self.ctx.vad.flush() {
                            self.emit(SessionEvent::Segmentation { segment: SegmentEvent::End(end) });
                            self.on_utterance_end(end);
                        }
                    }
                },

                () = sleep_until_opt(idle_deadline) => break CloseReason::Idle,
            }
        };

        self.close(reason).await;
        Ok(self.ctx.report)
    }

    fn on_frame(&mut self, frame: Frame) {
        self.ctx.report.frames += 1;
        let (classification, event) = self.ctx.vad.process(&frame);
        if classification.is_speech {
            self.ctx.last_activity = Instant::now();
        }

        match event {
            None => self.ctx.preroll.push(frame),
            Some(SegmentEvent::Start) => {
                self.emit(SessionEvent::Segmentation {
                    segment: SegmentEvent::Start,
                });
                if self.ctx.state == SessionState::AwaitingUtterance {
                    self.open_utterance(&frame);
                } else {
                    tracing::info!(
                        session_id = %self.ctx.session_id,
                        state = ?self.ctx.state,
                        "speech while busy, utterance rejected"
                    );
                    self.ctx.rejecting = true;
                    self.ctx.preroll.clear();
                    self.ctx.report.rejected += 1;
                    self.emit(SessionEvent::UtteranceRejected {
                        state: self.ctx.state,
                    });
                }
            }
            Some(SegmentEvent::Continue) => {
                if self.ctx.buffer.is_open()
                    && let Err(e) = self.ctx.buffer.push(&frame)
                {
                    self.abandon_utterance(&e);
                }
            }
            Some(SegmentEvent::End(end)) => {
                self.emit(SessionEvent::Segmentation {
                    segment: SegmentEvent::End(end),
                });
                if self.ctx.buffer.is_open()
                    && let Err(e) = self.ctx.buffer.push(&frame)
                {
                    self.abandon_utterance(&e);
                    return;
                }
                self.on_utterance_end(end);
            }
        }
    }

    fn open_utterance(&mut self, onset: &Frame) {
        let audio = match self.ctx.buffer.open(onset.sample_rate(), onset.channels()) {
            Ok(audio) => audio,
            Err(e) => {
                tracing::error!(session_id = %self.ctx.session_id, error = %e, "cannot open utterance");
                self.ctx.rejecting = true;
                return;
            }
        };
        let utterance_id = audio.utterance_id();
        self.ctx.report.utterances += 1;
        self.emit(SessionEvent::UtteranceOpened { utterance_id });

        self.spawn_recognition(utterance_id, audio);
        self.set_state(SessionState::Recognizing);

        let head = self.ctx.preroll.drain();
        for frame in head.iter().chain(std::iter::once(onset)) {
            if let Err(e) = self.ctx.buffer.push(frame) {
                self.abandon_utterance(&e);
                return;
            }
        }
    }

    fn on_utterance_end(&mut self, end: UtteranceEnd) {
        if self.ctx.rejecting {
            self.ctx.rejecting = false;
            return;
        }
        if !self.ctx.buffer.is_open() {
            return;
        }

        if !end.viable {
            if let Some(utterance) = self.ctx.buffer.discard() {
                tracing::debug!(
                    session_id = %self.ctx.session_id,
                    utterance_id = utterance.id,
                    speech_ms = end.speech_ms,
                    "utterance too short, discarded"
                );
                self.ctx.report.discarded += 1;
                self.emit(SessionEvent::UtteranceDiscarded {
                    utterance,
                    cause: None,
                });
            }
            if let Some(stage) = self.stage.take() {
                self.reap(stage);
            }
            self.set_state(SessionState::AwaitingUtterance);
            return;
        }

        let snapshot = self.ctx.buffer.current().cloned();
        match self.ctx.buffer.close() {
            Ok(utterance) => {
                tracing::info!(
                    session_id = %self.ctx.session_id,
                    utterance_id = utterance.id,
                    duration_ms = utterance.duration_ms,
                    reason = ?end.reason,
                    "utterance closed"
                );
                let timeout = Duration::from_millis(self.settings.recognition_timeout_ms);
                if let Some(stage) = self
                    .stage
                    .as_mut()
                    .filter(|s| s.stage == Stage::Recognition && s.utterance_id == utterance.id)
                {
                    stage.deadline = Some(Instant::now() + timeout);
                }
                self.emit(SessionEvent::UtteranceClosed { utterance });
            }
            Err(e) => {
                if let Some(mut utterance) = snapshot {
                    utterance.status = UtteranceStatus::Discarded;
                    self.discarded(utterance, e.kind());
                }
                self.fail_recognition(&e);
            }
        }
    }

    fn spawn_recognition(&mut self, utterance_id: u64, audio: AudioStream) {
        let cancel = self.ctx.cancel.child_token();
        let backend = Arc::clone(&self.recognizer);
        let events = self.events.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            recognize(backend, audio, task_cancel, events)
                .await
                .map(StageOutput::Transcript)
        });

        self.stage = Some(ActiveStage {
            stage: Stage::Recognition,
            utterance_id,
            cancel,
            // Armed once the utterance ends
            deadline: None,
            started: Instant::now(),
            handle,
        });
    }

    fn spawn_generation(&mut self, utterance_id: u64, transcript: String) {
        let cancel = self.ctx.cancel.child_token();
        let driver = Arc::clone(&self.driver);
        let transport = Arc::clone(&self.transport);
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let payload = DevicePayload::Transcript {
                text: transcript.clone(),
            };
            if let Err(e) = transport.publish(payload).await {
                tracing::warn!(error = %e, "failed to publish transcript");
            }
            let mut driver = driver.lock().await;
            driver
                .respond(&transcript, &task_cancel)
                .await
                .map(StageOutput::Response)
        });

        let timeout = Duration::from_millis(self.settings.generation_timeout_ms);
        let now = Instant::now();
        self.stage = Some(ActiveStage {
            stage: Stage::Generation,
            utterance_id,
            cancel,
            deadline: Some(now + timeout),
            started: now,
            handle,
        });
        self.set_state(SessionState::Generating);
    }

    fn on_stage_finished(&mut self, result: Result<StageOutput>) {
        let Some(stage) = self.stage.take() else {
            return;
        };
        let elapsed_ms = elapsed_ms(stage.started);

        match (stage.stage, result) {
            (Stage::Recognition, Ok(StageOutput::Transcript(Some(text)))) => {
                tracing::info!(
                    session_id = %self.ctx.session_id,
                    utterance_id = stage.utterance_id,
                    elapsed_ms,
                    "final transcript"
                );
                self.ctx.report.transcripts += 1;
                self.drop_rest_of_utterance();
                self.emit(SessionEvent::FinalTranscript {
                    utterance_id: stage.utterance_id,
                    text: text.clone(),
                });
                self.spawn_generation(stage.utterance_id, text);
            }
            (Stage::Recognition, Ok(_)) => {
                tracing::debug!(
                    session_id = %self.ctx.session_id,
                    utterance_id = stage.utterance_id,
                    "empty transcript, nothing to answer"
                );
                self.ctx.report.empty_transcripts += 1;
                self.drop_rest_of_utterance();
                self.set_state(SessionState::AwaitingUtterance);
            }
            (Stage::Generation, Ok(StageOutput::Response(outcome))) => {
                tracing::info!(
                    session_id = %self.ctx.session_id,
                    utterance_id = stage.utterance_id,
                    fragments = outcome.fragments_published,
                    fallback = outcome.fallback_used,
                    elapsed_ms,
                    "response completed"
                );
                self.ctx.report.responses += 1;
                self.emit(SessionEvent::ResponseCompleted {
                    utterance_id: stage.utterance_id,
                    fragments: outcome.fragments_published,
                    fallback_used: outcome.fallback_used,
                });
                self.set_state(SessionState::AwaitingUtterance);
            }
            (Stage::Generation, Ok(StageOutput::Transcript(_))) => {
                self.set_state(SessionState::AwaitingUtterance);
            }
            (Stage::Recognition, Err(e)) => {
                if let Some(mut utterance) = self.ctx.buffer.discard() {
                    utterance.status = UtteranceStatus::Discarded;
                    self.discarded(utterance, e.kind());
                }
                self.fail_recognition(&e);
            }
            (Stage::Generation, Err(e)) => {
                tracing::warn!(
                    session_id = %self.ctx.session_id,
                    utterance_id = stage.utterance_id,
                    error = %e,
                    "generation failed"
                );
                self.ctx.report.generation_failures += 1;
                self.emit(SessionEvent::StageFailed {
                    stage: Stage::Generation,
                    kind: e.kind(),
                });
                self.set_state(SessionState::AwaitingUtterance);
            }
        }
    }

    fn on_stage_timeout(&mut self) {
        let Some(stage) = self.stage.take() else {
            return;
        };
        let elapsed_ms = elapsed_ms(stage.started);
        let e = Error::Timeout {
            stage: stage.stage.as_str(),
            elapsed_ms,
        };
        tracing::warn!(
            session_id = %self.ctx.session_id,
            utterance_id = stage.utterance_id,
            error = %e,
            "stage timed out"
        );

        self.ctx.report.timeouts += 1;
        match stage.stage {
            Stage::Recognition => self.ctx.report.recognition_failures += 1,
            Stage::Generation => self.ctx.report.generation_failures += 1,
        }
        self.emit(SessionEvent::StageFailed {
            stage: stage.stage,
            kind: ErrorKind::Timeout,
        });
        self.reap(stage);
        self.set_state(SessionState::AwaitingUtterance);
    }

    fn abort(&mut self) {
        tracing::info!(session_id = %self.ctx.session_id, "abort requested");
        if let Some(utterance) = self.ctx.buffer.discard() {
            self.discarded(utterance, ErrorKind::Cancelled);
        }
        self.ctx.vad.reset();
        self.ctx.preroll.clear();
        self.ctx.rejecting = false;

        if let Some(stage) = self.stage.take() {
            self.emit(SessionEvent::StageFailed {
                stage: stage.stage,
                kind: ErrorKind::Cancelled,
            });
            self.reap(stage);
        }
        self.set_state(SessionState::AwaitingUtterance);
    }

    async fn close(&mut self, reason: CloseReason) {
        self.ctx.cancel.cancel();

        if let Some(stage) = self.stage.take() {
            let grace = Duration::from_millis(self.settings.cancel_grace_ms);
            let mut handle = stage.handle;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(
                    session_id = %self.ctx.session_id,
                    stage = stage.stage.as_str(),
                    "stage ignored cancellation, aborting"
                );
                handle.abort();
            }
        }
        if let Some(utterance) = self.ctx.buffer.discard() {
            self.discarded(utterance, ErrorKind::Cancelled);
        }
        self.ctx.preroll.clear();

        self.set_state(SessionState::Closed);
        self.ctx.report.close_reason = Some(reason);

        let goodbye = DevicePayload::Goodbye {
            reason: reason.to_string(),
        };
        if let Err(e) = self.transport.publish(goodbye).await {
            tracing::debug!(session_id = %self.ctx.session_id, error = %e, "goodbye not delivered");
        }
        self.emit(SessionEvent::Closed { reason });

        let report = &self.ctx.report;
        tracing::info!(
            session_id = %self.ctx.session_id,
            device_id = %self.ctx.device_id,
            reason = %reason,
            utterances = report.utterances,
            responses = report.responses,
            discarded = report.discarded,
            timeouts = report.timeouts,
            "session closed"
        );
    }

    /// Recognition failed or overflowed: drop the utterance, keep the session
    fn abandon_utterance(&mut self, e: &Error) {
        match e.kind() {
            ErrorKind::Overflow => tracing::warn!(
                session_id = %self.ctx.session_id,
                error = %e,
                "recognizer too slow, utterance dropped"
            ),
            _ => tracing::warn!(session_id = %self.ctx.session_id, error = %e, "utterance dropped"),
        }
        if let Some(utterance) = self.ctx.buffer.discard() {
            self.discarded(utterance, e.kind());
        }
        self.fail_recognition(e);
    }

    fn fail_recognition(&mut self, e: &Error) {
        if !matches!(e.kind(), ErrorKind::Cancelled) {
            tracing::warn!(session_id = %self.ctx.session_id, error = %e, "recognition failed");
        }
        self.ctx.rejecting = self.ctx.in_speech();
        self.ctx.report.recognition_failures += 1;
        self.emit(SessionEvent::StageFailed {
            stage: Stage::Recognition,
            kind: e.kind(),
        });
        if let Some(stage) = self.stage.take() {
            self.reap(stage);
        }
        self.set_state(SessionState::AwaitingUtterance);
    }

    /// Final transcript arrived before the segmenter closed the utterance
    fn drop_rest_of_utterance(&mut self) {
        if self.ctx.buffer.discard().is_some() {
            self.ctx.rejecting = self.ctx.in_speech();
        }
    }

    fn discarded(&mut self, utterance: Utterance, cause: ErrorKind) {
        self.ctx.report.discarded += 1;
        self.emit(SessionEvent::UtteranceDiscarded {
            utterance,
            cause: Some(cause),
        });
    }

    /// Cancel a stage and let it wind down off the session task
    fn reap(&self, stage: ActiveStage) {
        stage.cancel.cancel();
        let grace = Duration::from_millis(self.settings.cancel_grace_ms);
        let mut handle = stage.handle;
        let name = stage.stage.as_str();
        tokio::spawn(async move {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(stage = name, "stage ignored cancellation, aborting");
                handle.abort();
            }
        });
    }

    fn set_state(&mut self, to: SessionState) {
        if let Some(from) = self.ctx.transition(to) {
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Consume one recognition call, returning the final transcript if it has text
async fn recognize(
    backend: Arc<dyn RecognitionBackend>,
    audio: AudioStream,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
) -> Result<Option<String>> {
    let utterance_id = audio.utterance_id();
    let mut results = guard_finality(backend.recognize(audio, cancel.clone()).await?);

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            next = results.next() => next,
        };
        let Some(result) = next.transpose()? else {
            return Ok(None);
        };

        if result.is_final {
            let text = result.text.trim();
            return Ok((!text.is_empty()).then(|| text.to_string()));
        }
        if let Some(events) = &events {
            let _ = events.send(SessionEvent::PartialTranscript {
                utterance_id,
                text: result.text,
            });
        }
    }
}

async fn join_stage(stage: &mut Option<ActiveStage>) -> Result<StageOutput> {
    match stage {
        Some(active) => (&mut active.handle)
            .await
            .unwrap_or_else(|e| Err(Error::Session(format!("stage task failed: {e}")))),
        None => pending().await,
    }
}

async fn recv_command(control: &mut Option<mpsc::Receiver<SessionCommand>>) -> Option<SessionCommand> {
    match control {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
