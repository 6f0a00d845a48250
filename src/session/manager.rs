//! Registry of live device sessions

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{SessionCommand, SessionCoordinator, SessionParts, SessionReport};
use crate::audio::FrameSource;
use crate::config::{Config, GenerationSettings, RecognitionSettings};
use crate::generation::{GenerationBackend, GenerationRouter};
use crate::recognition::{RecognitionBackend, RecognitionRouter};
use crate::security::{Authenticator, Credentials};
use crate::transport::{ChannelTransport, DevicePayload};
use crate::vad::{EnergyClassifier, SpeechClassifier};
use crate::{Error, Result};

/// Payloads a device may fall behind on before publishes start waiting
const PAYLOAD_QUEUE: usize = 64;

/// Builds the backends for a new session
pub trait BackendProvider: Send + Sync {
    /// Recognition engine for one session
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the backend cannot be built
    fn recognition(&self, settings: &RecognitionSettings) -> Result<Arc<dyn RecognitionBackend>>;

    /// Language model for one session
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the backend cannot be built
    fn generation(&self, settings: &GenerationSettings) -> Result<Arc<dyn GenerationBackend>>;
}

/// Builds backends through the configured provider routers
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterBackends;

impl BackendProvider for RouterBackends {
    fn recognition(&self, settings: &RecognitionSettings) -> Result<Arc<dyn RecognitionBackend>> {
        RecognitionRouter::build(settings)
    }

    fn generation(&self, settings: &GenerationSettings) -> Result<Arc<dyn GenerationBackend>> {
        GenerationRouter::build(settings)
    }
}

/// Device-side end of a session
pub struct SessionHandle {
    pub session_id: String,
    pub device_id: String,
    payloads: mpsc::Receiver<DevicePayload>,
    control: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Next payload for the device, `None` once the session has closed
    pub async fn next_payload(&mut self) -> Option<DevicePayload> {
        self.payloads.recv().await
    }

    /// Ask the session to drop its current utterance and stage
    pub async fn abort(&self) {
        if self.control.send(SessionCommand::Abort).await.is_err() {
            tracing::debug!(session_id = %self.session_id, "abort after session closed");
        }
    }

    /// Whether the session has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct ActiveSession {
    session_id: String,
    cancel: CancellationToken,
    report: oneshot::Receiver<SessionReport>,
}

/// Creates, replaces and tears down device sessions
pub struct SessionManager {
    config: Arc<Config>,
    authenticator: Arc<dyn Authenticator>,
    backends: Arc<dyn BackendProvider>,
    classifier: Arc<dyn SpeechClassifier>,
    sessions: Arc<Mutex<HashMap<String, ActiveSession>>>,
}

impl SessionManager {
    /// Manager authenticating with `config.auth` and building backends
    /// through the provider routers
    #[must_use]
    pub fn new(config: Config) -> Self {
        let authenticator = Arc::new(config.auth.clone());
        Self::with_backends(config, authenticator, Arc::new(RouterBackends))
    }

    #[must_use]
    pub fn with_backends(
        config: Config,
        authenticator: Arc<dyn Authenticator>,
        backends: Arc<dyn BackendProvider>,
    ) -> Self {
        let classifier: Arc<dyn SpeechClassifier> =
            Arc::new(EnergyClassifier::new(config.vad.energy_threshold));
        Self {
            config: Arc::new(config),
            authenticator,
            backends,
            classifier,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a session for an authenticated device
    ///
    /// Backends are built before any audio is read, so a bad backend
    /// configuration fails the connection rather than the first utterance.
    /// A device that reconnects replaces its previous session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Auth` if the credentials are rejected and
    /// `Error::Config` if a backend cannot be built
    pub async fn connect<S>(&self, credentials: &Credentials, source: S) -> Result<SessionHandle>
    where
        S: FrameSource + 'static,
    {
        if !self.authenticator.authenticate(credentials).await {
            return Err(Error::Auth(format!(
                "device '{}' rejected",
                credentials.device_id
            )));
        }

        let recognizer = self.backends.recognition(&self.config.recognition)?;
        let generator = self.backends.generation(&self.config.generation)?;

        let publish_timeout = Duration::from_millis(self.config.server.publish_timeout_ms);
        let (transport, payloads) = ChannelTransport::channel(PAYLOAD_QUEUE, publish_timeout);
        let (control_tx, control_rx) = mpsc::channel(8);

        let device_id = credentials.device_id.clone();
        let coordinator = SessionCoordinator::new(
            device_id.clone(),
            &self.config,
            SessionParts {
                recognizer,
                generator,
                transport: Arc::new(transport),
                classifier: Arc::clone(&self.classifier),
            },
        )
        .with_control(control_rx);

        let session_id = coordinator.session_id().to_string();
        let cancel = coordinator.cancel_token();
        let (report_tx, report_rx) = oneshot::channel();

        {
            let mut sessions = self.sessions.lock().await;
            let previous = sessions.insert(
                device_id.clone(),
                ActiveSession {
                    session_id: session_id.clone(),
                    cancel: cancel.clone(),
                    report: report_rx,
                },
            );
            if let Some(previous) = previous {
                tracing::info!(
                    device_id = %device_id,
                    previous = %previous.session_id,
                    "device reconnected, replacing session"
                );
                previous.cancel.cancel();
            }
        }

        let sessions = Arc::clone(&self.sessions);
        let task_device = device_id.clone();
        let task_session = session_id.clone();
        tokio::spawn(async move {
            let result = coordinator.run(source).await;

            let mut sessions = sessions.lock().await;
            if sessions
                .get(&task_device)
                .is_some_and(|s| s.session_id == task_session)
            {
                sessions.remove(&task_device);
            }
            drop(sessions);

            match result {
                Ok(report) => {
                    let _ = report_tx.send(report);
                }
                Err(e) => {
                    tracing::error!(session_id = %task_session, error = %e, "session failed");
                }
            }
        });

        Ok(SessionHandle {
            session_id,
            device_id,
            payloads,
            control: control_tx,
            cancel,
        })
    }

    /// Cancel the device's session and wait for its report
    ///
    /// Returns `None` if the device has no session or it did not wind down
    /// in time.
    pub async fn disconnect(&self, device_id: &str) -> Option<SessionReport> {
        let session = self.sessions.lock().await.remove(device_id)?;
        session.cancel.cancel();
        tracing::info!(device_id, session_id = %session.session_id, "device disconnected");
        self.await_report(session).await
    }

    /// End the session behind `handle`
    ///
    /// A session that already ended, or was replaced by a newer connection
    /// from the same device, is left alone and yields `None`.
    pub async fn close(&self, handle: SessionHandle) -> Option<SessionReport> {
        handle.cancel.cancel();
        let session = {
            let mut sessions = self.sessions.lock().await;
            if !sessions
                .get(&handle.device_id)
                .is_some_and(|s| s.session_id == handle.session_id)
            {
                return None;
            }
            sessions.remove(&handle.device_id)?
        };
        self.await_report(session).await
    }

    /// Close every session
    pub async fn shutdown(&self) -> Vec<SessionReport> {
        let sessions: Vec<ActiveSession> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();

        let mut reports = Vec::with_capacity(sessions.len());
        for session in &sessions {
            session.cancel.cancel();
        }
        for session in sessions {
            if let Some(report) = self.await_report(session).await {
                reports.push(report);
            }
        }
        reports
    }

    /// Number of live sessions
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Devices with a live session
    pub async fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        devices.sort();
        devices
    }

    async fn await_report(&self, session: ActiveSession) -> Option<SessionReport> {
        let wait = Duration::from_millis(
            self.config.session.cancel_grace_ms + self.config.server.publish_timeout_ms,
        ) * 2;

        match tokio::time::timeout(wait, session.report).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(session_id = %session.session_id, "session did not close in time");
                None
            }
        }
    }
}
