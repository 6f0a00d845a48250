//! Device WebSocket endpoint
//!
//! `GET /voice/{device_id}?token=...` upgrades to a socket where binary
//! messages carry PCM16 little-endian audio and text messages carry JSON
//! control (`{"type":"abort"}`, `{"type":"goodbye"}`). Everything the
//! session publishes comes back as JSON text.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        ConnectInfo, Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::ApiState;
use crate::audio::{ChannelFrameSource, Frame};
use crate::security::Credentials;
use crate::session::SessionHandle;
use crate::transport::DevicePayload;
use crate::{Error, ErrorKind};

/// Frames a device may get ahead of the session
const FRAME_QUEUE: usize = 64;

/// Optional query parameters for the device connection
#[derive(Debug, Deserialize)]
struct VoiceQuery {
    token: Option<String>,
}

/// Control message from a device
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Drop the current utterance and response
    Abort,
    /// No more audio; finish in-flight work, then close
    Goodbye,
}

/// Build device router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/voice/{device_id}", get(voice_upgrade))
        .with_state(state)
}

/// Authenticate and start the session before upgrading, so that rejected
/// devices get a plain HTTP status
async fn voice_upgrade(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
    Query(query): Query<VoiceQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let mut credentials = Credentials::device(device_id).with_remote(remote.ip());
    if let Some(token) = query.token {
        credentials = credentials.with_token(token);
    }

    let (frames, source) = ChannelFrameSource::channel(FRAME_QUEUE);
    let handle = match state.manager.connect(&credentials, source).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(device_id = %credentials.device_id, error = %e, "device connection refused");
            return (status_for(&e), e.to_string()).into_response();
        }
    };

    tracing::info!(
        device_id = %handle.device_id,
        session_id = %handle.session_id,
        remote = %remote,
        "device connected"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, handle, frames))
}

const fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        _ => match e.kind() {
            ErrorKind::Config => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

/// Pump audio in and payloads out until either side is done
async fn handle_socket(
    socket: WebSocket,
    state: Arc<ApiState>,
    mut handle: SessionHandle,
    frames: mpsc::Sender<Frame>,
) {
    let (mut sender, mut receiver) = socket.split();
    let server = &state.manager.config().server;
    let (sample_rate, channels) = (server.sample_rate, server.channels);

    let mut frames = Some(frames);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            payload = handle.next_payload() => {
                let Some(payload) = payload else { break };
                let last = matches!(payload, DevicePayload::Goodbye { .. });
                match serde_json::to_string(&payload) {
                    Ok(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode payload"),
                }
                if last {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    let Some(tx) = &frames else { continue };
                    let frame = Frame::from_pcm16_le(seq, sample_rate, channels, &bytes);
                    seq += 1;
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<DeviceMessage>(text.as_str()) {
                    Ok(DeviceMessage::Abort) => handle.abort().await,
                    Ok(DeviceMessage::Goodbye) => {
                        tracing::debug!(session_id = %handle.session_id, "device said goodbye");
                        // Ending the frame source lets in-flight work finish
                        frames = None;
                    }
                    Err(e) => tracing::warn!(error = %e, "invalid device message"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(session_id = %handle.session_id, "socket closed by device");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %handle.session_id, error = %e, "socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    drop(frames);
    let session_id = handle.session_id.clone();
    if let Some(report) = state.manager.close(handle).await {
        tracing::info!(
            session_id = %session_id,
            utterances = report.utterances,
            responses = report.responses,
            "device disconnected"
        );
    }
}
