//! Device-bound payloads and the transport that delivers them

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::generation::ToolCall;
use crate::{Error, Result};

/// Payload pushed to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DevicePayload {
    /// Session accepted
    Hello { session_id: String },
    /// Final transcript of the device's utterance
    Transcript { text: String },
    /// Response text chunk (streamed)
    ResponseText { content: String },
    /// Tool invocation requested by the model
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// Response complete
    ResponseEnd,
    /// Session closing
    Goodbye { reason: String },
}

impl From<ToolCall> for DevicePayload {
    fn from(call: ToolCall) -> Self {
        Self::ToolCall {
            id: call.id,
            name: call.name,
            arguments: call.arguments,
        }
    }
}

/// Delivers payloads to one device
///
/// Publishing is bounded: a device that stops reading must not stall the
/// pipeline.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Send one payload
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the payload was dropped
    async fn publish(&self, payload: DevicePayload) -> Result<()>;
}

/// Transport over an mpsc channel drained by the device edge
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<DevicePayload>,
    send_timeout: Duration,
}

impl ChannelTransport {
    /// Create a transport and the receiver the edge drains
    #[must_use]
    pub fn channel(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<DevicePayload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, send_timeout }, rx)
    }
}

#[async_trait]
impl DeviceTransport for ChannelTransport {
    async fn publish(&self, payload: DevicePayload) -> Result<()> {
        match self.tx.send_timeout(payload, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(payload)) => {
                tracing::warn!(?payload, "device not reading, payload dropped");
                Err(Error::transport("device publish timed out"))
            }
            Err(SendTimeoutError::Closed(_)) => Err(Error::transport("device channel closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_are_tagged_json() {
        let json = serde_json::to_value(DevicePayload::ResponseText {
            content: "hi".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "response_text", "content": "hi"}));

        let end = serde_json::to_string(&DevicePayload::ResponseEnd).unwrap();
        assert_eq!(end, r#"{"type":"response_end"}"#);
    }

    #[tokio::test]
    async fn publish_delivers_in_order() {
        let (transport, mut rx) = ChannelTransport::channel(4, Duration::from_millis(50));
        transport
            .publish(DevicePayload::Transcript { text: "a".into() })
            .await
            .unwrap();
        transport.publish(DevicePayload::ResponseEnd).await.unwrap();

        assert_eq!(rx.recv().await, Some(DevicePayload::Transcript { text: "a".into() }));
        assert_eq!(rx.recv().await, Some(DevicePayload::ResponseEnd));
    }

    #[tokio::test]
    async fn full_channel_times_out() {
        let (transport, _rx) = ChannelTransport::channel(1, Duration::from_millis(20));
        transport.publish(DevicePayload::ResponseEnd).await.unwrap();

        let err = transport.publish(DevicePayload::ResponseEnd).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn closed_channel_is_error() {
        let (transport, rx) = ChannelTransport::channel(1, Duration::from_millis(20));
        drop(rx);
        assert!(transport.publish(DevicePayload::ResponseEnd).await.is_err());
    }
}
