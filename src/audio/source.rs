//! Frame sources

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Frame;

/// Supplies frames for one device session
///
/// `None` means end of stream. Implementations must be cancel-safe: the
/// session loop polls `next_frame` inside `tokio::select!`.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame
    async fn next_frame(&mut self) -> Option<Frame>;
}

/// Frame source fed through an mpsc channel
///
/// The device edge owns the sender; dropping it ends the stream.
pub struct ChannelFrameSource {
    rx: mpsc::Receiver<Frame>,
}

impl ChannelFrameSource {
    /// Create a source and the sender that feeds it
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Frame>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// Wrap an existing receiver
    #[must_use]
    pub const fn new(rx: mpsc::Receiver<Frame>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl FrameSource for ChannelFrameSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}
