use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ChangeSource;
use crate::models::ChangeEvent;
use crate::Result;

/// In-process source fed through a bounded channel.
///
/// The sequence ends once every sender has been dropped.
pub struct ChannelSource {
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it
    #[must_use]
    pub fn new(capacity: usize) -> (mpsc::Sender<ChangeEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { receiver: rx })
    }

    #[must_use]
    pub const fn from_receiver(receiver: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl ChangeSource for ChannelSource {
    async fn next_event(&mut self) -> Option<Result<ChangeEvent>> {
        self.receiver.recv().await.map(Ok)
    }

    fn name(&self) -> &str {
        "channel"
    }
}
