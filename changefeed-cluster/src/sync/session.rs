use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use changefeed_core::ChangeEvent;

use super::registry::{SubscriberRegistry, SubscriptionHandle, SubscriptionId};
use crate::error::{Error, Result};

/// Failure reported by a consumer sink; ends that session only
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("Sink closed by consumer")]
    Closed,

    #[error("Sink transport error: {0}")]
    Transport(String),
}

/// Per-consumer destination a session writes events to
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: &ChangeEvent) -> std::result::Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Registered,
    Draining,
    Closed,
}

/// Why [`StreamSession::serve`] stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Cancelled,
    SinkFailed(String),
    /// The registry closed the channel, e.g. on hub shutdown
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SubscriptionId,
    pub delivered: u64,
    pub dropped: u64,
    pub reason: EndReason,
}

/// One connected consumer.
///
/// Registers a channel on start, forwards every event it receives to the
/// sink, and deregisters on termination. Queued events that were not yet
/// delivered when the session closes are discarded.
pub struct StreamSession<S: EventSink> {
    registry: Arc<SubscriberRegistry>,
    sink: S,
    handle: Option<SubscriptionHandle>,
    state: SessionState,
    delivered: u64,
}

impl<S: EventSink> StreamSession<S> {
    pub fn new(registry: Arc<SubscriberRegistry>, sink: S) -> Self {
        Self {
            registry,
            sink,
            handle: None,
            state: SessionState::Idle,
            delivered: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn id(&self) -> Option<SubscriptionId> {
        self.handle.as_ref().map(SubscriptionHandle::id)
    }

    #[must_use]
    pub const fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn register(&mut self) -> Result<SubscriptionId> {
        if self.state != SessionState::Idle {
            return Err(Error::InvalidState(format!(
                "cannot register a session in state {:?}",
                self.state
            )));
        }

        let handle = self.registry.register();
        let id = handle.id();
        self.handle = Some(handle);
        self.state = SessionState::Registered;
        Ok(id)
    }

    /// Forward events to the sink until cancellation, sink failure or
    /// channel closure. Leaves the session in `Draining`.
    pub async fn serve(&mut self, cancel: &CancellationToken) -> Result<EndReason> {
        if self.state != SessionState::Registered {
            return Err(Error::InvalidState(format!(
                "cannot serve a session in state {:?}",
                self.state
            )));
        }
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::InvalidState("registered session has no channel".to_string()));
        };
        let id = handle.id();

        let reason = loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => break EndReason::Cancelled,
                event = handle.recv() => event,
            };

            let Some(event) = event else {
                break EndReason::ChannelClosed;
            };

            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => break EndReason::Cancelled,
                sent = self.sink.send(&event) => sent,
            };

            match sent {
                Ok(()) => self.delivered += 1,
                Err(e) => {
                    warn!(subscription_id = %id, error = %e, "Sink failed, ending session");
                    break EndReason::SinkFailed(e.to_string());
                }
            }
        };

        debug!(subscription_id = %id, reason = ?reason, "Session stopped serving");
        self.state = SessionState::Draining;
        Ok(reason)
    }

    /// Deregister and close the channel. Returns the number of events dropped
    /// for this session while it was registered.
    pub fn close(&mut self) -> u64 {
        let dropped = match self.handle.take() {
            Some(handle) => {
                self.registry.deregister(handle.id());
                handle.dropped()
            }
            None => 0,
        };
        self.state = SessionState::Closed;
        dropped
    }

    /// Register, serve until `cancel` or failure, then close
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SessionSummary> {
        let id = self.register()?;
        let reason = self.serve(&cancel).await?;
        let dropped = self.close();

        info!(
            subscription_id = %id,
            delivered = self.delivered,
            dropped = dropped,
            reason = ?reason,
            "Session ended"
        );

        Ok(SessionSummary {
            id,
            delivered: self.delivered,
            dropped,
            reason,
        })
    }
}

impl<S: EventSink> Drop for StreamSession<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry.deregister(handle.id());
        }
    }
}
