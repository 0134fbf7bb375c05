//! Producers of change events consumed by a hub

pub mod channel;
pub mod postgres;

use async_trait::async_trait;

use crate::models::ChangeEvent;
use crate::Result;

pub use channel::ChannelSource;
pub use postgres::PgNotifySource;

/// A live sequence of change events.
///
/// `None` marks the end of the sequence; an `Err` is terminal for the
/// consumer reading this source.
#[async_trait]
pub trait ChangeSource: Send {
    async fn next_event(&mut self) -> Option<Result<ChangeEvent>>;

    /// Short label used in logs
    fn name(&self) -> &str {
        "source"
    }
}
