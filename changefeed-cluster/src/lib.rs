pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    Broadcaster, ChangeHub, DistributedRelay, EndReason, EventSink, HubConfig, HubStats,
    MemoryMedium, PubSubMedium, RedisMedium, SessionSummary, SinkError, SourceExit,
    StreamSession, SubscriberRegistry, SubscriptionHandle, SubscriptionId,
};
