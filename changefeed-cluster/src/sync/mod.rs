// Module: sync

pub mod broadcaster;
pub mod hub;
pub mod medium;
pub mod redis_pubsub;
pub mod registry;
pub mod relay;
pub mod session;

pub use broadcaster::{BroadcastStats, Broadcaster, PublishReport};
pub use hub::{ChangeHub, HubConfig, HubStats, SourceExit};
pub use medium::{MemoryMedium, PubSubMedium};
pub use redis_pubsub::RedisMedium;
pub use registry::{
    EventReceiver, EventSender, Subscriber, SubscriberRegistry, SubscriptionHandle,
    SubscriptionId, DEFAULT_CHANNEL_CAPACITY,
};
pub use relay::DistributedRelay;
pub use session::{EndReason, EventSink, SessionState, SessionSummary, SinkError, StreamSession};
