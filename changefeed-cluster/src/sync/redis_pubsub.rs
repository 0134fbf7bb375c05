use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::medium::{PubSubMedium, SUBSCRIPTION_BUFFER};
use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Redis Pub/Sub medium.
///
/// Publishing goes through a shared auto-reconnecting connection. Each
/// subscription holds its own dedicated Pub/Sub connection; when that
/// connection drops the subscription's receiver ends and the relay
/// resubscribes.
pub struct RedisMedium {
    redis_client: RedisClient,
    publisher: ConnectionManager,
    op_timeout: Duration,
    cancel_token: CancellationToken,
}

impl RedisMedium {
    /// Connect to `redis_url`, failing if Redis is unreachable within `connect_timeout`
    pub async fn connect(redis_url: &str, connect_timeout: Duration) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url)?;

        let publisher = timeout(connect_timeout, ConnectionManager::new(redis_client.clone()))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to Redis at {redis_url}")))??;

        info!("Redis relay medium connected");

        Ok(Self {
            redis_client,
            publisher,
            op_timeout: Duration::from_secs(REDIS_TIMEOUT_SECS),
            cancel_token: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl PubSubMedium for RedisMedium {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut conn = self.publisher.clone();
        let receivers: usize = timeout(self.op_timeout, conn.publish(topic, payload))
            .await
            .map_err(|_| Error::Timeout(format!("publishing to {topic}")))??;

        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut pubsub = timeout(self.op_timeout, self.redis_client.get_async_pubsub())
            .await
            .map_err(|_| Error::Timeout("getting Redis Pub/Sub connection".to_string()))??;

        timeout(self.op_timeout, pubsub.subscribe(topic))
            .await
            .map_err(|_| Error::Timeout(format!("subscribing to {topic}")))??;

        info!(topic = %topic, "Redis subscriber connected");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = self.cancel_token.clone();
        let topic = topic.to_string();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();

            loop {
                let msg = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(topic = %topic, "Redis subscriber closed");
                        return;
                    }
                    () = tx.closed() => {
                        debug!(topic = %topic, "Redis subscription receiver dropped");
                        return;
                    }
                    msg = stream.next() => msg,
                };

                let Some(msg) = msg else {
                    // Stream returned None -- the Redis connection was lost
                    warn!(topic = %topic, "Redis subscription stream ended");
                    return;
                };

                if tx.send(msg.get_payload_bytes().to_vec()).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) {
        info!("Closing Redis relay medium");
        self.cancel_token.cancel();
    }
}
