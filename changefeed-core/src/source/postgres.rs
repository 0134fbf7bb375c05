use async_trait::async_trait;
use sqlx::postgres::PgListener;
use tracing::{debug, info, warn};

use super::ChangeSource;
use crate::metrics;
use crate::models::ChangeEvent;
use crate::{Error, Result};

/// Change source backed by PostgreSQL `LISTEN`/`NOTIFY`.
///
/// Each notification on the configured channel must carry a JSON encoded
/// [`ChangeEvent`], typically emitted by a row trigger calling
/// `pg_notify(channel, json)`. Malformed payloads are skipped.
pub struct PgNotifySource {
    listener: PgListener,
    channel: String,
}

impl PgNotifySource {
    /// Connect to `database_url` and start listening on `channel`
    pub async fn connect(database_url: &str, channel: &str) -> Result<Self> {
        let mut listener = PgListener::connect(database_url).await?;
        listener.listen(channel).await?;

        info!(channel = %channel, "Listening for change notifications");

        Ok(Self {
            listener,
            channel: channel.to_string(),
        })
    }

    /// Decode one notification payload
    fn decode(payload: &str) -> Result<ChangeEvent> {
        if payload.is_empty() {
            return Err(Error::InvalidEvent("empty notification payload".to_string()));
        }
        ChangeEvent::from_json(payload.as_bytes())
    }
}

#[async_trait]
impl ChangeSource for PgNotifySource {
    async fn next_event(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            match self.listener.try_recv().await {
                Ok(Some(notification)) => match Self::decode(notification.payload()) {
                    Ok(event) => {
                        debug!(
                            channel = %self.channel,
                            table = %event.table(),
                            operation = %event.operation(),
                            "Received change notification"
                        );
                        return Some(Ok(event));
                    }
                    Err(e) => {
                        metrics::source::MALFORMED_NOTIFICATIONS.inc();
                        warn!(
                            error = %e,
                            channel = %self.channel,
                            "Skipping malformed change notification"
                        );
                    }
                },
                // Connection dropped; the next call to try_recv reconnects and
                // re-issues LISTEN. Notifications sent meanwhile are lost.
                Ok(None) => {
                    warn!(channel = %self.channel, "Notification connection lost, reconnecting");
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
