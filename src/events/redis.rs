use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::{AsyncCommands, Client, aio::ConnectionManager};
use time::UtcDateTime;
use tracing::{info, warn};

use super::{ChannelError, EventChannel, Result, RevocationEvent};

/// Redis pub/sub propagation of revocation events across instances.
///
/// Publishing goes through the shared connection manager; subscribing uses a
/// dedicated connection per subscription, since a connection in subscriber
/// mode cannot serve regular commands.
#[derive(Clone)]
pub struct RedisChannel {
    conn: ConnectionManager,
    client: Client,
    channel: String,
}

impl RedisChannel {
    pub fn new(conn: ConnectionManager, client: Client, channel: impl Into<String>) -> Self {
        Self {
            conn,
            client,
            channel: channel.into(),
        }
    }

    async fn publish(&self, event: &RevocationEvent) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(&self.channel, event.encode())
            .await
            .map_err(|e| ChannelError::Publish(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EventChannel for RedisChannel {
    async fn publish_jti_revoked(&self, jti: &str, expires_at: UtcDateTime) -> Result<()> {
        self.publish(&RevocationEvent::JtiRevoked {
            jti: jti.to_string(),
            expires_at,
        })
        .await
    }

    async fn publish_user_revoked(
        &self,
        user_id: &str,
        revoked_before: UtcDateTime,
        expires_at: UtcDateTime,
    ) -> Result<()> {
        self.publish(&RevocationEvent::UserRevoked {
            user_id: user_id.to_string(),
            revoked_before,
            expires_at,
        })
        .await
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, RevocationEvent>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))?;
        info!(channel = %self.channel, "Subscribed to revocation events");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Unreadable revocation event payload");
                    return None;
                }
            };
            match RevocationEvent::parse(&payload) {
                Some(event) => Some(event),
                None => {
                    warn!(payload = %payload, "Dropping malformed revocation event");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
