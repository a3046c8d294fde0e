use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use time::UtcDateTime;
use tokio::sync::broadcast;
use tracing::warn;

use super::{EventChannel, Result, RevocationEvent};

const CHANNEL_CAPACITY: usize = 256;

/// An in-process event channel over a broadcast queue.
///
/// Useful for testing and single-instance deployments.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    tx: broadcast::Sender<RevocationEvent>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

#[async_trait]
impl EventChannel for MemoryChannel {
    async fn publish_jti_revoked(&self, jti: &str, expires_at: UtcDateTime) -> Result<()> {
        // No subscribers is fine; delivery is best-effort.
        let _ = self.tx.send(RevocationEvent::JtiRevoked {
            jti: jti.to_string(),
            expires_at,
        });
        Ok(())
    }

    async fn publish_user_revoked(
        &self,
        user_id: &str,
        revoked_before: UtcDateTime,
        expires_at: UtcDateTime,
    ) -> Result<()> {
        let _ = self.tx.send(RevocationEvent::UserRevoked {
            user_id: user_id.to_string(),
            revoked_before,
            expires_at,
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, RevocationEvent>> {
        let rx = self.tx.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Dropped events are recovered by the next rebuild.
                        warn!(skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
