use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use time::UtcDateTime;

use super::{Result, RevocationStore, StoreError};
use crate::events::{epoch_millis, from_epoch_millis};

const JTI_PREFIX: &str = "revoked:jti:";
const USER_PREFIX: &str = "revoked:user:";

/// A Redis-backed revocation store.
///
/// Token revocations are `SET ... EX` keys that Redis expires on its own;
/// user-wide revocations store the cutoff as epoch milliseconds in the value.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Creates a new Redis store from a connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn ttl_seconds(expires_at: UtcDateTime) -> Option<u64> {
        let remaining = (expires_at - UtcDateTime::now()).whole_seconds();
        (remaining > 0).then_some(remaining as u64)
    }
}

#[async_trait]
impl RevocationStore for RedisStore {
    async fn revoke(&self, jti: &str, expires_at: UtcDateTime) -> Result<()> {
        // An already-expired token self-revokes; nothing to record.
        let Some(ttl) = Self::ttl_seconds(expires_at) else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(format!("{JTI_PREFIX}{jti}"), 1u8, ttl).await?;
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists = conn.exists(format!("{JTI_PREFIX}{jti}")).await?;
        Ok(exists)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: &str,
        revoked_before: UtcDateTime,
        expires_at: UtcDateTime,
    ) -> Result<()> {
        let Some(ttl) = Self::ttl_seconds(expires_at) else {
            return Ok(());
        };
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                format!("{USER_PREFIX}{user_id}"),
                epoch_millis(revoked_before),
                ttl,
            )
            .await?;
        Ok(())
    }

    async fn is_user_revoked(&self, user_id: &str, issued_at: UtcDateTime) -> Result<bool> {
        let mut conn = self.conn.clone();
        let cutoff: Option<i64> = conn.get(format!("{USER_PREFIX}{user_id}")).await?;
        match cutoff {
            Some(millis) => {
                let revoked_before = from_epoch_millis(millis).ok_or_else(|| {
                    StoreError::msg(format!("corrupt user revocation cutoff: {millis}"))
                })?;
                Ok(issued_at < revoked_before)
            }
            None => Ok(false),
        }
    }

    async fn all_revoked_jtis(&self) -> Result<Vec<String>> {
        scan_ids(self.conn.clone(), JTI_PREFIX).await
    }

    async fn all_revoked_users(&self) -> Result<Vec<String>> {
        scan_ids(self.conn.clone(), USER_PREFIX).await
    }
}

/// Collects every identifier under `prefix` via SCAN, so the full listing
/// never blocks the Redis server the way KEYS would.
async fn scan_ids(mut conn: ConnectionManager, prefix: &str) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let mut iter = conn.scan_match::<_, String>(format!("{prefix}*")).await?;
    while let Some(key) = iter.next_item().await {
        if let Some(id) = key.strip_prefix(prefix) {
            ids.push(id.to_string());
        }
    }
    Ok(ids)
}
