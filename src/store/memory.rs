use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use time::UtcDateTime;

use super::{Result, RevocationStore, StoreError};

/// An in-memory revocation store.
///
/// Useful for testing and development. Expired records are dropped lazily on
/// read, mirroring the TTL behavior of the Redis adapter.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    jtis: Arc<DashMap<String, UtcDateTime>>,
    users: Arc<DashMap<String, UserRecord>>,
    failing: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy)]
struct UserRecord {
    revoked_before: UtcDateTime,
    expires_at: UtcDateTime,
}

impl MemoryStore {
    /// Makes every operation fail, simulating an unreachable backend.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(StoreError::msg("revocation store unavailable"));
        }
        Ok(())
    }
}

fn is_active(expires_at: UtcDateTime) -> bool {
    expires_at > UtcDateTime::now()
}

#[async_trait]
impl RevocationStore for MemoryStore {
    async fn revoke(&self, jti: &str, expires_at: UtcDateTime) -> Result<()> {
        self.check_available()?;
        if is_active(expires_at) {
            self.jtis.insert(jti.to_string(), expires_at);
        }
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        self.check_available()?;
        if let Some(expires_at) = self.jtis.get(jti).map(|r| *r.value()) {
            if is_active(expires_at) {
                return Ok(true);
            }
            self.jtis.remove(jti);
        }
        Ok(false)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: &str,
        revoked_before: UtcDateTime,
        expires_at: UtcDateTime,
    ) -> Result<()> {
        self.check_available()?;
        if is_active(expires_at) {
            self.users.insert(
                user_id.to_string(),
                UserRecord {
                    revoked_before,
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn is_user_revoked(&self, user_id: &str, issued_at: UtcDateTime) -> Result<bool> {
        self.check_available()?;
        if let Some(record) = self.users.get(user_id).map(|r| *r.value()) {
            if is_active(record.expires_at) {
                return Ok(issued_at < record.revoked_before);
            }
            self.users.remove(user_id);
        }
        Ok(false)
    }

    async fn all_revoked_jtis(&self) -> Result<Vec<String>> {
        self.check_available()?;
        self.jtis.retain(|_, expires_at| is_active(*expires_at));
        Ok(self.jtis.iter().map(|r| r.key().clone()).collect())
    }

    async fn all_revoked_users(&self) -> Result<Vec<String>> {
        self.check_available()?;
        self.users.retain(|_, record| is_active(record.expires_at));
        Ok(self.users.iter().map(|r| r.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn hour_from_now() -> UtcDateTime {
        UtcDateTime::now().saturating_add(Duration::hours(1))
    }

    #[tokio::test]
    async fn test_memory_store_flow() {
        let store = MemoryStore::default();
        assert!(!store.is_revoked("token-1").await.unwrap());
        store.revoke("token-1", hour_from_now()).await.unwrap();
        assert!(store.is_revoked("token-1").await.unwrap());
        assert_eq!(store.all_revoked_jtis().await.unwrap(), vec!["token-1"]);
    }

    #[tokio::test]
    async fn test_expired_revocation_is_a_noop() {
        let store = MemoryStore::default();
        let past = UtcDateTime::now().saturating_sub(Duration::minutes(1));
        store.revoke("token-1", past).await.unwrap();
        assert!(!store.is_revoked("token-1").await.unwrap());
        assert!(store.all_revoked_jtis().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_revocation_cutoff() {
        let store = MemoryStore::default();
        let cutoff = UtcDateTime::now();
        store
            .revoke_all_for_user("user-1", cutoff, hour_from_now())
            .await
            .unwrap();

        let before = cutoff.saturating_sub(Duration::minutes(1));
        let after = cutoff.saturating_add(Duration::minutes(1));
        assert!(store.is_user_revoked("user-1", before).await.unwrap());
        assert!(!store.is_user_revoked("user-1", after).await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_store_errors_every_operation() {
        let store = MemoryStore::default();
        store.set_failing(true);
        assert!(store.is_revoked("token-1").await.is_err());
        assert!(store.revoke("token-1", hour_from_now()).await.is_err());
        assert!(store.all_revoked_jtis().await.is_err());
    }
}
