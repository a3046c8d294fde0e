use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use time::UtcDateTime;
use tokio::sync::RwLock;

/// Process-local cache of revocations already confirmed by the store.
///
/// Only positive confirmations are ever stored. Caching "not revoked" would
/// require invalidating it on every revocation anywhere in the fleet, which
/// is exactly the consistency problem the membership filter avoids; a filter
/// false positive merely costs one extra store lookup, while a stale cached
/// negative would be a security hole.
#[derive(Debug, Clone)]
pub struct ConfirmedCache {
    jtis: Arc<RwLock<LruCache<String, JtiEntry>>>,
    users: Arc<RwLock<LruCache<String, UserEntry>>>,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
struct JtiEntry {
    expires_at: UtcDateTime,
}

#[derive(Debug, Clone, Copy)]
struct UserEntry {
    /// Tokens issued strictly before this instant are revoked.
    revoked_before: UtcDateTime,
    expires_at: UtcDateTime,
}

impl ConfirmedCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).unwrap();
        Self {
            jtis: Arc::new(RwLock::new(LruCache::new(capacity))),
            users: Arc::new(RwLock::new(LruCache::new(capacity))),
            ttl,
        }
    }

    fn entry_expiry(&self) -> UtcDateTime {
        UtcDateTime::now().saturating_add(
            time::Duration::try_from(self.ttl).unwrap_or(time::Duration::ZERO),
        )
    }

    /// Records a store-confirmed token revocation.
    pub async fn confirm_jti(&self, jti: &str) {
        let entry = JtiEntry {
            expires_at: self.entry_expiry(),
        };
        self.jtis.write().await.put(jti.to_string(), entry);
    }

    /// Records a store-confirmed user-wide revocation for tokens issued
    /// strictly before `revoked_before`.
    pub async fn confirm_user(&self, user_id: &str, revoked_before: UtcDateTime) {
        let entry = UserEntry {
            revoked_before,
            expires_at: self.entry_expiry(),
        };
        let mut users = self.users.write().await;
        // A later cutoff supersedes an earlier one, never the other way round.
        match users.get(user_id) {
            Some(existing) if existing.revoked_before >= revoked_before => {}
            _ => {
                users.put(user_id.to_string(), entry);
            }
        }
    }

    /// `true` means the store confirmed this token id as revoked recently.
    /// `false` is not authoritative; the caller falls through to the store.
    pub async fn is_jti_confirmed(&self, jti: &str) -> bool {
        let now = UtcDateTime::now();
        let mut jtis = self.jtis.write().await;
        match jtis.get(jti) {
            Some(entry) if entry.expires_at > now => true,
            Some(_) => {
                jtis.pop(jti);
                false
            }
            None => false,
        }
    }

    /// `true` means a confirmed user-wide revocation covers a token issued
    /// at `issued_at`.
    pub async fn is_user_confirmed(&self, user_id: &str, issued_at: UtcDateTime) -> bool {
        let now = UtcDateTime::now();
        let mut users = self.users.write().await;
        match users.get(user_id) {
            Some(entry) if entry.expires_at > now => issued_at < entry.revoked_before,
            Some(_) => {
                users.pop(user_id);
                false
            }
            None => false,
        }
    }

    pub async fn jti_len(&self) -> usize {
        self.jtis.read().await.len()
    }

    pub async fn user_len(&self) -> usize {
        self.users.read().await.len()
    }
}
