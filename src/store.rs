use ::redis::RedisError;
use async_trait::async_trait;
use color_eyre::Report;
use std::error::Error as StdError;
use std::fmt;
use time::UtcDateTime;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

type Result<T> = std::result::Result<T, StoreError>;

/// Error type for revocation store operations.
#[derive(Debug)]
pub struct StoreError {
    error: Report,
}

impl StoreError {
    pub fn new<T>(error: T) -> Self
    where
        T: StdError + Send + Sync + 'static,
    {
        Self {
            error: Report::new(error),
        }
    }

    pub fn msg<T>(message: T) -> Self
    where
        T: fmt::Debug + fmt::Display + Send + Sync + 'static,
    {
        Self {
            error: Report::msg(message),
        }
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl From<RedisError> for StoreError {
    fn from(error: RedisError) -> Self {
        Self {
            error: Report::new(error),
        }
    }
}

/// Abstract interface for the authoritative revocation store.
///
/// Records self-expire per the supplied expiry; every operation is
/// non-blocking and should degrade gracefully (timeout, not hang) when the
/// backend is down. The check path treats this store as ground truth.
#[async_trait]
pub trait RevocationStore: Send + Sync + Clone + 'static {
    /// Marks a token id as revoked until the token would expire on its own.
    ///
    /// Idempotent; revoking an already-expired token is a no-op.
    async fn revoke(&self, jti: &str, expires_at: UtcDateTime) -> Result<()>;

    /// Checks whether the token id is currently revoked.
    async fn is_revoked(&self, jti: &str) -> Result<bool>;

    /// Marks every token of `user_id` issued strictly before `revoked_before`
    /// as revoked. The record lives until `expires_at`, the expiry of the
    /// longest-lived token it could still affect.
    async fn revoke_all_for_user(
        &self,
        user_id: &str,
        revoked_before: UtcDateTime,
        expires_at: UtcDateTime,
    ) -> Result<()>;

    /// Checks whether a token issued at `issued_at` falls under an active
    /// user-wide revocation.
    async fn is_user_revoked(&self, user_id: &str, issued_at: UtcDateTime) -> Result<bool>;

    /// Lists every currently revoked token id. Finite; used by the filter
    /// rebuild, which holds the listing in memory by design.
    async fn all_revoked_jtis(&self) -> Result<Vec<String>>;

    /// Lists every user id with an active user-wide revocation.
    async fn all_revoked_users(&self) -> Result<Vec<String>>;
}
