use async_trait::async_trait;
use futures_util::stream::BoxStream;
use time::UtcDateTime;

mod memory;
mod redis;

pub use memory::MemoryChannel;
pub use redis::RedisChannel;

type Result<T> = std::result::Result<T, ChannelError>;

/// Errors from the event channel adapters.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel connection error: {0}")]
    Connection(String),

    #[error("Channel subscribe error: {0}")]
    Subscribe(String),

    #[error("Channel publish error: {0}")]
    Publish(String),
}

/// A revocation propagated between instances.
///
/// Closed set: the subscriber dispatch matches exhaustively, so a new shape
/// added here forces every handler to be updated rather than being silently
/// dropped. Events are transient; they are never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationEvent {
    JtiRevoked {
        jti: String,
        expires_at: UtcDateTime,
    },
    UserRevoked {
        user_id: String,
        revoked_before: UtcDateTime,
        expires_at: UtcDateTime,
    },
}

impl RevocationEvent {
    /// Encodes to the delimited wire form: `jti:<id>:<expiry-millis>` or
    /// `user:<id>:<cutoff-millis>:<expiry-millis>`. Deliberately schema-free
    /// to keep serialization overhead near zero.
    pub fn encode(&self) -> String {
        match self {
            Self::JtiRevoked { jti, expires_at } => {
                format!("jti:{jti}:{}", epoch_millis(*expires_at))
            }
            Self::UserRevoked {
                user_id,
                revoked_before,
                expires_at,
            } => format!(
                "user:{user_id}:{}:{}",
                epoch_millis(*revoked_before),
                epoch_millis(*expires_at)
            ),
        }
    }

    /// Parses the wire form. Returns `None` for anything malformed; the
    /// subscriber logs and drops those rather than crashing.
    ///
    /// Timestamps are split off the right so identifiers may contain colons.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(rest) = raw.strip_prefix("jti:") {
            let (jti, expiry) = rest.rsplit_once(':')?;
            if jti.is_empty() {
                return None;
            }
            return Some(Self::JtiRevoked {
                jti: jti.to_string(),
                expires_at: parse_millis(expiry)?,
            });
        }
        if let Some(rest) = raw.strip_prefix("user:") {
            let (rest, expiry) = rest.rsplit_once(':')?;
            let (user_id, cutoff) = rest.rsplit_once(':')?;
            if user_id.is_empty() {
                return None;
            }
            return Some(Self::UserRevoked {
                user_id: user_id.to_string(),
                revoked_before: parse_millis(cutoff)?,
                expires_at: parse_millis(expiry)?,
            });
        }
        None
    }
}

pub(crate) fn epoch_millis(t: UtcDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_epoch_millis(millis: i64) -> Option<UtcDateTime> {
    UtcDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

fn parse_millis(field: &str) -> Option<UtcDateTime> {
    from_epoch_millis(field.parse().ok()?)
}

/// Best-effort fan-out of revocations to other instances.
///
/// Never a correctness requirement: the store stays the ground truth and the
/// periodic filter rebuild bounds how long a dropped event can matter.
#[async_trait]
pub trait EventChannel: Send + Sync + Clone + 'static {
    /// Announces a token revocation. Fire-and-forget.
    async fn publish_jti_revoked(&self, jti: &str, expires_at: UtcDateTime) -> Result<()>;

    /// Announces a user-wide revocation. Fire-and-forget.
    async fn publish_user_revoked(
        &self,
        user_id: &str,
        revoked_before: UtcDateTime,
        expires_at: UtcDateTime,
    ) -> Result<()>;

    /// Opens a fresh subscription. The stream ends when the backing
    /// connection drops; callers resubscribe to continue.
    async fn subscribe(&self) -> Result<BoxStream<'static, RevocationEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jti_event_roundtrip() {
        let event = RevocationEvent::JtiRevoked {
            jti: "token-123".to_string(),
            expires_at: from_epoch_millis(1_700_000_000_000).unwrap(),
        };
        assert_eq!(event.encode(), "jti:token-123:1700000000000");
        assert_eq!(RevocationEvent::parse(&event.encode()), Some(event));
    }

    #[test]
    fn test_user_event_roundtrip() {
        let event = RevocationEvent::UserRevoked {
            user_id: "user-1".to_string(),
            revoked_before: from_epoch_millis(1_700_000_000_000).unwrap(),
            expires_at: from_epoch_millis(1_700_000_600_000).unwrap(),
        };
        assert_eq!(event.encode(), "user:user-1:1700000000000:1700000600000");
        assert_eq!(RevocationEvent::parse(&event.encode()), Some(event));
    }

    #[test]
    fn test_identifier_may_contain_colons() {
        let parsed = RevocationEvent::parse("jti:urn:example:42:1700000000000");
        assert_eq!(
            parsed,
            Some(RevocationEvent::JtiRevoked {
                jti: "urn:example:42".to_string(),
                expires_at: from_epoch_millis(1_700_000_000_000).unwrap(),
            })
        );
    }

    #[test]
    fn test_malformed_messages_are_rejected() {
        for raw in [
            "",
            "jti:",
            "jti:only-id",
            "jti:token:not-a-number",
            "user:u1:1700000000000",
            "session:x:1700000000000",
            ":token:1700000000000",
        ] {
            assert_eq!(RevocationEvent::parse(raw), None, "accepted {raw:?}");
        }
    }
}
