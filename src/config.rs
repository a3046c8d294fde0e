use std::{collections::HashMap, time::Duration};

use config::{Config as ConfigLib, ConfigError, Environment, File};
use redis::{
    Client as RedisClient, RedisResult,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub revocation: RevocationConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

/// Tuning knobs for the revocation check path.
#[derive(Debug, Clone, Deserialize)]
pub struct RevocationConfig {
    /// Master switch. When disabled, every check reports "not revoked".
    pub enabled: bool,
    /// Whether user-wide revocations are checked in addition to per-token ones.
    pub check_user_revocation: bool,
    /// Tokens expiring within this window skip every tier (0 disables the shortcut).
    pub check_threshold_secs: u64,
    /// Expected number of revoked token ids the membership filter is sized for.
    pub expected_insertions: usize,
    /// Target false-positive probability for the membership filters.
    pub false_positive_probability: f64,
    /// How often the filters are rebuilt from the store.
    pub rebuild_interval_secs: u64,
    /// Capacity of each confirmed-revocation cache (token ids and user ids).
    pub cache_max_size: usize,
    /// How long a confirmed revocation stays cached locally.
    pub cache_ttl_secs: u64,
    /// Deadline for a single store or event-channel round-trip.
    pub operation_timeout_millis: u64,
    /// What a check concludes when the store cannot answer.
    pub failure_policy: FailurePolicy,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    pub enabled: bool,
    pub channel_name: String,
}

/// What a check should conclude when the authoritative store cannot answer:
/// permit the token (favor availability) or treat it as revoked (favor
/// security). A per-deployment policy, deliberately not hardcoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Open,
    Closed,
}

impl RevocationConfig {
    pub fn check_threshold(&self) -> Duration {
        Duration::from_secs(self.check_threshold_secs)
    }

    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.rebuild_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_millis)
    }
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_user_revocation: true,
            check_threshold_secs: 30,
            expected_insertions: 100_000,
            false_positive_probability: 0.001,
            rebuild_interval_secs: 3600,
            cache_max_size: 10_000,
            cache_ttl_secs: 300,
            operation_timeout_millis: 2_000,
            failure_policy: FailurePolicy::Open,
            events: EventsConfig {
                enabled: true,
                channel_name: "revocations".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub uri: SecretString,
}

impl RedisConfig {
    /// Opens a Redis client for the configured URI.
    ///
    /// - To enable TLS, the URI must use the `rediss://` scheme.
    /// - To enable insecure TLS, the URI must use the `rediss://` scheme and end with `/#insecure`.
    pub fn client(&self) -> RedisResult<RedisClient> {
        RedisClient::open(self.uri.expose_secret())
    }

    /// Establishes a managed Redis connection based on the provided URI.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn start(&self) -> RedisResult<ConnectionManager> {
        let client = self.client()?;
        let config = ConnectionManagerConfig::new().set_connection_timeout(Duration::from_secs(60));
        client.get_connection_manager_with_config(config).await
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("revocation.enabled", true)?
            .set_default("revocation.check_user_revocation", true)?
            .set_default("revocation.check_threshold_secs", 30)?
            .set_default("revocation.expected_insertions", 100_000)?
            .set_default("revocation.false_positive_probability", 0.001)?
            .set_default("revocation.rebuild_interval_secs", 3600)?
            .set_default("revocation.cache_max_size", 10_000)?
            .set_default("revocation.cache_ttl_secs", 300)?
            .set_default("revocation.operation_timeout_millis", 2_000)?
            .set_default("revocation.failure_policy", "open")?
            .set_default("revocation.events.enabled", true)?
            .set_default("revocation.events.channel_name", "revocations")?
            .add_source(File::with_name("config/settings").required(false));

        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Use system environment variables
            // Should be in the format APP_REVOCATION__ENABLED or APP_REDIS__URI
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::load().expect("Failed to load config");

        assert!(config.revocation.enabled);
        assert!(config.revocation.check_user_revocation);
        assert_eq!(config.revocation.check_threshold_secs, 30);
        assert_eq!(config.revocation.expected_insertions, 100_000);
        assert_eq!(config.revocation.false_positive_probability, 0.001);
        assert_eq!(config.revocation.rebuild_interval_secs, 3600);
        assert_eq!(config.revocation.failure_policy, FailurePolicy::Open);
        assert_eq!(config.revocation.events.channel_name, "revocations");
        assert!(config.redis.is_none());
    }

    #[test]
    fn test_env_config() {
        let mut env_vars = HashMap::new();
        env_vars.insert("revocation.enabled".to_string(), "false".to_string());
        env_vars.insert(
            "revocation.failure_policy".to_string(),
            "closed".to_string(),
        );
        env_vars.insert(
            "redis.uri".to_string(),
            "rediss://localhost:6379".to_string(),
        );

        let config = Config::load_with_sources(Some(env_vars)).expect("Failed to load config");

        assert!(!config.revocation.enabled);
        assert_eq!(config.revocation.failure_policy, FailurePolicy::Closed);
        assert_eq!(
            config.redis.unwrap().uri.expose_secret(),
            "rediss://localhost:6379"
        );
    }

    #[test]
    fn test_partial_env_override() {
        let mut env_vars = HashMap::new();
        // We just override the threshold
        env_vars.insert(
            "revocation.check_threshold_secs".to_string(),
            "0".to_string(),
        );

        let config = Config::load_with_sources(Some(env_vars)).expect("Failed to load config");

        assert_eq!(config.revocation.check_threshold_secs, 0);
        // The other values should use default
        assert_eq!(config.revocation.cache_max_size, 10_000);
        assert!(config.redis.is_none());
    }
}
