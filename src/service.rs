use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use time::UtcDateTime;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::{
    cache::ConfirmedCache,
    config::{FailurePolicy, RevocationConfig},
    errors::RevocationError,
    events::{EventChannel, RevocationEvent},
    filter::FilterManager,
    store::{RevocationStore, StoreError},
};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// A token presented for a revocation decision.
#[derive(Debug, Clone, Copy)]
pub struct TokenCheck<'a> {
    pub jti: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub issued_at: UtcDateTime,
    pub expires_at: UtcDateTime,
}

/// Operational snapshot for monitoring and health reporting.
#[derive(Debug, Clone)]
pub struct RevocationStats {
    pub jti_filter_bits_set: u64,
    pub user_filter_bits_set: u64,
    pub cached_jtis: usize,
    pub cached_users: usize,
    pub first_rebuild_completed: bool,
}

/// The tiered revocation check and the revoke-side write path.
///
/// A check short-circuits at the first tier that can answer "not revoked":
/// TTL shortcut, membership filters, confirmed cache, then the store as
/// ground truth. A revoke writes to the store (failures propagate), then
/// updates the local filter and publishes an event (failures logged only;
/// the periodic rebuild self-heals missed filter updates).
#[derive(Clone)]
pub struct RevocationService<S, C> {
    store: S,
    channel: Option<C>,
    filters: Arc<FilterManager>,
    cache: ConfirmedCache,
    config: RevocationConfig,
}

impl<S, C> RevocationService<S, C>
where
    S: RevocationStore,
    C: EventChannel,
{
    /// Builds the service with empty filters. Call [`start`](Self::start) to
    /// launch the rebuild schedule and the event listener; until the first
    /// rebuild completes every check falls out at the filter tier.
    pub fn new(config: RevocationConfig, store: S, channel: Option<C>) -> Self {
        let filters = Arc::new(FilterManager::new(
            config.expected_insertions,
            config.false_positive_probability,
        ));
        let cache = ConfirmedCache::new(config.cache_max_size, config.cache_ttl());
        let channel = channel.filter(|_| config.events.enabled);
        Self {
            store,
            channel,
            filters,
            cache,
            config,
        }
    }

    /// Starts the background rebuild schedule and, when events are enabled,
    /// the subscription listener. Call once after construction.
    pub fn start(&self) {
        let _ = Arc::clone(&self.filters)
            .spawn_rebuild_task(self.store.clone(), self.config.rebuild_interval());
        if let Some(channel) = self.channel.clone() {
            let _ = self.spawn_event_listener(channel);
        }
    }

    /// Decides whether the presented token is revoked.
    ///
    /// Never returns an error: when the store cannot answer, the configured
    /// failure policy decides, and the outcome is logged.
    pub async fn is_revoked(&self, check: TokenCheck<'_>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now = UtcDateTime::now();

        // Tier 0: a token about to expire self-revokes soon regardless. The
        // bounded window where a just-revoked, near-expiry token still passes
        // is an accepted trade-off; zero threshold disables the shortcut.
        let threshold = self.config.check_threshold();
        if !threshold.is_zero() {
            let remaining = (check.expires_at - now).whole_seconds();
            if remaining < threshold.as_secs() as i64 {
                return false;
            }
        }

        // Tier 1: both filters reporting "definitely not present" settles it.
        let jti_hit = check
            .jti
            .is_some_and(|jti| self.filters.maybe_revoked_jti(jti));
        let user_hit = self.config.check_user_revocation
            && check
                .user_id
                .is_some_and(|user_id| self.filters.maybe_revoked_user(user_id));
        if !jti_hit && !user_hit {
            return false;
        }

        // Tier 2: recent confirmations. Absence is not authoritative.
        if let Some(jti) = check.jti {
            if self.cache.is_jti_confirmed(jti).await {
                return true;
            }
        }
        if self.config.check_user_revocation {
            if let Some(user_id) = check.user_id {
                if self.cache.is_user_confirmed(user_id, check.issued_at).await {
                    return true;
                }
            }
        }

        // Tier 3: the store is ground truth; positives are written through
        // to the confirmed cache.
        if let Some(jti) = check.jti {
            match self.guarded(self.store.is_revoked(jti)).await {
                Ok(true) => {
                    self.cache.confirm_jti(jti).await;
                    return true;
                }
                Ok(false) => {}
                Err(()) => return self.failure_verdict(),
            }
        }
        if self.config.check_user_revocation {
            if let Some(user_id) = check.user_id {
                match self
                    .guarded(self.store.is_user_revoked(user_id, check.issued_at))
                    .await
                {
                    Ok(true) => {
                        // The store vouches for this issue instant only, so
                        // cache a cutoff just past it, not the real one.
                        let cutoff = check
                            .issued_at
                            .saturating_add(time::Duration::milliseconds(1));
                        self.cache.confirm_user(user_id, cutoff).await;
                        return true;
                    }
                    Ok(false) => {}
                    Err(()) => return self.failure_verdict(),
                }
            }
        }
        false
    }

    /// Revokes a single token until it would expire on its own.
    ///
    /// The local filter update is synchronous: a check on this instance after
    /// this returns observes the revocation. Propagation to other instances
    /// is best-effort via the event channel.
    pub async fn revoke_token(
        &self,
        jti: &str,
        expires_at: UtcDateTime,
    ) -> Result<(), RevocationError> {
        if expires_at <= UtcDateTime::now() {
            debug!(jti, "Ignoring revocation of an already expired token");
            return Ok(());
        }
        self.write_store(self.store.revoke(jti, expires_at)).await?;

        self.filters.add_revoked_jti(jti);
        if let Some(channel) = &self.channel {
            match timeout(
                self.config.operation_timeout(),
                channel.publish_jti_revoked(jti, expires_at),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, jti, "Failed to publish revocation event"),
                Err(_) => warn!(jti, "Revocation event publish timed out"),
            }
        }
        info!(jti, "Token revoked");
        Ok(())
    }

    /// Revokes every token of `user_id` issued strictly before
    /// `revoked_before`.
    pub async fn revoke_all_for_user(
        &self,
        user_id: &str,
        revoked_before: UtcDateTime,
        expires_at: UtcDateTime,
    ) -> Result<(), RevocationError> {
        if expires_at <= UtcDateTime::now() {
            debug!(user_id, "Ignoring user revocation that is already expired");
            return Ok(());
        }
        self.write_store(
            self.store
                .revoke_all_for_user(user_id, revoked_before, expires_at),
        )
        .await?;

        self.filters.add_revoked_user(user_id);
        if let Some(channel) = &self.channel {
            match timeout(
                self.config.operation_timeout(),
                channel.publish_user_revoked(user_id, revoked_before, expires_at),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, user_id, "Failed to publish user revocation event"),
                Err(_) => warn!(user_id, "User revocation event publish timed out"),
            }
        }
        info!(user_id, "All user tokens revoked");
        Ok(())
    }

    /// Triggers an immediate filter rebuild, outside the schedule.
    pub async fn rebuild_now(&self) -> Result<(), StoreError> {
        self.filters.rebuild(&self.store).await
    }

    /// Whether the cold-start window has closed. Embedders can defer "ready"
    /// health status on this.
    pub fn first_rebuild_completed(&self) -> bool {
        self.filters.first_rebuild_completed()
    }

    pub async fn stats(&self) -> RevocationStats {
        RevocationStats {
            jti_filter_bits_set: self.filters.jti_bits_set(),
            user_filter_bits_set: self.filters.user_bits_set(),
            cached_jtis: self.cache.jti_len().await,
            cached_users: self.cache.user_len().await,
            first_rebuild_completed: self.filters.first_rebuild_completed(),
        }
    }

    /// Runs a deadline-bound store read. `Err(())` means the store could not
    /// answer and the failure policy has to decide.
    async fn guarded<F>(&self, op: F) -> Result<bool, ()>
    where
        F: Future<Output = Result<bool, StoreError>>,
    {
        match timeout(self.config.operation_timeout(), op).await {
            Ok(Ok(revoked)) => Ok(revoked),
            Ok(Err(e)) => {
                warn!(error = %e, "Revocation store check failed");
                Err(())
            }
            Err(_) => {
                warn!("Revocation store check timed out");
                Err(())
            }
        }
    }

    fn failure_verdict(&self) -> bool {
        match self.config.failure_policy {
            // Fail-open favors availability, fail-closed favors security.
            FailurePolicy::Open => false,
            FailurePolicy::Closed => true,
        }
    }

    /// Write-path store call: failures and timeouts propagate to the caller,
    /// silent loss of a revocation is unacceptable.
    async fn write_store<F>(&self, op: F) -> Result<(), RevocationError>
    where
        F: Future<Output = Result<(), StoreError>>,
    {
        timeout(self.config.operation_timeout(), op)
            .await
            .map_err(|_| RevocationError::StoreTimeout)??;
        Ok(())
    }

    fn spawn_event_listener(&self, channel: C) -> tokio::task::JoinHandle<()> {
        let filters = Arc::clone(&self.filters);
        let cache = self.cache.clone();
        tokio::spawn(async move {
            loop {
                let mut stream = match channel.subscribe().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(error = %e, "Event subscription failed, retrying");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };
                info!("Listening for revocation events");
                while let Some(event) = stream.next().await {
                    // Closed set: a new variant forces this match to grow.
                    match event {
                        RevocationEvent::JtiRevoked { jti, .. } => {
                            debug!(%jti, "Revocation event received");
                            filters.add_revoked_jti(&jti);
                            cache.confirm_jti(&jti).await;
                        }
                        RevocationEvent::UserRevoked {
                            user_id,
                            revoked_before,
                            ..
                        } => {
                            debug!(%user_id, "User revocation event received");
                            filters.add_revoked_user(&user_id);
                            cache.confirm_user(&user_id, revoked_before).await;
                        }
                    }
                }
                warn!("Revocation event stream ended, resubscribing");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }
}
