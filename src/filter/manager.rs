use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::MembershipFilter;
use crate::store::{RevocationStore, StoreError};

/// Ratio between the token-id key space and the much rarer user-id one.
const USER_FILTER_DIVISOR: usize = 10;

/// Owns the two swappable filter snapshots (token ids and user ids) and the
/// rebuild machinery that keeps them in sync with the store.
///
/// Readers load the current snapshot lock-free; a rebuild constructs new
/// filters off to the side and the swap itself is the only synchronization
/// point. The revoke path and the event listener insert into the live
/// snapshot in place, which the filter's atomic bit words make safe.
pub struct FilterManager {
    jti_filter: ArcSwap<MembershipFilter>,
    user_filter: ArcSwap<MembershipFilter>,
    expected_insertions: usize,
    false_positive_probability: f64,
    // Collapses overlapping rebuild triggers into one run.
    rebuild_lock: Mutex<()>,
    rebuilt_once: AtomicBool,
}

impl FilterManager {
    /// Constructs empty filters synchronously so the instance can serve
    /// immediately. Until the first rebuild completes, every key reports
    /// "definitely not revoked" - the documented cold-start exposure.
    pub fn new(expected_insertions: usize, false_positive_probability: f64) -> Self {
        let user_insertions = (expected_insertions / USER_FILTER_DIVISOR).max(1);
        Self {
            jti_filter: ArcSwap::from_pointee(MembershipFilter::with_capacity(
                expected_insertions,
                false_positive_probability,
            )),
            user_filter: ArcSwap::from_pointee(MembershipFilter::with_capacity(
                user_insertions,
                false_positive_probability,
            )),
            expected_insertions,
            false_positive_probability,
            rebuild_lock: Mutex::new(()),
            rebuilt_once: AtomicBool::new(false),
        }
    }

    pub fn add_revoked_jti(&self, jti: &str) {
        self.jti_filter.load().insert(jti);
    }

    pub fn add_revoked_user(&self, user_id: &str) {
        self.user_filter.load().insert(user_id);
    }

    /// `false` means the token id was definitely never revoked.
    pub fn maybe_revoked_jti(&self, jti: &str) -> bool {
        self.jti_filter.load().contains(jti)
    }

    /// `false` means the user id definitely has no active revocation.
    pub fn maybe_revoked_user(&self, user_id: &str) -> bool {
        self.user_filter.load().contains(user_id)
    }

    /// Whether at least one rebuild from the store has succeeded. Embedders
    /// can defer "ready" health status on this to close the cold-start window.
    pub fn first_rebuild_completed(&self) -> bool {
        self.rebuilt_once.load(Ordering::Acquire)
    }

    pub fn jti_bits_set(&self) -> u64 {
        self.jti_filter.load().set_bits()
    }

    pub fn user_bits_set(&self) -> u64 {
        self.user_filter.load().set_bits()
    }

    /// Rebuilds both filters from the authoritative store and swaps them in.
    ///
    /// Readers keep the previous snapshots for the whole build; on failure
    /// the previous snapshots stay live and the next scheduled run retries.
    /// A rebuild already in progress makes this call a no-op.
    pub async fn rebuild<S: RevocationStore>(&self, store: &S) -> Result<(), StoreError> {
        let Ok(_guard) = self.rebuild_lock.try_lock() else {
            warn!("Filter rebuild already in progress, skipping");
            return Ok(());
        };

        let started = Instant::now();
        let jtis = store.all_revoked_jtis().await?;
        let users = store.all_revoked_users().await?;

        // Size up when the store holds more entries than configured, keeping
        // the false-positive rate near target at the cost of extra memory.
        let jti_capacity = self.expected_insertions.max(jtis.len());
        let user_capacity = (self.expected_insertions / USER_FILTER_DIVISOR)
            .max(1)
            .max(users.len());

        let jti_filter =
            MembershipFilter::with_capacity(jti_capacity, self.false_positive_probability);
        for jti in &jtis {
            jti_filter.insert(jti);
        }
        let user_filter =
            MembershipFilter::with_capacity(user_capacity, self.false_positive_probability);
        for user_id in &users {
            user_filter.insert(user_id);
        }

        self.jti_filter.store(Arc::new(jti_filter));
        self.user_filter.store(Arc::new(user_filter));
        self.rebuilt_once.store(true, Ordering::Release);

        info!(
            jtis = jtis.len(),
            users = users.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rebuilt revocation filters"
        );
        Ok(())
    }

    /// Spawns the rebuild schedule: one immediate run to close the cold-start
    /// window, then one per interval. A run that overlaps the next tick makes
    /// that tick a skipped no-op rather than a concurrent rebuild.
    pub fn spawn_rebuild_task<S: RevocationStore>(
        self: Arc<Self>,
        store: S,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                debug!("Running scheduled filter rebuild");
                if let Err(e) = manager.rebuild(&store).await {
                    error!(
                        error = %e,
                        "Filter rebuild failed, keeping previous snapshots"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use time::{Duration as TimeDuration, UtcDateTime};

    fn hour_from_now() -> UtcDateTime {
        UtcDateTime::now().saturating_add(TimeDuration::hours(1))
    }

    #[tokio::test]
    async fn test_cold_start_filters_pass_everything() {
        let manager = FilterManager::new(1_000, 0.001);
        assert!(!manager.maybe_revoked_jti("any-token"));
        assert!(!manager.maybe_revoked_user("any-user"));
        assert!(!manager.first_rebuild_completed());
    }

    #[tokio::test]
    async fn test_rebuild_loads_store_contents() {
        let store = MemoryStore::default();
        store.revoke("token-a", hour_from_now()).await.unwrap();
        store
            .revoke_all_for_user("user-a", UtcDateTime::now(), hour_from_now())
            .await
            .unwrap();

        let manager = FilterManager::new(1_000, 0.001);
        manager.rebuild(&store).await.unwrap();

        assert!(manager.maybe_revoked_jti("token-a"));
        assert!(manager.maybe_revoked_user("user-a"));
        assert!(!manager.maybe_revoked_jti("token-b"));
        assert!(manager.first_rebuild_completed());
    }

    #[tokio::test]
    async fn test_rebuild_failure_keeps_previous_snapshot() {
        let store = MemoryStore::default();
        store.revoke("token-a", hour_from_now()).await.unwrap();

        let manager = FilterManager::new(1_000, 0.001);
        manager.rebuild(&store).await.unwrap();
        assert!(manager.maybe_revoked_jti("token-a"));

        store.set_failing(true);
        assert!(manager.rebuild(&store).await.is_err());
        // The previous snapshot stays live.
        assert!(manager.maybe_revoked_jti("token-a"));
    }

    #[tokio::test]
    async fn test_incremental_insert_survives_until_rebuild() {
        let store = MemoryStore::default();
        let manager = FilterManager::new(1_000, 0.001);
        manager.add_revoked_jti("local-only");
        assert!(manager.maybe_revoked_jti("local-only"));

        // A rebuild from a store that never saw the key drops it; the store
        // is the source of truth.
        manager.rebuild(&store).await.unwrap();
        assert!(!manager.maybe_revoked_jti("local-only"));
    }

    #[tokio::test]
    async fn test_rebuild_upsizes_to_actual_count() {
        let store = MemoryStore::default();
        for i in 0..500 {
            store
                .revoke(&format!("token-{i}"), hour_from_now())
                .await
                .unwrap();
        }

        // Configured far below the store's contents.
        let manager = FilterManager::new(10, 0.01);
        manager.rebuild(&store).await.unwrap();
        for i in 0..500 {
            assert!(manager.maybe_revoked_jti(&format!("token-{i}")));
        }
    }

    #[tokio::test]
    async fn test_concurrent_queries_during_rebuild() {
        let store = MemoryStore::default();
        for i in 0..200 {
            store
                .revoke(&format!("token-{i}"), hour_from_now())
                .await
                .unwrap();
        }

        let manager = Arc::new(FilterManager::new(1_000, 0.001));
        manager.rebuild(&store).await.unwrap();

        // Hammer the snapshots while further rebuilds swap them out. Every
        // query must observe a complete snapshot: all 200 keys stay positive.
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for _ in 0..50 {
                        for i in 0..200 {
                            assert!(manager.maybe_revoked_jti(&format!("token-{i}")));
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for _ in 0..10 {
            manager.rebuild(&store).await.unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
