//! # Fingerprint Locks
//!
//! Serializes vote attempts per `(event, daily fingerprint hash)`.
//!
//! ## Lifecycle
//!
//! ```text
//! acquire ──> LockGuard ──┬─ commit()   vote stored (or already voted), lock stays until TTL
//!                         ├─ release()  any other failure, lock removed now
//!                         └─ drop       request cancelled, unlock scheduled on the runtime
//! ```
//!
//! The store decides atomically whether the lock can be taken. A fingerprint record left
//! by a completed vote blocks new locks until retention prunes it, so an expired lock
//! alone never lets a second vote through.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::store::{PruneReport, StoreError, VoteStore};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Fingerprint already used for this event")]
    AlreadyUsed,

    #[error("Invalid lock duration")]
    Duration(#[from] chrono::OutOfRangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct FingerprintLocks {
    store: Arc<dyn VoteStore>,
    ttl: Duration,
    retention: Duration,
}

impl FingerprintLocks {
    pub fn new(store: Arc<dyn VoteStore>, ttl: Duration, retention: Duration) -> Self {
        Self {
            store,
            ttl,
            retention,
        }
    }

    pub async fn prune(&self, now: DateTime<Utc>) -> Result<PruneReport, LockError> {
        let retain_after = now - chrono::Duration::from_std(self.retention)?;
        let report = self.store.prune(now, retain_after).await?;

        if report.locks > 0 || report.fingerprints > 0 {
            debug!(
                locks = report.locks,
                fingerprints = report.fingerprints,
                "Pruned fingerprint state"
            );
        }

        Ok(report)
    }

    pub async fn lock(
        &self,
        event_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<LockGuard, LockError> {
        if !self
            .store
            .try_lock(event_id, fingerprint, now, expires_at)
            .await?
        {
            return Err(LockError::AlreadyUsed);
        }

        Ok(LockGuard {
            store: Arc::clone(&self.store),
            event_id,
            fingerprint: fingerprint.to_string(),
            settled: false,
        })
    }

    pub async fn unlock(&self, event_id: i64, fingerprint: &str) -> Result<(), LockError> {
        Ok(self.store.unlock(event_id, fingerprint).await?)
    }

    /// Prunes, then locks until `now + ttl`.
    pub async fn acquire(
        &self,
        event_id: i64,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<LockGuard, LockError> {
        self.prune(now).await?;

        let expires_at = now + chrono::Duration::from_std(self.ttl)?;
        self.lock(event_id, fingerprint, now, expires_at).await
    }
}

/// Held fingerprint lock. Settle it with [`LockGuard::commit`] or [`LockGuard::release`].
#[must_use = "an unsettled lock is released in the background when dropped"]
pub struct LockGuard {
    store: Arc<dyn VoteStore>,
    event_id: i64,
    fingerprint: String,
    settled: bool,
}

impl LockGuard {
    pub fn event_id(&self) -> i64 {
        self.event_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Leaves the lock to expire on its own.
    pub fn commit(mut self) {
        self.settled = true;
    }

    /// Removes the lock now. Failures are logged, the TTL cleans up eventually.
    ///
    /// The guard only settles once the unlock returns, so a release cancelled mid-flight
    /// falls back to the background unlock in `Drop`.
    pub async fn release(mut self) {
        let unlocked = self.store.unlock(self.event_id, &self.fingerprint).await;
        self.settled = true;

        if let Err(e) = unlocked {
            error!(event_id = self.event_id, error = %e, "Failed to release fingerprint lock");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        warn!(
            event_id = self.event_id,
            "Fingerprint lock dropped without settling, releasing in background"
        );

        let Ok(handle) = Handle::try_current() else {
            warn!(event_id = self.event_id, "No runtime to release lock, waiting for TTL");
            return;
        };

        let store = Arc::clone(&self.store);
        let event_id = self.event_id;
        let fingerprint = std::mem::take(&mut self.fingerprint);

        handle.spawn(async move {
            if let Err(e) = store.unlock(event_id, &fingerprint).await {
                error!(event_id, error = %e, "Failed to release dropped fingerprint lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::{FingerprintLocks, LockError};
    use crate::store::{
        InsertOutcome, InsertVoteError, MemoryStore, PruneReport, StoreError, Ticket, Vote,
        VoteIdentity, VoteStore,
    };

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn locks(store: Arc<MemoryStore>) -> FingerprintLocks {
        FingerprintLocks::new(
            store,
            Duration::from_secs(60),
            Duration::from_secs(48 * 3600),
        )
    }

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let locks = locks(Arc::new(MemoryStore::new()));
        let now = at("2025-03-14T20:00:00Z");

        let guard = locks.acquire(7, "fp", now).await.unwrap();
        assert!(matches!(
            locks.acquire(7, "fp", now).await,
            Err(LockError::AlreadyUsed)
        ));

        guard.release().await;
        assert!(locks.acquire(7, "fp", now).await.is_ok_and(|g| {
            g.commit();
            true
        }));
    }

    #[tokio::test]
    async fn test_committed_lock_expires_after_ttl() {
        let locks = locks(Arc::new(MemoryStore::new()));
        let now = at("2025-03-14T20:00:00Z");

        locks.acquire(7, "fp", now).await.unwrap().commit();

        let before_expiry = now + chrono::Duration::seconds(59);
        assert!(locks.acquire(7, "fp", before_expiry).await.is_err());

        let after_expiry = now + chrono::Duration::seconds(61);
        locks.acquire(7, "fp", after_expiry).await.unwrap().commit();
    }

    #[tokio::test]
    async fn test_voted_fingerprint_blocks_until_retention() {
        let store = Arc::new(MemoryStore::new());
        let locks = locks(Arc::clone(&store));
        let now = at("2025-03-14T20:00:00Z");

        let guard = locks.acquire(7, "fp", now).await.unwrap();
        store
            .insert_vote(&Vote {
                event_id: 7,
                player_id: 1,
                code: "1234".to_string(),
                signature: "sig".to_string(),
                identity: VoteIdentity::Fingerprint("fp".to_string()),
                device_token: "device".to_string(),
                hashed_ip: "ip".to_string(),
                created_at: now,
            })
            .await
            .unwrap();
        guard.commit();

        let next_hour = now + chrono::Duration::hours(1);
        assert!(matches!(
            locks.acquire(7, "fp", next_hour).await,
            Err(LockError::AlreadyUsed)
        ));

        let after_retention = now + chrono::Duration::hours(49);
        locks.acquire(7, "fp", after_retention).await.unwrap().commit();
    }

    #[tokio::test]
    async fn test_dropped_guard_is_released() {
        let locks = locks(Arc::new(MemoryStore::new()));
        let now = at("2025-03-14T20:00:00Z");

        drop(locks.acquire(7, "fp", now).await.unwrap());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        locks.acquire(7, "fp", now).await.unwrap().commit();
    }

    #[tokio::test]
    async fn test_unlock_is_idempotent() {
        let locks = locks(Arc::new(MemoryStore::new()));

        locks.unlock(7, "fp").await.unwrap();
        locks.unlock(7, "fp").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_single_winner() {
        let locks = Arc::new(locks(Arc::new(MemoryStore::new())));
        let now = at("2025-03-14T20:00:00Z");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let locks = Arc::clone(&locks);
                tokio::spawn(async move {
                    match locks.acquire(7, "fp", now).await {
                        Ok(guard) => {
                            guard.commit();
                            true
                        }
                        Err(_) => false,
                    }
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
    }

    /// Memory store whose unlock takes a while, long enough to cancel mid-flight.
    struct SlowUnlock(MemoryStore);

    #[async_trait]
    impl VoteStore for SlowUnlock {
        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }

        async fn prune(
            &self,
            now: DateTime<Utc>,
            retain_after: DateTime<Utc>,
        ) -> Result<PruneReport, StoreError> {
            self.0.prune(now, retain_after).await
        }

        async fn try_lock(
            &self,
            event_id: i64,
            fingerprint: &str,
            now: DateTime<Utc>,
            expires_at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.0.try_lock(event_id, fingerprint, now, expires_at).await
        }

        async fn unlock(&self, event_id: i64, fingerprint: &str) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.unlock(event_id, fingerprint).await
        }

        async fn insert_vote(&self, vote: &Vote) -> Result<(), InsertVoteError> {
            self.0.insert_vote(vote).await
        }

        async fn find_vote(&self, event_id: i64, code: &str) -> Result<Option<Vote>, StoreError> {
            self.0.find_vote(event_id, code).await
        }

        async fn is_bypass_used(&self, code: &str) -> Result<bool, StoreError> {
            self.0.is_bypass_used(code).await
        }

        async fn find_ticket(
            &self,
            event_id: i64,
            code: &str,
        ) -> Result<Option<Ticket>, StoreError> {
            self.0.find_ticket(event_id, code).await
        }

        async fn insert_ticket(&self, ticket: &Ticket) -> Result<InsertOutcome, StoreError> {
            self.0.insert_ticket(ticket).await
        }

        async fn mark_redeemed(
            &self,
            event_id: i64,
            code: &str,
            at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.0.mark_redeemed(event_id, code, at).await
        }
    }

    #[tokio::test]
    async fn test_cancelled_release_still_unlocks() {
        let locks = FingerprintLocks::new(
            Arc::new(SlowUnlock(MemoryStore::new())),
            Duration::from_secs(60),
            Duration::from_secs(48 * 3600),
        );
        let now = at("2025-03-14T20:00:00Z");

        let guard = locks.acquire(7, "fp", now).await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(10), guard.release()).await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;

        let guard = locks.acquire(7, "fp", now).await.unwrap();
        guard.commit();
    }
}
