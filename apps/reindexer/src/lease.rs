use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::ReindexDb;

pub const COORDINATOR_LEASE_KEY: &str = "reindexer/coordinator";

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease {key} is held elsewhere")]
    Unavailable { key: String },
    #[error("lease store error: {0}")]
    Store(String),
}

/// Time-bounded exclusive leases shared by every worker process.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Takes `key` for `holder` until `now + ttl` if nobody holds an unexpired lease on it.
    async fn try_obtain(
        &self,
        key: &str,
        holder: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseError>;

    /// Drops `holder`'s lease on `key`. Releasing a lease that is gone or held by someone
    /// else is a no-op and returns false.
    async fn release(&self, key: &str, holder: Uuid) -> Result<bool, LeaseError>;
}

pub fn memory() -> Arc<dyn LeaseStore> {
    Arc::new(MemoryLeaseStore::default())
}

pub fn postgres(db: Arc<ReindexDb>) -> Arc<dyn LeaseStore> {
    Arc::new(PostgresLeaseStore { db })
}

#[derive(Default)]
struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>,
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_obtain(
        &self,
        key: &str,
        holder: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseError> {
        let mut leases = self.leases.lock().await;
        if let Some((_, expires_at)) = leases.get(key)
            && *expires_at > now
        {
            return Ok(false);
        }
        leases.insert(key.to_string(), (holder, expires_at(now, ttl)?));
        Ok(true)
    }

    async fn release(&self, key: &str, holder: Uuid) -> Result<bool, LeaseError> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|(current, _)| *current == holder) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

struct PostgresLeaseStore {
    db: Arc<ReindexDb>,
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn try_obtain(
        &self,
        key: &str,
        holder: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LeaseError> {
        let expires_at = expires_at(now, ttl)?;
        let client = self.db.client();
        let row = client
            .lock()
            .await
            .query_opt(
                r#"
                INSERT INTO reindexer.leases (lease_key, holder, expires_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (lease_key) DO UPDATE
                   SET holder = EXCLUDED.holder,
                       expires_at = EXCLUDED.expires_at
                 WHERE reindexer.leases.expires_at <= $4
                RETURNING holder
                "#,
                &[&key, &holder, &expires_at, &now],
            )
            .await
            .map_err(|error| LeaseError::Store(error.to_string()))?;
        Ok(row.is_some())
    }

    async fn release(&self, key: &str, holder: Uuid) -> Result<bool, LeaseError> {
        let client = self.db.client();
        let deleted = client
            .lock()
            .await
            .execute(
                "DELETE FROM reindexer.leases WHERE lease_key = $1 AND holder = $2",
                &[&key, &holder],
            )
            .await
            .map_err(|error| LeaseError::Store(error.to_string()))?;
        Ok(deleted > 0)
    }
}

fn expires_at(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, LeaseError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| LeaseError::Store(format!("lease ttl out of range: {ttl:?}")))
}

#[derive(Clone, Debug)]
pub struct LeaseSettings {
    /// How long a holder keeps exclusivity if it never releases.
    pub ttl: Duration,
    /// How long `acquire` keeps polling before giving up. Zero means one attempt.
    pub wait: Duration,
    pub poll_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            wait: Duration::ZERO,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// The single cluster-wide lease serializing rebuilds. Advisory only: it locks nothing
/// in the database.
#[derive(Clone)]
pub struct ExclusiveLease {
    store: Arc<dyn LeaseStore>,
    key: String,
    settings: LeaseSettings,
}

impl ExclusiveLease {
    pub fn new(store: Arc<dyn LeaseStore>, key: impl Into<String>, settings: LeaseSettings) -> Self {
        Self {
            store,
            key: key.into(),
            settings,
        }
    }

    pub fn coordinator(store: Arc<dyn LeaseStore>, settings: LeaseSettings) -> Self {
        Self::new(store, COORDINATOR_LEASE_KEY, settings)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn acquire(&self) -> Result<LeaseGuard, LeaseError> {
        let holder = Uuid::new_v4();
        let deadline = tokio::time::Instant::now() + self.settings.wait;
        loop {
            if self
                .store
                .try_obtain(&self.key, holder, self.settings.ttl, Utc::now())
                .await?
            {
                debug!(key = %self.key, %holder, "obtained lease");
                return Ok(LeaseGuard {
                    store: self.store.clone(),
                    key: self.key.clone(),
                    holder,
                    released: false,
                });
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                info!(key = %self.key, "lease is held by another worker");
                return Err(LeaseError::Unavailable {
                    key: self.key.clone(),
                });
            }
            let remaining = deadline - now;
            tokio::time::sleep(self.settings.poll_interval.min(remaining)).await;
        }
    }
}

/// Proof of holding the lease. Must be released explicitly; an abandoned guard keeps the
/// lease until its ttl runs out.
pub struct LeaseGuard {
    store: Arc<dyn LeaseStore>,
    key: String,
    holder: Uuid,
    released: bool,
}

impl LeaseGuard {
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    pub async fn release(mut self) -> Result<(), LeaseError> {
        self.release_once().await
    }

    async fn release_once(&mut self) -> Result<(), LeaseError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if !self.store.release(&self.key, self.holder).await? {
            warn!(key = %self.key, holder = %self.holder, "lease was already gone at release");
        }
        debug!(key = %self.key, holder = %self.holder, "released lease");
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                key = %self.key,
                holder = %self.holder,
                "lease guard dropped without release; lease stays held until it expires"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(ttl: Duration, wait: Duration) -> LeaseSettings {
        LeaseSettings {
            ttl,
            wait,
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn only_one_holder_at_a_time() -> anyhow::Result<()> {
        let store = memory();
        let lease =
            ExclusiveLease::coordinator(store.clone(), settings(Duration::from_secs(60), Duration::ZERO));

        let guard = lease.acquire().await?;
        assert!(matches!(
            lease.acquire().await,
            Err(LeaseError::Unavailable { .. })
        ));

        guard.release().await?;
        let again = lease.acquire().await?;
        again.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() -> anyhow::Result<()> {
        let store = memory();
        let stale = Uuid::new_v4();
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        assert!(
            store
                .try_obtain(COORDINATOR_LEASE_KEY, stale, Duration::from_secs(60), long_ago)
                .await?
        );

        let lease = ExclusiveLease::coordinator(store.clone(), settings(Duration::from_secs(60), Duration::ZERO));
        let guard = lease.acquire().await?;
        assert_ne!(guard.holder(), stale);

        // The previous holder releasing late must not free the new holder's lease.
        assert!(!store.release(COORDINATOR_LEASE_KEY, stale).await?);
        assert!(matches!(
            lease.acquire().await,
            Err(LeaseError::Unavailable { .. })
        ));
        guard.release().await?;
        Ok(())
    }

    #[tokio::test]
    async fn acquire_waits_for_release() -> anyhow::Result<()> {
        let store = memory();
        let holder_lease =
            ExclusiveLease::coordinator(store.clone(), settings(Duration::from_secs(60), Duration::ZERO));
        let waiting_lease = ExclusiveLease::coordinator(
            store.clone(),
            settings(Duration::from_secs(60), Duration::from_secs(5)),
        );

        let guard = holder_lease.acquire().await?;
        let waiter = tokio::spawn(async move { waiting_lease.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await?;

        let second = waiter.await??;
        second.release().await?;
        Ok(())
    }
}
