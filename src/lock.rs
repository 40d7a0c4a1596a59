// src/lock.rs

//! Named, time-bounded mutual exclusion keyed by entity identity.
//!
//! Every dispatch-affecting read-then-write on a run or workflow run happens
//! under a lease acquired here. A lease expires on its own if the holder
//! crashes without releasing, so a wedged worker can never lock an entity
//! out permanently. Release is RAII: dropping the [`LockGuard`] releases the
//! lease on every exit path, including panics and early `?` returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::errors::{Result, TaskloomError};

struct Lease {
    token: u64,
    expires_at: Instant,
}

struct LockTable {
    leases: Mutex<HashMap<String, Lease>>,
    released: Notify,
    next_token: AtomicU64,
}

/// Lease-based named mutex service.
///
/// Cheap to clone; all clones share one lock table.
#[derive(Clone)]
pub struct MutexService {
    table: Arc<LockTable>,
    config: LockConfig,
}

impl std::fmt::Debug for MutexService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MutexService {
    pub fn new(config: LockConfig) -> Self {
        Self {
            table: Arc::new(LockTable {
                leases: Mutex::new(HashMap::new()),
                released: Notify::new(),
                next_token: AtomicU64::new(1),
            }),
            config,
        }
    }

    /// Acquire the mutex for `key` with the configured lease TTL.
    ///
    /// Blocks up to `acquire_timeout_ms`, then fails with
    /// [`TaskloomError::LockTimeout`].
    pub async fn acquire(&self, key: &str) -> Result<LockGuard> {
        self.acquire_with_ttl(key, self.config.lease_ttl()).await
    }

    /// Acquire the mutex for `key` with an explicit lease TTL.
    pub async fn acquire_with_ttl(&self, key: &str, ttl: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + self.config.acquire_timeout();

        loop {
            // Register interest in releases *before* inspecting the table so
            // a release between the check and the wait cannot be missed.
            let released = self.table.released.notified();
            let now = Instant::now();

            let held_until = {
                let mut leases = self.table.leases.lock().expect("lock table poisoned");
                match leases.get(key) {
                    Some(lease) if lease.expires_at > now => Some(lease.expires_at),
                    stale => {
                        if stale.is_some() {
                            warn!(key, "reclaiming expired lock lease");
                        }
                        let token = self.table.next_token.fetch_add(1, Ordering::Relaxed);
                        leases.insert(
                            key.to_string(),
                            Lease {
                                token,
                                expires_at: now + ttl,
                            },
                        );
                        debug!(key, token, "lock acquired");
                        return Ok(LockGuard {
                            table: Arc::clone(&self.table),
                            key: key.to_string(),
                            token,
                        });
                    }
                }
            };

            if now >= deadline {
                return Err(TaskloomError::LockTimeout(key.to_string()));
            }

            // Wake on release, on the holder's lease expiry, or on our own
            // deadline, whichever comes first; then re-check from the top.
            let wake_at = held_until
                .map(|expiry| expiry.min(deadline))
                .unwrap_or(deadline);
            let _ = timeout(wake_at.saturating_duration_since(now), released).await;
        }
    }
}

/// Held lease on a named mutex. Dropping it releases the lease and wakes
/// waiters.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    table: Arc<LockTable>,
    key: String,
    token: u64,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut leases = self.table.leases.lock().expect("lock table poisoned");
        let still_ours = leases
            .get(&self.key)
            .is_some_and(|lease| lease.token == self.token);
        if still_ours {
            leases.remove(&self.key);
            drop(leases);
            debug!(key = %self.key, "lock released");
            self.table.released.notify_waiters();
        }
        // Otherwise the lease expired and was reclaimed by another holder;
        // releasing would steal their lease.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let locks = MutexService::new(LockConfig {
            lease_seconds: 30,
            acquire_timeout_ms: 50,
        });

        let guard = locks.acquire("run:a").await.expect("first acquire");
        let second = locks.acquire("run:a").await;
        assert!(matches!(second, Err(TaskloomError::LockTimeout(_))));

        drop(guard);
        let third = locks.acquire("run:a").await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = MutexService::new(LockConfig::default());
        let _a = locks.acquire("run:a").await.expect("a");
        let _b = locks.acquire("run:b").await.expect("b");
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let locks = MutexService::new(LockConfig {
            lease_seconds: 30,
            acquire_timeout_ms: 500,
        });

        // Simulate a crashed holder: acquire with a tiny TTL and leak the
        // guard so it is never released.
        let guard = locks
            .acquire_with_ttl("workflow:w", Duration::from_millis(20))
            .await
            .expect("short lease");
        std::mem::forget(guard);

        // A second acquirer must get through once the lease expires.
        let reclaimed = locks.acquire("workflow:w").await;
        assert!(reclaimed.is_ok());
    }

    #[tokio::test]
    async fn waiter_wakes_on_release() {
        let locks = MutexService::new(LockConfig {
            lease_seconds: 30,
            acquire_timeout_ms: 2000,
        });

        let guard = locks.acquire("run:r").await.expect("holder");
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("run:r").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let acquired = contender.await.expect("join");
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn stale_guard_does_not_steal_reclaimed_lease() {
        let locks = MutexService::new(LockConfig {
            lease_seconds: 30,
            acquire_timeout_ms: 200,
        });

        let stale = locks
            .acquire_with_ttl("run:s", Duration::from_millis(10))
            .await
            .expect("stale lease");

        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = locks.acquire("run:s").await.expect("reclaim");

        // Dropping the stale guard must not release the fresh holder's lease.
        drop(stale);
        let contender = locks.acquire("run:s").await;
        assert!(matches!(contender, Err(TaskloomError::LockTimeout(_))));
        drop(fresh);
    }
}
