//! In-process lease lock.

use super::{LockHandle, LockManager};
use crate::errors::LockError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
}

/// Lock manager backed by a concurrent map.
///
/// Waiting callers poll at a fixed interval until the lock frees up, its
/// lease expires, or their wait window closes.
#[derive(Debug)]
pub struct InMemoryLockManager {
    leases: DashMap<String, Lease>,
    poll_interval: Duration,
}

impl Default for InMemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockManager {
    /// Creates a lock manager with the default poll interval.
    #[must_use]
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Creates a lock manager that polls at `poll_interval`.
    #[must_use]
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            poll_interval,
        }
    }

    /// Returns true if `key` is held by a live lease.
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }

    fn try_acquire(&self, key: &str, lease: Duration) -> Option<LockHandle> {
        let now = Instant::now();
        let handle = LockHandle::new(key);
        let fresh = Lease {
            token: handle.token,
            expires_at: now + lease,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return None;
                }
                warn!(lock_key = key, "Reclaiming expired lock");
                entry.insert(fresh);
            }
            Entry::Vacant(entry) => {
                entry.insert(fresh);
            }
        }
        Some(handle)
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockHandle, LockError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(handle) = self.try_acquire(key, lease) {
                debug!(lock_key = key, "Lock acquired");
                return Ok(handle);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: wait,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let released = self
            .leases
            .remove_if(&handle.key, |_, lease| lease.token == handle.token)
            .is_some();
        if released {
            debug!(lock_key = %handle.key, "Lock released");
        } else {
            warn!(lock_key = %handle.key, "Lock lease was lost before release");
        }
        Ok(released)
    }
}
