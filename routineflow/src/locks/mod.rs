//! Mutual-exclusion locks keyed by string.
//!
//! The dispatcher and the reverter hold one lock per routine while they
//! work on it. Locks are leases: a holder that never releases (a crashed
//! worker) loses the lock once the lease runs out.

mod memory;

pub use memory::InMemoryLockManager;

use crate::errors::LockError;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Proof of holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// The lock key.
    pub key: String,
    /// Token identifying this acquisition.
    pub token: Uuid,
}

impl LockHandle {
    /// Creates a handle with a fresh token.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4(),
        }
    }
}

/// Lease-based lock backend.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquires `key`, waiting at most `wait`; the lock expires after `lease`.
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockHandle, LockError>;

    /// Releases a lock.
    ///
    /// Returns false if the lease had already expired and was lost.
    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError>;
}

/// Key of the dispatcher lock for a routine.
#[must_use]
pub fn dispatcher_lock_key(routine_id: impl std::fmt::Display) -> String {
    format!("lock-routine-dispatcher-{routine_id}")
}

/// Key of the reverter lock for a routine.
#[must_use]
pub fn reverter_lock_key(routine_id: impl std::fmt::Display) -> String {
    format!("lock-routine-reverter-{routine_id}")
}
