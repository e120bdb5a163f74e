//! Named, permit-counted locks shared by every task of a manager.
//!
//! Semaphores are created lazily on first use and live as long as the
//! registry. The permit count is fixed by whichever caller creates the
//! semaphore first; later calls for the same key get the existing semaphore
//! even when they ask for a different count. Keep resource keys to a small,
//! known set: nothing is ever removed.

use crate::task::error::{BuildError, TaskError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Resource lock declared by a sub-task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ResourceLock {
    pub key: String,
    pub permits: usize,
}

impl ResourceLock {
    pub fn new(key: impl Into<String>, permits: usize) -> Self {
        Self {
            key: key.into(),
            permits,
        }
    }

    /// Single-permit lock, i.e. mutual exclusion on the resource
    pub fn exclusive(key: impl Into<String>) -> Self {
        Self::new(key, 1)
    }

    /// Check the permit count is one a semaphore can hold
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.permits == 0 {
            return Err(BuildError::ZeroPermits(self.key.clone()));
        }
        if self.permits > Semaphore::MAX_PERMITS {
            return Err(BuildError::TooManyPermits {
                key: self.key.clone(),
                permits: self.permits,
                max: Semaphore::MAX_PERMITS,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LockEntry {
    semaphore: Arc<Semaphore>,
    permits: usize,
}

/// Registry mapping resource keys to counting semaphores
#[derive(Debug, Default)]
pub struct ResourceLockRegistry {
    locks: DashMap<String, LockEntry>,
}

impl ResourceLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the semaphore for `key`, creating it with `permits` on first use.
    ///
    /// First writer wins: the permit count of an existing semaphore is never
    /// changed by later calls. Counts above [`Semaphore::MAX_PERMITS`] are
    /// capped.
    pub fn acquire(&self, key: &str, permits: usize) -> Arc<Semaphore> {
        let permits = permits.min(Semaphore::MAX_PERMITS);
        let entry = self.locks.entry(key.to_string()).or_insert_with(|| {
            debug!("Creating resource lock '{}' with {} permits", key, permits);
            LockEntry {
                semaphore: Arc::new(Semaphore::new(permits)),
                permits,
            }
        });

        if entry.permits != permits {
            debug!(
                "Resource lock '{}' already exists with {} permits; requested {} ignored",
                key, entry.permits, permits
            );
        }

        entry.semaphore.clone()
    }

    /// Wait for one permit of `lock`, giving up if `cancel` fires first.
    ///
    /// The returned permit is released when dropped, on every exit path.
    pub async fn acquire_permit(
        &self,
        lock: &ResourceLock,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, TaskError> {
        let semaphore = self.acquire(&lock.key, lock.permits);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
            permit = semaphore.acquire_owned() => permit.map_err(|e| TaskError::ResourceLock {
                key: lock.key.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Permit count the semaphore for `key` was created with
    pub fn configured_permits(&self, key: &str) -> Option<usize> {
        self.locks.get(key).map(|entry| entry.permits)
    }

    /// Permits currently free for `key`
    pub fn available_permits(&self, key: &str) -> Option<usize> {
        self.locks
            .get(key)
            .map(|entry| entry.semaphore.available_permits())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
