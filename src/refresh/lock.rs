//! Per-user renewal locks.
//!
//! Providers typically invalidate the old refresh token as soon as one
//! renewal succeeds, so two concurrent refreshes against the same refresh
//! token make the loser fail with invalid_grant, indistinguishable from a
//! truly expired token. The registry serializes renewal per user: whoever
//! finds the lock held waits for the in-flight renewal instead of issuing a
//! second upstream call.
//!
//! Release is guaranteed by guard drop on every exit path: success,
//! retryable exhaustion, terminal failure, panic.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Registry of per-user renewal locks.
pub struct RefreshLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RefreshLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquire the renewal lock for a user, waiting if a renewal is already
    /// in flight.
    ///
    /// The returned guard releases on drop.
    pub async fn acquire(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        // Non-blocking check first, so a held lock is observable in logs;
        // then wait for the in-flight renewal to finish
        match Arc::clone(&lock).try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(user_id = %user_id, "Renewal already in flight, waiting");
                lock.lock_owned().await
            }
        }
    }

    /// Drop the map entry once no renewal holds or awaits it.
    ///
    /// Called after a renewal finishes; keeps the registry from growing
    /// with users seen once.
    pub fn reap(&self, user_id: &str) {
        self.locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of tracked users (tests, monitoring).
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for RefreshLocks {
    fn default() -> Self {
        Self::new()
    }
}
