//! Exclusive per-target locks

use crate::error::{GuardError, GuardResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Registry of named async locks shared by every executor in the process
///
/// Entries exist only while someone holds or waits for the key.
#[derive(Default)]
pub struct TargetLockRegistry {
    locks: LockMap,
}

/// Held locks; released when dropped
#[derive(Debug)]
pub struct TargetLockGuard {
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
    registry: LockMap,
}

impl TargetLockGuard {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for TargetLockGuard {
    fn drop(&mut self) {
        self.guards.clear();
        prune(&self.registry, &self.keys);
    }
}

/// Forget entries that only the registry still references
fn prune(registry: &LockMap, keys: &[String]) {
    let Ok(mut locks) = registry.lock() else {
        return;
    };
    for key in keys {
        if locks.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(key);
        }
    }
}

impl TargetLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.locks.lock().map_or(0, |locks| locks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &str) -> GuardResult<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| GuardError::Internal("lock registry poisoned".to_string()))?;
        Ok(locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    /// Acquire every key within `timeout`
    ///
    /// Keys are taken in sorted order so two callers with overlapping sets cannot deadlock.
    pub async fn acquire(&self, keys: &[String], timeout: Duration) -> GuardResult<TargetLockGuard> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let mutexes = keys
            .iter()
            .map(|k| self.entry(k))
            .collect::<GuardResult<Vec<_>>>()?;

        let acquire_all = async {
            let mut guards = Vec::with_capacity(mutexes.len());
            for mutex in mutexes {
                guards.push(mutex.lock_owned().await);
            }
            guards
        };

        match tokio::time::timeout(timeout, acquire_all).await {
            Ok(guards) => {
                debug!("Acquired locks {:?}", keys);
                Ok(TargetLockGuard {
                    keys,
                    guards,
                    registry: self.locks.clone(),
                })
            }
            Err(_) => {
                prune(&self.locks, &keys);
                warn!("Timed out after {:?} waiting for locks {:?}", timeout, keys);
                Err(GuardError::ConcurrencyConflict(format!(
                    "another operation holds {} (waited {:?})",
                    keys.join(", "),
                    timeout
                )))
            }
        }
    }
}
