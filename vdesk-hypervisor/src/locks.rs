//! Per-entity locks.
//!
//! A map from entity id to an async mutex, created on first use and removed
//! once the last holder or waiter is gone, including a waiter whose `lock`
//! future is dropped before it acquires. `tokio::sync::Mutex` is fair, so
//! callers queue in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// Arena of per-entity async mutexes.
#[derive(Clone)]
pub struct EntityLocks {
    kind: &'static str,
    inner: Arc<Mutex<LockMap>>,
}

impl EntityLocks {
    /// Create an empty arena. `kind` names the entity type in logs.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the exclusive lock for `id`, waiting behind earlier callers.
    pub async fn lock(&self, id: &str) -> EntityGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let pending = PendingLock {
            id,
            mutex: &mutex,
            map: &self.inner,
        };
        let guard = mutex.clone().lock_owned().await;
        pending.disarm();
        trace!(kind = self.kind, id = %id, "Entity lock acquired");

        EntityGuard {
            kind: self.kind,
            id: id.to_string(),
            guard: Some(guard),
            mutex,
            map: self.inner.clone(),
        }
    }

    /// Number of entities with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proof that the lock for one entity is held. Released on drop.
pub struct EntityGuard {
    kind: &'static str,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    mutex: Arc<AsyncMutex<()>>,
    map: Arc<Mutex<LockMap>>,
}

impl EntityGuard {
    /// Id of the locked entity.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        release_entry(&self.map, &self.id, &self.mutex);
        trace!(kind = self.kind, id = %self.id, "Entity lock released");
    }
}

/// Cleans up after a `lock` call dropped while waiting.
///
/// Declared before the acquire future, so on cancellation that future (and
/// its clone of the mutex) is dropped first.
struct PendingLock<'a> {
    id: &'a str,
    mutex: &'a Arc<AsyncMutex<()>>,
    map: &'a Arc<Mutex<LockMap>>,
}

impl PendingLock<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for PendingLock<'_> {
    fn drop(&mut self) {
        release_entry(self.map, self.id, self.mutex);
    }
}

/// Remove the entry for `id` if the caller's `mutex` is its last user.
///
/// The map entry and the caller's clone are the only references left when
/// nobody else holds or waits. Waiters clone under the map lock, so holding
/// it here makes the check and the removal atomic.
fn release_entry(map: &Mutex<LockMap>, id: &str, mutex: &Arc<AsyncMutex<()>>) {
    let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = map.get(id) {
        if Arc::ptr_eq(entry, mutex) && Arc::strong_count(entry) == 2 {
            map.remove(id);
        }
    }
}
