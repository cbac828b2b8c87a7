//! Per-stack operation locks
//!
//! The driver is stateless and does not serialize calls. Embedders that run
//! several lifecycle operations concurrently hold a [`StackGuard`] around each
//! one so a stack never sees a scale racing a delete.
//!
//! Entries are dropped when the last guard or waiter for a stack goes away.

use nimbus_core::StackId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type Slot = Arc<AsyncMutex<()>>;
type SlotMap = Arc<Mutex<HashMap<StackId, Slot>>>;

fn lock_map(locks: &SlotMap) -> MutexGuard<'_, HashMap<StackId, Slot>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held while one lifecycle operation runs against a stack
#[derive(Debug)]
pub struct StackGuard {
    stack_id: StackId,
    locks: SlotMap,
    guard: OwnedMutexGuard<()>,
}

impl StackGuard {
    pub fn stack_id(&self) -> &StackId {
        &self.stack_id
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        let mut locks = lock_map(&self.locks);
        let idle = locks.get(&self.stack_id).is_some_and(|slot| {
            // the map entry plus the mutex this guard still holds
            Arc::ptr_eq(slot, OwnedMutexGuard::mutex(&self.guard)) && Arc::strong_count(slot) == 2
        });
        if idle {
            locks.remove(&self.stack_id);
            debug!(stack_id = %self.stack_id, "Released idle stack lock");
        }
    }
}

/// Registry of async mutexes keyed by stack id
#[derive(Default, Clone)]
pub struct StackLocks {
    locks: SlotMap,
}

impl StackLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, stack_id: &StackId) -> Slot {
        lock_map(&self.locks).entry(stack_id.clone()).or_default().clone()
    }

    fn guard(&self, stack_id: &StackId, guard: OwnedMutexGuard<()>) -> StackGuard {
        StackGuard {
            stack_id: stack_id.clone(),
            locks: self.locks.clone(),
            guard,
        }
    }

    /// Wait until no other operation holds `stack_id`
    pub async fn acquire(&self, stack_id: &StackId) -> StackGuard {
        let guard = self.slot(stack_id).lock_owned().await;
        debug!(stack_id = %stack_id, "Acquired stack lock");
        self.guard(stack_id, guard)
    }

    /// Take the lock only if it is free
    pub fn try_acquire(&self, stack_id: &StackId) -> Option<StackGuard> {
        let slot = self.slot(stack_id);
        match slot.try_lock_owned() {
            Ok(guard) => Some(self.guard(stack_id, guard)),
            Err(_) => None,
        }
    }

    /// Drop the entry of a deleted stack
    ///
    /// Returns false while an operation still holds it.
    pub fn forget(&self, stack_id: &StackId) -> bool {
        let mut locks = lock_map(&self.locks);
        match locks.get(stack_id) {
            Some(slot) if slot.try_lock().is_err() => false,
            _ => {
                locks.remove(stack_id);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
