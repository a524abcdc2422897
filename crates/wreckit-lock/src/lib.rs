//! Per-item locking and the single shared working-tree slot (§5).
//!
//! wreckit runs every agent against one checked-out working tree, so at
//! most one phase may touch the filesystem at a time regardless of worker
//! count; [`WorkingTreeSlot`] enforces that. Each item may still only have
//! one phase in flight at once (an item can't be both `research`d and
//! `plan`ned concurrently); [`ItemLockRegistry`] enforces that per-key.
//!
//! Both guards release on [`Drop`], mirroring the teacher's file-lock
//! auto-release so a panicked worker thread never leaves a stale hold.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use wreckit_types::ItemId;

#[derive(Debug, Default, Clone)]
pub struct ItemLockRegistry {
    inner: Arc<(Mutex<HashSet<ItemId>>, Condvar)>,
}

impl ItemLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `id` is unheld, then hold it until the returned guard
    /// drops.
    pub fn lock(&self, id: ItemId) -> ItemGuard {
        let (mutex, condvar) = &*self.inner;
        let mut held = mutex.lock().expect("item lock registry poisoned");
        while held.contains(&id) {
            held = condvar.wait(held).expect("item lock registry poisoned");
        }
        held.insert(id.clone());
        drop(held);
        ItemGuard {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Non-blocking variant: `None` if another worker already holds `id`.
    pub fn try_lock(&self, id: ItemId) -> Option<ItemGuard> {
        let (mutex, _) = &*self.inner;
        let mut held = mutex.lock().expect("item lock registry poisoned");
        if held.contains(&id) {
            return None;
        }
        held.insert(id.clone());
        drop(held);
        Some(ItemGuard {
            id,
            inner: self.inner.clone(),
        })
    }

    pub fn is_locked(&self, id: &ItemId) -> bool {
        let (mutex, _) = &*self.inner;
        mutex.lock().expect("item lock registry poisoned").contains(id)
    }
}

#[derive(Debug)]
pub struct ItemGuard {
    id: ItemId,
    inner: Arc<(Mutex<HashSet<ItemId>>, Condvar)>,
}

impl Drop for ItemGuard {
    fn drop(&mut self) {
        let (mutex, condvar) = &*self.inner;
        let mut held = mutex.lock().expect("item lock registry poisoned");
        held.remove(&self.id);
        drop(held);
        condvar.notify_all();
    }
}

/// Capacity-1 semaphore guarding the single working tree every agent runs
/// against. Cloning a slot shares the same underlying permit, mirroring
/// the registry's `Arc` sharing so the scheduler and its worker threads
/// all serialize through the same instance.
#[derive(Debug, Default, Clone)]
pub struct WorkingTreeSlot {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl WorkingTreeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> WorkingTreeGuard {
        let (mutex, condvar) = &*self.inner;
        let mut busy = mutex.lock().expect("working tree slot poisoned");
        while *busy {
            busy = condvar.wait(busy).expect("working tree slot poisoned");
        }
        *busy = true;
        drop(busy);
        WorkingTreeGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn try_acquire(&self) -> Option<WorkingTreeGuard> {
        let (mutex, _) = &*self.inner;
        let mut busy = mutex.lock().expect("working tree slot poisoned");
        if *busy {
            return None;
        }
        *busy = true;
        drop(busy);
        Some(WorkingTreeGuard {
            inner: self.inner.clone(),
        })
    }
}

#[derive(Debug)]
pub struct WorkingTreeGuard {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Drop for WorkingTreeGuard {
    fn drop(&mut self) {
        let (mutex, condvar) = &*self.inner;
        let mut busy = mutex.lock().expect("working tree slot poisoned");
        *busy = false;
        drop(busy);
        condvar.notify_one();
    }
}
