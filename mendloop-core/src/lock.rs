//! Lock manager contract and an in-process implementation
//!
//! The engine does not enforce mutual exclusion itself; it asks a
//! [`LockManager`] for a [`Lock`] on each target entity and reacts to the
//! [`LockCallback`] notifications. [`LocalLockManager`] keeps one table for
//! the whole process, which is enough to keep concurrent events on the same
//! target apart.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::step::deadline_after;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Waiting,
    Active,
    Unavailable,
}

/// Receives lock state changes. Invoked on an arbitrary task.
pub trait LockCallback: Send + Sync {
    fn lock_available(&self, lock: &dyn Lock);
    fn lock_unavailable(&self, lock: &dyn Lock);
}

/// Handle to a lock obtained from a [`LockManager`].
pub trait Lock: Send + Sync {
    fn resource_id(&self) -> &str;

    fn owner_key(&self) -> &str;

    fn state(&self) -> LockState;

    fn is_active(&self) -> bool {
        self.state() == LockState::Active
    }

    /// Extends the hold. Returns false if the lock is no longer held, in
    /// which case `callback` is told the lock is unavailable.
    fn extend(&self, hold: Duration, callback: Arc<dyn LockCallback>) -> bool;

    /// Releases the lock. Returns true if it was held.
    fn free(&self) -> bool;
}

/// External mutual-exclusion service.
pub trait LockManager: Send + Sync {
    /// Requests a lock. The outcome is reported through `callback`.
    fn lock(
        &self,
        resource_id: &str,
        owner_key: &str,
        hold: Duration,
        callback: Arc<dyn LockCallback>,
    ) -> Arc<dyn Lock>;
}

/// In-process lock table. Clones share the same table.
#[derive(Clone, Default)]
pub struct LocalLockManager {
    table: Arc<DashMap<String, Arc<LocalLock>>>,
}

struct LocalLock {
    resource_id: String,
    owner_key: String,
    state: Mutex<LockState>,
    expires_at: Mutex<Instant>,
    callback: Mutex<Arc<dyn LockCallback>>,
    table: Weak<DashMap<String, Arc<LocalLock>>>,
    self_ref: Weak<LocalLock>,
}

#[derive(Clone, Copy)]
enum Notice {
    Available,
    Unavailable,
}

impl LocalLock {
    fn is_current(&self, table: &DashMap<String, Arc<LocalLock>>) -> bool {
        table
            .get(&self.resource_id)
            .map(|holder| std::ptr::eq(Arc::as_ptr(&holder), self))
            .unwrap_or(false)
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= *self.expires_at.lock()
    }

    /// Delivers a callback on a separate task so callers never re-enter.
    fn notify(&self, notice: Notice) {
        let Some(lock) = self.self_ref.upgrade() else {
            return;
        };
        let callback = self.callback.lock().clone();
        let deliver = move || match notice {
            Notice::Available => callback.lock_available(lock.as_ref()),
            Notice::Unavailable => callback.lock_unavailable(lock.as_ref()),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { deliver() });
            }
            Err(_) => deliver(),
        }
    }

    fn revoke(&self) {
        *self.state.lock() = LockState::Unavailable;
        self.notify(Notice::Unavailable);
    }
}

impl Lock for LocalLock {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    fn owner_key(&self) -> &str {
        &self.owner_key
    }

    fn state(&self) -> LockState {
        *self.state.lock()
    }

    fn extend(&self, hold: Duration, callback: Arc<dyn LockCallback>) -> bool {
        *self.callback.lock() = callback;

        let held = self.state() == LockState::Active
            && self
                .table
                .upgrade()
                .map(|table| self.is_current(&table))
                .unwrap_or(false);

        if held {
            *self.expires_at.lock() = deadline_after(hold);
            debug!(resource = %self.resource_id, owner = %self.owner_key, ?hold, "Extended lock");
            self.notify(Notice::Available);
            true
        } else {
            *self.state.lock() = LockState::Unavailable;
            self.notify(Notice::Unavailable);
            false
        }
    }

    fn free(&self) -> bool {
        let was_active = {
            let mut state = self.state.lock();
            let was_active = *state == LockState::Active;
            *state = LockState::Unavailable;
            was_active
        };

        if let Some(table) = self.table.upgrade() {
            table.remove_if(&self.resource_id, |_, holder| {
                std::ptr::eq(Arc::as_ptr(holder), self)
            });
        }
        if was_active {
            debug!(resource = %self.resource_id, owner = %self.owner_key, "Freed lock");
        }
        was_active
    }
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner currently holding `resource_id`, if any.
    pub fn holder(&self, resource_id: &str) -> Option<String> {
        self.table
            .get(resource_id)
            .filter(|lock| !lock.is_expired())
            .map(|lock| lock.owner_key.clone())
    }

    /// Revokes a live lock and tells its holder.
    pub fn break_lock(&self, resource_id: &str) -> bool {
        match self.table.remove(resource_id) {
            Some((_, lock)) => {
                info!(resource = %resource_id, owner = %lock.owner_key, "Breaking lock");
                lock.revoke();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl LockManager for LocalLockManager {
    fn lock(
        &self,
        resource_id: &str,
        owner_key: &str,
        hold: Duration,
        callback: Arc<dyn LockCallback>,
    ) -> Arc<dyn Lock> {
        let table = Arc::downgrade(&self.table);
        let lock = Arc::new_cyclic(|self_ref| LocalLock {
            resource_id: resource_id.to_string(),
            owner_key: owner_key.to_string(),
            state: Mutex::new(LockState::Waiting),
            expires_at: Mutex::new(deadline_after(hold)),
            callback: Mutex::new(callback),
            table,
            self_ref: self_ref.clone(),
        });

        let mut displaced = None;
        let granted = match self.table.entry(resource_id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(lock.clone());
                true
            }
            Entry::Occupied(mut entry) => {
                let (same_owner, expired) = {
                    let holder = entry.get();
                    (holder.owner_key == owner_key, holder.is_expired())
                };
                if same_owner || expired {
                    let old = entry.insert(lock.clone());
                    if !same_owner {
                        displaced = Some(old);
                    }
                    true
                } else {
                    false
                }
            }
        };

        if let Some(old) = displaced {
            info!(resource = %resource_id, owner = %old.owner_key, "Lock hold expired");
            old.revoke();
        }

        if granted {
            *lock.state.lock() = LockState::Active;
            debug!(resource = %resource_id, owner = %owner_key, "Lock granted");
            lock.notify(Notice::Available);
        } else {
            *lock.state.lock() = LockState::Unavailable;
            debug!(resource = %resource_id, owner = %owner_key, "Lock denied");
            lock.notify(Notice::Unavailable);
        }

        lock
    }
}
