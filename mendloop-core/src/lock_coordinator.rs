//! Per-event lock bookkeeping on top of a [`LockManager`]
//!
//! The coordinator keeps exactly one [`LockData`] per target entity. Every
//! request for a target shares that entry: the first request issues the
//! acquire call, later requests either attach to the pending result or, once
//! the lock is live, extend it.
//!
//! When the lock is lost or denied, each unavailable-listener fires exactly
//! once and the listener list is cleared, so a given loss is never replayed.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::actor::{LOCK_ACTOR, LOCK_OPERATION};
use crate::lock::{Lock, LockCallback, LockManager};
use crate::outcome::OperationOutcome;

/// Invoked once when a lock becomes unavailable.
pub type UnavailableListener = Box<dyn FnOnce(OperationOutcome) + Send>;

/// Resolves to the lock outcome: success once granted, failure if denied.
pub type LockFuture = BoxFuture<'static, OperationOutcome>;

/// Lock state for a single target entity.
pub struct LockData {
    target_entity: String,
    result: watch::Sender<Option<OperationOutcome>>,
    inner: Mutex<LockDataInner>,
}

#[derive(Default)]
struct LockDataInner {
    lock: Option<Arc<dyn Lock>>,
    failed: Option<OperationOutcome>,
    listeners: Vec<UnavailableListener>,
}

impl LockData {
    fn new(target_entity: &str) -> Arc<Self> {
        let (result, _) = watch::channel(None);
        Arc::new(Self {
            target_entity: target_entity.to_string(),
            result,
            inner: Mutex::new(LockDataInner::default()),
        })
    }

    pub fn target_entity(&self) -> &str {
        &self.target_entity
    }

    fn make_outcome(&self) -> OperationOutcome {
        OperationOutcome::new(LOCK_ACTOR, LOCK_OPERATION, &self.target_entity)
    }

    /// Future for the first resolution of this lock.
    pub fn pending(&self) -> LockFuture {
        let mut rx = self.result.subscribe();
        let fallback = self.make_outcome().failed();
        async move {
            let resolved = rx
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|value| value.clone());
            resolved.unwrap_or(fallback)
        }
        .boxed()
    }

    /// Registers a listener, invoking it at once if the lock already failed.
    pub fn add_unavailable_listener(&self, listener: UnavailableListener) {
        let failed = {
            let mut inner = self.inner.lock();
            match &inner.failed {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    inner.listeners.push(listener);
                    return;
                }
            }
        };
        if let Some(outcome) = failed {
            listener(outcome);
        }
    }

    pub fn is_live(&self) -> bool {
        let inner = self.inner.lock();
        inner.failed.is_none() && inner.lock.as_ref().map(|l| l.is_active()).unwrap_or(false)
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().failed.is_some()
    }

    fn set_lock(&self, lock: Arc<dyn Lock>) {
        self.inner.lock().lock = Some(lock);
    }

    fn handle(&self) -> Option<Arc<dyn Lock>> {
        self.inner.lock().lock.clone()
    }

    fn free(&self) -> bool {
        let lock = self.inner.lock().lock.take();
        lock.map(|l| l.free()).unwrap_or(false)
    }
}

impl LockCallback for LockData {
    fn lock_available(&self, _lock: &dyn Lock) {
        if self.inner.lock().failed.is_some() {
            return;
        }
        debug!(target_entity = %self.target_entity, "Lock available");
        let outcome = self.make_outcome().succeeded();
        self.result.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    fn lock_unavailable(&self, _lock: &dyn Lock) {
        let outcome = self.make_outcome().failed();
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.failed.is_some() {
                return;
            }
            inner.failed = Some(outcome.clone());
            std::mem::take(&mut inner.listeners)
        };

        info!(target_entity = %self.target_entity, "Lock unavailable");
        self.result.send_replace(Some(outcome.clone()));

        for listener in listeners {
            listener(outcome.clone());
        }
    }
}

/// Authoritative map from target entity to lock state for one event.
pub struct LockCoordinator {
    manager: Arc<dyn LockManager>,
    owner_key: String,
    locks: Arc<Mutex<HashMap<String, Arc<LockData>>>>,
    current_target: Mutex<Option<String>>,
}

impl LockCoordinator {
    pub fn new(manager: Arc<dyn LockManager>, owner_key: impl Into<String>) -> Self {
        Self {
            manager,
            owner_key: owner_key.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
            current_target: Mutex::new(None),
        }
    }

    pub fn owner_key(&self) -> &str {
        &self.owner_key
    }

    /// Requests (or extends) the lock on `target_entity`.
    ///
    /// `hold` is how long the lock must stay held. A live lock is extended
    /// by that amount instead of being reacquired.
    pub fn request_lock(
        &self,
        target_entity: &str,
        hold: Duration,
        on_unavailable: UnavailableListener,
    ) -> LockFuture {
        enum Action {
            Acquire,
            Extend(Arc<dyn Lock>),
            Attach,
        }

        let (data, action) = {
            let mut locks = self.locks.lock();
            match locks.get(target_entity) {
                Some(data) => {
                    let action = match data.handle() {
                        Some(lock) if data.is_live() => Action::Extend(lock),
                        _ => Action::Attach,
                    };
                    (data.clone(), action)
                }
                None => {
                    let data = LockData::new(target_entity);
                    locks.insert(target_entity.to_string(), data.clone());
                    (data, Action::Acquire)
                }
            }
        };

        data.add_unavailable_listener(on_unavailable);

        match action {
            Action::Acquire => {
                debug!(target_entity, owner = %self.owner_key, ?hold, "Requesting lock");
                let lock = self
                    .manager
                    .lock(target_entity, &self.owner_key, hold, data.clone());
                data.set_lock(lock);
                self.switch_target(target_entity, &data);
            }
            Action::Extend(lock) => {
                debug!(target_entity, owner = %self.owner_key, ?hold, "Extending lock");
                if !lock.extend(hold, data.clone()) {
                    warn!(target_entity, owner = %self.owner_key, "Lock extension refused");
                }
            }
            Action::Attach => {}
        }

        data.pending()
    }

    /// Records the new target and releases the previous one once the new
    /// lock has resolved either way.
    fn switch_target(&self, target_entity: &str, data: &Arc<LockData>) {
        let previous = {
            let mut current = self.current_target.lock();
            match current.replace(target_entity.to_string()) {
                Some(prev) if prev != target_entity => Some(prev),
                _ => None,
            }
        };
        let Some(previous) = previous else {
            return;
        };

        let pending = data.pending();
        let locks = self.locks.clone();
        let release = async move {
            pending.await;
            let old = locks.lock().remove(&previous);
            if let Some(old) = old {
                debug!(target_entity = %previous, "Releasing previous lock");
                old.free();
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release);
            }
            Err(_) => warn!(target_entity, "No runtime to release previous lock"),
        }
    }

    /// True while the lock on `target_entity` is held for this event.
    pub fn is_locked(&self, target_entity: &str) -> bool {
        self.locks
            .lock()
            .get(target_entity)
            .map(|d| d.is_live())
            .unwrap_or(false)
    }

    pub fn release(&self, target_entity: &str) -> bool {
        let data = self.locks.lock().remove(target_entity);
        data.map(|d| d.free()).unwrap_or(false)
    }

    /// Frees every lock held for this event.
    pub fn free_all(&self) {
        let all: Vec<_> = self.locks.lock().drain().map(|(_, d)| d).collect();
        for data in all {
            if data.free() {
                debug!(target_entity = %data.target_entity(), "Freed lock");
            }
        }
        self.current_target.lock().take();
    }
}
