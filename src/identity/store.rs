use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use super::listeners::{Listeners, Subscription};
use super::model::SessionState;

struct StoreInner {
    current: RwLock<SessionState>,
    listeners: Listeners<SessionState>,
    watch_tx: watch::Sender<SessionState>,
    // Serializes commit + notify so listeners observe transitions in commit order.
    commit_lock: Mutex<()>,
}

/// Holds the authoritative session value and fans transitions out to observers.
/// Cloning yields another handle onto the same cell.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl Default for SessionStore {
    fn default() -> Self { Self::new() }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(SessionState::Anonymous),
                listeners: Listeners::new(),
                watch_tx: watch::channel(SessionState::Anonymous).0,
                commit_lock: Mutex::new(()),
            }),
        }
    }

    /// Latest committed value; never blocks on a transition in progress for longer than the swap.
    pub fn current(&self) -> SessionState { self.inner.current.read().clone() }

    /// Register an observer invoked synchronously on every committed transition.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        self.inner.listeners.add(listener)
    }

    /// Async view of the latest value. Intermediate transitions may be coalesced;
    /// use `subscribe` to observe every one.
    pub fn watch(&self) -> watch::Receiver<SessionState> { self.inner.watch_tx.subscribe() }

    pub fn subscriber_count(&self) -> usize { self.inner.listeners.len() }

    pub(crate) fn commit(&self, next: SessionState) {
        let _guard = self.inner.commit_lock.lock();
        {
            let mut cur = self.inner.current.write();
            *cur = next.clone();
        }
        crate::tprintln!("session.commit state={}", next.label());
        self.inner.watch_tx.send_replace(next.clone());
        self.inner.listeners.emit(&next);
    }
}
