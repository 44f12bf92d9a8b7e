use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

/// Ordered set of callbacks. Emission snapshots the set, so a listener may unsubscribe
/// itself (or add others) while being invoked.
pub struct Listeners<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self { Self::new() }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self { Self { inner: Arc::new(Mutex::new(Registry { next_id: 1, entries: Vec::new() })) } }

    pub fn add<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut reg = self.inner.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.entries.push((id, Arc::new(f)));
            id
        };
        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(reg) = weak.upgrade() {
                reg.lock().entries.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Invoke every listener in registration order.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self.inner.lock().entries.iter().map(|(_, l)| l.clone()).collect();
        for l in snapshot {
            l(value);
        }
    }

    pub fn len(&self) -> usize { self.inner.lock().entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Handle returned by every `subscribe`; call `unsubscribe` to stop receiving callbacks.
/// Dropping the handle keeps the listener registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self { cancel: Some(Box::new(cancel)) }
    }

    pub fn unsubscribe(mut self) {
        if let Some(c) = self.cancel.take() {
            c();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}
