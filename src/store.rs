//! Observable state container.
//!
//! A `Store` owns one state value behind a mutex. Consumers read it with
//! [`Store::get_state`] / [`Store::read`], mutate it with [`Store::update`],
//! and observe slices of it with [`Store::subscribe`]: the selector runs after
//! every update and the callback fires only when the selected value changed.
//! Callbacks run after the state lock is released, so they may read or update
//! the store again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct StoreInner<S> {
    state: Mutex<S>,
    listeners: Mutex<Vec<(u64, Listener<S>)>>,
    next_id: AtomicU64,
}

pub struct Store<S> {
    inner: Arc<StoreInner<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Clone + Send + 'static> Store<S> {
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(state),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Clone of the current state.
    pub fn get_state(&self) -> S {
        self.inner.state.lock().clone()
    }

    /// Read-only access to the state. Locks the mutex for the duration of `f`.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&S) -> R,
    {
        let guard = self.inner.state.lock();
        f(&guard)
    }

    /// Mutating access to the state. Subscribers are notified after `f`
    /// returns and the lock is released.
    pub fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut S) -> R,
    {
        let has_listeners = !self.inner.listeners.lock().is_empty();
        let (result, snapshot) = {
            let mut guard = self.inner.state.lock();
            let result = f(&mut guard);
            let snapshot = has_listeners.then(|| guard.clone());
            (result, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.notify(&snapshot);
        }
        result
    }

    /// Observe the slice of state picked by `selector`. `callback` receives
    /// the new slice whenever an update changes it.
    pub fn subscribe<T, Sel, Cb>(&self, selector: Sel, callback: Cb) -> Subscription
    where
        T: PartialEq + Clone + Send + 'static,
        Sel: Fn(&S) -> T + Send + Sync + 'static,
        Cb: Fn(&T) + Send + Sync + 'static,
    {
        let last = Mutex::new(self.read(|s| selector(s)));
        let listener: Listener<S> = Arc::new(move |state: &S| {
            let next = selector(state);
            {
                let mut last = last.lock();
                if *last == next {
                    return;
                }
                *last = next.clone();
            }
            callback(&next);
        });

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, listener));

        let weak: Weak<StoreInner<S>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|(lid, _)| *lid != id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    fn notify(&self, state: &S) {
        let listeners: Vec<Listener<S>> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(state);
        }
    }
}

/// Handle returned by `subscribe`-style registrations. Dropping it (or
/// calling [`Subscription::unsubscribe`]) removes the registration.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Keep the registration alive for the lifetime of the store.
    pub fn detach(mut self) {
        self.release = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    struct Counter {
        a: u32,
        b: u32,
    }

    #[test]
    fn callback_fires_only_when_selection_changes() {
        let store = Store::new(Counter::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let calls_cb = Arc::clone(&calls);
        let seen_cb = Arc::clone(&seen);
        let _sub = store.subscribe(
            |s: &Counter| s.a,
            move |a| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
                seen_cb.lock().push(*a);
            },
        );

        store.update(|s| s.b += 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        store.update(|s| s.a = 5);
        store.update(|s| s.a = 5);
        store.update(|s| s.a = 6);
        assert_eq!(*seen.lock(), vec![5, 6]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let store = Store::new(Counter::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = Arc::clone(&calls);
        let sub = store.subscribe(
            |s: &Counter| s.a,
            move |_| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(store.listener_count(), 1);
        sub.unsubscribe();
        assert_eq!(store.listener_count(), 0);
        store.update(|s| s.a = 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callbacks_may_update_the_store() {
        let store = Store::new(Counter::default());
        let inner = store.clone();
        let _sub = store.subscribe(
            |s: &Counter| s.a,
            move |a| {
                let a = *a;
                inner.update(|s| s.b = a * 2);
            },
        );
        store.update(|s| s.a = 3);
        assert_eq!(store.read(|s| s.b), 6);
    }
}
