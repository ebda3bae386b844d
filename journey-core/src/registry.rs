//! Ordered callback registry shared by observables and the session clock.
//!
//! Entries are keyed by a monotonically increasing id, so iteration order is
//! registration order and removal never has to search. Dispatch always runs
//! over a snapshot taken under the lock; callbacks are invoked with no lock
//! held, which lets them register, unregister, or read freely.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Lock a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Registry<F: ?Sized> {
    next_id: u64,
    entries: BTreeMap<u64, Arc<F>>,
    closed: bool,
}

impl<F: ?Sized> Registry<F> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            entries: BTreeMap::new(),
            closed: false,
        }
    }

    /// Returns `None` once the registry is closed; the entry is not stored.
    fn insert(&mut self, entry: Arc<F>) -> Option<u64> {
        if self.closed {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, entry);
        Some(id)
    }

    pub(crate) fn snapshot(&self) -> Vec<(u64, Arc<F>)> {
        self.entries
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect()
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<Arc<F>> {
        self.entries.remove(&id)
    }

    /// Reject further registrations and hand back every entry so the caller
    /// can drop them outside the lock.
    pub(crate) fn close(&mut self) -> Vec<Arc<F>> {
        self.closed = true;
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Something a [`Subscription`] can remove itself from.
pub(crate) trait Unregister: Send + Sync {
    fn unregister(&self, id: u64);
}

impl<F: ?Sized + Send + Sync> Unregister for Mutex<Registry<F>> {
    fn unregister(&self, id: u64) {
        // Bind first so the entry is dropped after the guard.
        let removed = lock(self).remove(id);
        drop(removed);
    }
}

pub(crate) fn register<F>(registry: &Arc<Mutex<Registry<F>>>, entry: Arc<F>) -> Subscription
where
    F: ?Sized + Send + Sync + 'static,
{
    let id = lock(registry).insert(entry);
    match id {
        Some(id) => {
            let weak: Weak<Mutex<Registry<F>>> = Arc::downgrade(registry);
            let owner: Weak<dyn Unregister> = weak;
            Subscription {
                id,
                owner: Some(owner),
                active: AtomicBool::new(true),
                detached: false,
            }
        }
        None => Subscription::inert(),
    }
}

/// Handle for a registered callback.
///
/// Calling [`unsubscribe`](Self::unsubscribe) or dropping the handle removes
/// the callback before the next notification. Both are safe to repeat.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    owner: Option<Weak<dyn Unregister>>,
    active: AtomicBool,
    detached: bool,
}

impl Subscription {
    /// A subscription that was never registered, e.g. on a stopped clock.
    pub(crate) fn inert() -> Self {
        Self {
            id: 0,
            owner: None,
            active: AtomicBool::new(false),
            detached: false,
        }
    }

    /// Remove the callback. Repeated calls are no-ops.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
            owner.unregister(self.id);
        }
    }

    /// Whether this handle still owns a registration.
    ///
    /// A callback that ended itself (see [`SessionClock::on_tick_until`]) is
    /// already gone even though the handle reports active until dropped.
    ///
    /// [`SessionClock::on_tick_until`]: crate::clock::SessionClock::on_tick_until
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Keep the callback registered for the lifetime of its source.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Entry = dyn Fn() -> u32 + Send + Sync;

    fn entry(n: u32) -> Arc<Entry> {
        Arc::new(move || n)
    }

    #[test]
    fn test_snapshot_is_registration_order() {
        let registry = Arc::new(Mutex::new(Registry::<Entry>::new()));
        let _a = register(&registry, entry(1));
        let _b = register(&registry, entry(2));
        let _c = register(&registry, entry(3));

        let values: Vec<u32> = lock(&registry).snapshot().iter().map(|(_, f)| f()).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = Arc::new(Mutex::new(Registry::<Entry>::new()));
        let a = register(&registry, entry(1));
        let _b = register(&registry, entry(2));

        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_active());
        assert_eq!(lock(&registry).len(), 1);
        drop(a);
        assert_eq!(lock(&registry).len(), 1);
    }

    #[test]
    fn test_drop_unsubscribes_and_detach_keeps() {
        let registry = Arc::new(Mutex::new(Registry::<Entry>::new()));
        {
            let _temp = register(&registry, entry(1));
        }
        assert_eq!(lock(&registry).len(), 0);

        register(&registry, entry(2)).detach();
        assert_eq!(lock(&registry).len(), 1);
    }

    #[test]
    fn test_closed_registry_returns_inert_subscription() {
        let registry = Arc::new(Mutex::new(Registry::<Entry>::new()));
        let existing = register(&registry, entry(1));
        let drained = lock(&registry).close();
        assert_eq!(drained.len(), 1);

        let late = register(&registry, entry(2));
        assert!(!late.is_active());
        assert_eq!(lock(&registry).len(), 0);
        existing.unsubscribe();
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry = Arc::new(Mutex::new(Registry::<Entry>::new()));
        let sub = register(&registry, entry(1));
        drop(registry);
        sub.unsubscribe();
        assert!(!sub.is_active());
    }
}
