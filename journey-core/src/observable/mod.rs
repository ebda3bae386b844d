//! Push-based observable values.
//!
//! An [`Observable<T>`] holds a current value and an ordered list of
//! subscriber callbacks. Callbacks take no payload: they re-read the value
//! themselves, and by the time any callback runs the value has already been
//! replaced.
//!
//! # Invariants
//!
//! 1. `set` writes first, then notifies.
//! 2. Subscribers are notified in registration order.
//! 3. Each notification pass runs over a snapshot of the subscriber list;
//!    subscribers added or removed during the pass take effect on the next one.
//! 4. A panicking subscriber aborts the rest of the pass and the panic
//!    propagates out of `set`.
//! 5. Inside [`batch`], values update immediately but notifications wait for
//!    the outermost batch to end, and each callback runs at most once.

pub mod ops;

use crate::error::Cancelled;
use crate::registry::{lock, register, Registry, Subscription};
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;

pub use ops::{combine, combine_with_eq, map, map2, map_with_eq, Derived};

pub(crate) type Callback = dyn Fn() + Send + Sync;

struct Shared<T> {
    value: Mutex<T>,
    subscribers: Arc<Mutex<Registry<Callback>>>,
}

/// A shared value with change callbacks.
///
/// Cloning an `Observable` clones the handle, not the value.
pub struct Observable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*lock(&self.shared.value))
            .field("subscribers", &lock(&self.shared.subscribers).len())
            .finish()
    }
}

impl<T: Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Observable<T> {
    /// Create an observable holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                value: Mutex::new(value),
                subscribers: Arc::new(Mutex::new(Registry::new())),
            }),
        }
    }

    /// Create an observable from an initializer.
    pub fn new_with(init: impl FnOnce() -> T) -> Self {
        Self::new(init())
    }

    /// Current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        lock(&self.shared.value).clone()
    }

    /// Borrow the current value.
    ///
    /// The value stays locked while `f` runs, so `f` must not touch this
    /// observable again.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&lock(&self.shared.value))
    }

    /// Replace the value and notify every subscriber.
    pub fn set(&self, value: T) {
        *lock(&self.shared.value) = value;
        self.notify();
    }

    /// Replace the value, notifying only when `eq` says it changed.
    ///
    /// The new value is stored even when equal, so equal-but-not-identical
    /// values never leave a stale copy behind. Returns whether subscribers
    /// were notified.
    pub fn set_if_changed(&self, value: T, eq: impl FnOnce(&T, &T) -> bool) -> bool {
        let changed = {
            let mut current = lock(&self.shared.value);
            let changed = !eq(&current, &value);
            *current = value;
            changed
        };
        if changed {
            self.notify();
        }
        changed
    }

    /// Replace the value without notifying. The caller is expected to call
    /// [`notify`](Self::notify) once it has released its own locks.
    pub(crate) fn store(&self, value: T) {
        *lock(&self.shared.value) = value;
    }

    /// Mutate the value in place, then notify.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut lock(&self.shared.value));
        self.notify();
    }

    /// Register a callback invoked after every change.
    ///
    /// Registering the same function twice registers it twice.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.subscribe_shared(Arc::new(callback))
    }

    pub(crate) fn subscribe_shared(&self, callback: Arc<Callback>) -> Subscription {
        register(&self.shared.subscribers, callback)
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }

    /// Invoke every subscriber without changing the value.
    pub fn notify(&self) {
        let snapshot = lock(&self.shared.subscribers).snapshot();
        for (_, callback) in snapshot {
            if !batch_defer(&callback) {
                callback();
            }
        }
    }

    /// Resolve on the next notification.
    ///
    /// The subscription is taken eagerly, so a change between this call and
    /// the first poll is not missed. Dropping the future unsubscribes. Fails
    /// with [`Cancelled`] if every handle to the observable is dropped first.
    pub fn changed(&self) -> impl std::future::Future<Output = Result<(), Cancelled>> + Send + 'static
    where
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(move || {
            if let Some(tx) = lock(&tx).take() {
                let _ = tx.send(());
            }
        });
        async move {
            let _subscription = subscription;
            rx.await.map_err(|_| Cancelled)
        }
    }

    /// A handle that does not keep the observable alive.
    pub fn downgrade(&self) -> WeakObservable<T> {
        WeakObservable {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Non-owning handle to an [`Observable`].
pub struct WeakObservable<T> {
    shared: Weak<Shared<T>>,
}

impl<T> Clone for WeakObservable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> WeakObservable<T> {
    pub fn upgrade(&self) -> Option<Observable<T>> {
        self.shared.upgrade().map(|shared| Observable { shared })
    }
}

/// Anything that can notify a no-payload callback.
///
/// Lets heterogeneous observables be listed together as triggers.
pub trait Notifier: Send + Sync {
    fn subscribe_notify(&self, callback: Arc<dyn Fn() + Send + Sync>) -> Subscription;
}

impl<T: Send + 'static> Notifier for Observable<T> {
    fn subscribe_notify(&self, callback: Arc<dyn Fn() + Send + Sync>) -> Subscription {
        self.subscribe_shared(callback)
    }
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BatchQueue {
    depth: usize,
    pending: Vec<Arc<Callback>>,
    seen: HashSet<usize>,
}

thread_local! {
    static BATCH: RefCell<BatchQueue> = RefCell::new(BatchQueue::default());
}

/// Queue `callback` if a batch is open on this thread. Returns whether it was
/// queued (or already queued).
fn batch_defer(callback: &Arc<Callback>) -> bool {
    BATCH.with(|batch| {
        let mut batch = batch.borrow_mut();
        if batch.depth == 0 {
            return false;
        }
        let key = Arc::as_ptr(callback) as *const () as usize;
        if batch.seen.insert(key) {
            batch.pending.push(Arc::clone(callback));
        }
        true
    })
}

struct BatchGuard;

impl BatchGuard {
    fn enter() -> Self {
        BATCH.with(|batch| batch.borrow_mut().depth += 1);
        BatchGuard
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let pending = BATCH.with(|batch| {
            let mut batch = batch.borrow_mut();
            batch.depth -= 1;
            if batch.depth > 0 {
                return Vec::new();
            }
            batch.seen.clear();
            std::mem::take(&mut batch.pending)
        });
        if std::thread::panicking() {
            return;
        }
        for callback in pending {
            callback();
        }
    }
}

/// Run `f` with notifications deferred until the outermost batch ends.
///
/// Values written inside the batch are visible immediately. Each distinct
/// subscriber callback fires once when the batch closes, no matter how many
/// of its sources changed, so a [`combine`]d value recomputes once.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    let _guard = BatchGuard::enter();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_set() {
        let value = Observable::new(1);
        assert_eq!(value.get(), 1);
        value.set(2);
        assert_eq!(value.get(), 2);
        assert_eq!(Observable::new_with(|| "init").get(), "init");
    }

    #[test]
    fn test_subscribers_see_new_value_in_order() {
        let value = Observable::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut subs = Vec::new();
        for name in ["a", "b", "c"] {
            let reader = value.clone();
            let seen = Arc::clone(&seen);
            subs.push(value.subscribe(move || {
                lock(&seen).push((name, reader.get()));
            }));
        }

        value.set(7);
        value.set(8);
        assert_eq!(
            *lock(&seen),
            vec![("a", 7), ("b", 7), ("c", 7), ("a", 8), ("b", 8), ("c", 8)]
        );
    }

    #[test]
    fn test_same_callback_twice_fires_twice() {
        let value = Observable::new(0);
        let count = Arc::new(AtomicUsize::new(0));
        let callback: Arc<dyn Fn() + Send + Sync> = {
            let count = Arc::clone(&count);
            Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _a = value.subscribe_notify(Arc::clone(&callback));
        let _b = value.subscribe_notify(callback);

        value.set(1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribe_during_notification_applies_next_pass() {
        let value = Observable::new(0);
        let late_calls = Arc::new(AtomicUsize::new(0));
        let late_subs = Arc::new(Mutex::new(Vec::new()));

        let _adder = {
            let source = value.clone();
            let late_calls = Arc::clone(&late_calls);
            let late_subs = Arc::clone(&late_subs);
            value.subscribe(move || {
                let late_calls = Arc::clone(&late_calls);
                let sub = source.subscribe(move || {
                    late_calls.fetch_add(1, Ordering::SeqCst);
                });
                lock(&late_subs).push(sub);
            })
        };

        value.set(1);
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        value.set(2);
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_during_notification_applies_next_pass() {
        let value = Observable::new(0);
        let second_calls = Arc::new(AtomicUsize::new(0));
        let second_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let _first = {
            let slot = Arc::clone(&second_slot);
            value.subscribe(move || {
                if let Some(sub) = lock(&slot).take() {
                    sub.unsubscribe();
                }
            })
        };
        let second = {
            let calls = Arc::clone(&second_calls);
            value.subscribe(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        *lock(&second_slot) = Some(second);

        value.set(1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        value.set(2);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_if_changed_stores_but_suppresses() {
        let value = Observable::new((1, "first"));
        let count = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let count = Arc::clone(&count);
            value.subscribe(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(!value.set_if_changed((1, "second"), |a, b| a.0 == b.0));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(value.get(), (1, "second"));

        assert!(value.set_if_changed((2, "third"), |a, b| a.0 == b.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "subscriber failed")]
    fn test_subscriber_panic_propagates() {
        let value = Observable::new(0);
        let _sub = value.subscribe(|| panic!("subscriber failed"));
        value.set(1);
    }

    #[test]
    fn test_panic_skips_remaining_subscribers() {
        let value = Observable::new(0);
        let after = Arc::new(AtomicUsize::new(0));
        let _bad = value.subscribe(|| panic!("boom"));
        let _after = {
            let after = Arc::clone(&after);
            value.subscribe(move || {
                after.fetch_add(1, Ordering::SeqCst);
            })
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| value.set(1)));
        assert!(result.is_err());
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(value.get(), 1);
    }

    #[test]
    fn test_batch_defers_and_dedupes() {
        let a = Observable::new(0);
        let b = Observable::new(0);
        let count = Arc::new(AtomicUsize::new(0));
        let callback: Arc<dyn Fn() + Send + Sync> = {
            let count = Arc::clone(&count);
            Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _sa = a.subscribe_notify(Arc::clone(&callback));
        let _sb = b.subscribe_notify(callback);

        batch(|| {
            a.set(1);
            b.set(2);
            batch(|| a.set(3));
            assert_eq!(a.get(), 3);
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);

        a.set(4);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_weak_handle() {
        let value = Observable::new(5);
        let weak = value.downgrade();
        assert_eq!(weak.upgrade().map(|v| v.get()), Some(5));
        drop(value);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_changed_resolves_on_next_set() {
        let value = Observable::new(0);
        let changed = value.changed();
        assert_eq!(value.subscriber_count(), 1);
        value.set(1);
        assert_eq!(changed.await, Ok(()));
        assert_eq!(value.subscriber_count(), 0);
    }

    #[test]
    fn test_changed_pending_until_set() {
        let value = Observable::new(0);
        let mut changed = tokio_test::task::spawn(value.changed());
        tokio_test::assert_pending!(changed.poll());
        value.set(1);
        tokio_test::assert_ready_eq!(changed.poll(), Ok(()));
    }

    #[test]
    fn test_dropping_changed_unsubscribes() {
        let value = Observable::new(0);
        let changed = value.changed();
        drop(changed);
        assert_eq!(value.subscriber_count(), 0);
    }
}
