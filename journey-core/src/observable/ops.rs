//! Derived observables.
//!
//! A [`Derived`] owns its upstream subscriptions: while it is alive it
//! recomputes on every upstream notification, and dropping it releases them.
//! Sources are held weakly so a derived value never keeps its inputs alive.

use super::{Callback, Observable};
use crate::error::Cancelled;
use crate::registry::Subscription;
use std::sync::Arc;

/// An observable computed from other observables.
pub struct Derived<T> {
    value: Observable<T>,
    _upstream: Vec<Subscription>,
}

impl<T> Derived<T> {
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.get()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.value.with(f)
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.value.subscribe(callback)
    }

    pub fn changed(&self) -> impl std::future::Future<Output = Result<(), Cancelled>> + Send + 'static
    where
        T: Send + 'static,
    {
        self.value.changed()
    }

    /// The underlying observable. It only keeps updating while this
    /// `Derived` is alive.
    pub fn observable(&self) -> Observable<T> {
        self.value.clone()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("value", &self.value)
            .field("upstream", &self._upstream.len())
            .finish()
    }
}

/// Derive a value from one source, notifying on every source change.
pub fn map<S, T, F>(source: &Observable<S>, f: F) -> Derived<T>
where
    S: Send + 'static,
    T: Send + 'static,
    F: Fn(&S) -> T + Send + Sync + 'static,
{
    map_inner(source, f, None::<fn(&T, &T) -> bool>)
}

/// Derive a value from one source, suppressing notifications when `eq` says
/// the recomputed value is unchanged. The recomputed value is always stored.
pub fn map_with_eq<S, T, F, E>(source: &Observable<S>, f: F, eq: E) -> Derived<T>
where
    S: Send + 'static,
    T: Send + 'static,
    F: Fn(&S) -> T + Send + Sync + 'static,
    E: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    map_inner(source, f, Some(eq))
}

fn map_inner<S, T, F, E>(source: &Observable<S>, f: F, eq: Option<E>) -> Derived<T>
where
    S: Send + 'static,
    T: Send + 'static,
    F: Fn(&S) -> T + Send + Sync + 'static,
    E: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    let value = Observable::new(source.with(&f));
    let target = value.clone();
    let weak_source = source.downgrade();
    let subscription = source.subscribe(move || {
        let Some(source) = weak_source.upgrade() else {
            return;
        };
        let next = source.with(&f);
        publish(&target, next, eq.as_ref());
    });
    Derived {
        value,
        _upstream: vec![subscription],
    }
}

/// Derive a value from two sources of different types.
pub fn map2<A, B, T, F>(a: &Observable<A>, b: &Observable<B>, f: F) -> Derived<T>
where
    A: Send + 'static,
    B: Send + 'static,
    T: Send + 'static,
    F: Fn(&A, &B) -> T + Send + Sync + 'static,
{
    let compute = move |a: &Observable<A>, b: &Observable<B>| a.with(|a| b.with(|b| f(a, b)));
    let value = Observable::new(compute(a, b));
    let target = value.clone();
    let (weak_a, weak_b) = (a.downgrade(), b.downgrade());
    let recompute: Arc<Callback> = Arc::new(move || {
        if let (Some(a), Some(b)) = (weak_a.upgrade(), weak_b.upgrade()) {
            target.set(compute(&a, &b));
        }
    });
    let upstream = vec![
        a.subscribe_shared(Arc::clone(&recompute)),
        b.subscribe_shared(recompute),
    ];
    Derived {
        value,
        _upstream: upstream,
    }
}

/// Derive a value from any number of sources of one type.
///
/// Every source shares a single recompute callback, so inside a
/// [`batch`](super::batch) that touches several sources the value is
/// recomputed once.
pub fn combine<S, T, F>(sources: &[Observable<S>], f: F) -> Derived<T>
where
    S: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(&[S]) -> T + Send + Sync + 'static,
{
    combine_inner(sources, f, None::<fn(&T, &T) -> bool>)
}

/// [`combine`] with equality suppression.
pub fn combine_with_eq<S, T, F, E>(sources: &[Observable<S>], f: F, eq: E) -> Derived<T>
where
    S: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(&[S]) -> T + Send + Sync + 'static,
    E: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    combine_inner(sources, f, Some(eq))
}

fn combine_inner<S, T, F, E>(sources: &[Observable<S>], f: F, eq: Option<E>) -> Derived<T>
where
    S: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(&[S]) -> T + Send + Sync + 'static,
    E: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    let current: Vec<S> = sources.iter().map(Observable::get).collect();
    let value = Observable::new(f(&current));
    let target = value.clone();
    let weak_sources: Vec<_> = sources.iter().map(Observable::downgrade).collect();

    let recompute: Arc<Callback> = Arc::new(move || {
        let mut current = Vec::with_capacity(weak_sources.len());
        for weak in &weak_sources {
            match weak.upgrade() {
                Some(source) => current.push(source.get()),
                None => return,
            }
        }
        publish(&target, f(&current), eq.as_ref());
    });

    let upstream = sources
        .iter()
        .map(|source| source.subscribe_shared(Arc::clone(&recompute)))
        .collect();
    Derived {
        value,
        _upstream: upstream,
    }
}

fn publish<T, E>(target: &Observable<T>, next: T, eq: Option<&E>)
where
    E: Fn(&T, &T) -> bool,
{
    match eq {
        Some(eq) => {
            target.set_if_changed(next, eq);
        }
        None => target.set(next),
    }
}

#[cfg(test)]
mod tests {
    use super::super::batch;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter<T: Send + 'static>(derived: &Derived<T>) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let sub = {
            let count = Arc::clone(&count);
            derived.subscribe(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, sub)
    }

    #[test]
    fn test_map_recomputes() {
        let source = Observable::new(2);
        let doubled = map(&source, |n| n * 2);
        assert_eq!(doubled.get(), 4);

        source.set(5);
        assert_eq!(doubled.get(), 10);
    }

    #[test]
    fn test_map_with_eq_suppresses_but_stores() {
        let source = Observable::new(3);
        let parity = map_with_eq(&source, |n| (n % 2, *n), |a, b| a.0 == b.0);
        let (count, _sub) = counter(&parity);

        source.set(5);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(parity.get(), (1, 5));

        source.set(6);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(parity.get(), (0, 6));
    }

    #[test]
    fn test_map2() {
        let name = Observable::new("ada".to_string());
        let age = Observable::new(36u32);
        let label = map2(&name, &age, |name, age| format!("{name} ({age})"));
        assert_eq!(label.get(), "ada (36)");

        age.set(37);
        assert_eq!(label.get(), "ada (37)");
    }

    #[test]
    fn test_combine_recomputes_once_per_batch() {
        let sources: Vec<_> = (0..3).map(Observable::new).collect();
        let computations = Arc::new(AtomicUsize::new(0));
        let sum = {
            let computations = Arc::clone(&computations);
            combine(&sources, move |values: &[i32]| {
                computations.fetch_add(1, Ordering::SeqCst);
                values.iter().sum::<i32>()
            })
        };
        assert_eq!(sum.get(), 3);
        assert_eq!(computations.load(Ordering::SeqCst), 1);

        batch(|| {
            sources[0].set(10);
            sources[2].set(20);
        });
        assert_eq!(sum.get(), 31);
        assert_eq!(computations.load(Ordering::SeqCst), 2);

        sources[1].set(0);
        assert_eq!(sum.get(), 30);
        assert_eq!(computations.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_combine_with_eq() {
        let sources = vec![Observable::new(1), Observable::new(2)];
        let any_even = combine_with_eq(
            &sources,
            |values: &[i32]| values.iter().any(|v| v % 2 == 0),
            |a, b| a == b,
        );
        let (count, _sub) = counter(&any_even);

        sources[0].set(3);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sources[1].set(5);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!any_even.get());
    }

    #[test]
    fn test_drop_releases_upstream() {
        let source = Observable::new(1);
        let derived = map(&source, |n| n + 1);
        assert_eq!(source.subscriber_count(), 1);
        drop(derived);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn test_derived_does_not_keep_source_alive() {
        let source = Observable::new(1);
        let weak = source.downgrade();
        let derived = map(&source, |n| n + 1);
        drop(source);
        assert!(weak.upgrade().is_none());
        assert_eq!(derived.get(), 2);
    }

    #[test]
    fn test_chained_derivations() {
        let source = Observable::new(1);
        let plus_one = map(&source, |n| n + 1);
        let squared = map(&plus_one.observable(), |n| n * n);

        source.set(3);
        assert_eq!(squared.get(), 16);
    }
}
