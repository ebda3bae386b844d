//! Local override of a server-backed value.
//!
//! When the user acts (likes a moment, answers a prompt) the UI should show
//! the result at once, before the server's aggregate catches up. An
//! [`Optimistic`] merges the authoritative value with a short-lived override.
//! The override ends when its time-to-live runs out or when the authoritative
//! value has caught up with it, whichever comes first.

use crate::observable::{Observable, WeakObservable};
use crate::registry::{lock, Subscription};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

type Compare<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct Override<T> {
    value: T,
    generation: u64,
    expiry: JoinHandle<()>,
}

struct Inner<T> {
    authoritative: WeakObservable<T>,
    merged: Observable<T>,
    current: Mutex<Option<Override<T>>>,
    generation: Mutex<u64>,
    caught_up: Compare<T>,
    eq: Compare<T>,
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn recompute(&self) {
        let overridden = lock(&self.current).as_ref().map(|o| o.value.clone());
        let value = match overridden {
            Some(value) => value,
            None => match self.authoritative.upgrade() {
                Some(authoritative) => authoritative.get(),
                None => return,
            },
        };
        self.merged.set_if_changed(value, &self.eq);
    }

    fn on_authoritative(&self) {
        if let Some(authoritative) = self.authoritative.upgrade() {
            let mut current = lock(&self.current);
            let caught_up = current.as_ref().is_some_and(|o| {
                authoritative.with(|auth| (self.caught_up)(auth, &o.value))
            });
            if caught_up {
                if let Some(done) = current.take() {
                    done.expiry.abort();
                }
            }
        }
        self.recompute();
    }

    fn expire(&self, generation: u64) {
        {
            let mut current = lock(&self.current);
            if current.as_ref().map(|o| o.generation) != Some(generation) {
                return;
            }
            *current = None;
        }
        self.recompute();
    }
}

/// An authoritative value with an optional short-lived local override.
pub struct Optimistic<T> {
    inner: Arc<Inner<T>>,
    _authoritative: Subscription,
}

impl<T: Clone + Send + 'static> Optimistic<T> {
    /// `caught_up(authoritative, override)` decides when the server reflects
    /// the local change. `eq` suppresses notifications of the merged value.
    pub fn new(
        authoritative: &Observable<T>,
        caught_up: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
        eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(Inner {
            authoritative: authoritative.downgrade(),
            merged: Observable::new(authoritative.get()),
            current: Mutex::new(None),
            generation: Mutex::new(0),
            caught_up: Box::new(caught_up),
            eq: Box::new(eq),
        });
        let weak: Weak<Inner<T>> = Arc::downgrade(&inner);
        let subscription = authoritative.subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_authoritative();
            }
        });
        Self {
            inner,
            _authoritative: subscription,
        }
    }

    /// Show `value` until `ttl` elapses or the authoritative value catches
    /// up. Replaces any earlier override. Must be called within a tokio
    /// runtime.
    pub fn apply(&self, value: T, ttl: Duration) {
        let generation = {
            let mut generation = lock(&self.inner.generation);
            *generation += 1;
            *generation
        };
        let weak = Arc::downgrade(&self.inner);
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(generation);
            }
        });
        let previous = lock(&self.inner.current).replace(Override {
            value,
            generation,
            expiry,
        });
        if let Some(previous) = previous {
            previous.expiry.abort();
        }
        self.inner.recompute();
    }

    /// Drop the override now.
    pub fn clear(&self) {
        let previous = lock(&self.inner.current).take();
        if let Some(previous) = previous {
            previous.expiry.abort();
            self.inner.recompute();
        }
    }

    pub fn is_overridden(&self) -> bool {
        lock(&self.inner.current).is_some()
    }

    pub fn get(&self) -> T {
        self.inner.merged.get()
    }

    /// The merged value. It only tracks changes while this `Optimistic` is
    /// alive.
    pub fn observable(&self) -> Observable<T> {
        self.inner.merged.clone()
    }
}

impl<T> Drop for Optimistic<T> {
    fn drop(&mut self) {
        if let Some(current) = lock(&self.inner.current).take() {
            current.expiry.abort();
        }
    }
}
