//! Observable state for a value loaded over the network.
//!
//! A [`NetworkResource`] runs a fetcher and publishes its progress as a
//! [`NetworkResponse`]. Every load gets a new generation number; a result is
//! only published if its generation is still current, so a refresh, a
//! replacement or a dependency change silently discards whatever was in
//! flight.

use crate::error::Error;
use crate::observable::{Notifier, Observable};
use crate::registry::{lock, Subscription};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Progress of a network-loaded value.
#[derive(Debug)]
pub enum NetworkResponse<T> {
    Loading,
    /// Loading is blocked until a precondition holds (e.g. not logged in).
    LoadPrevented,
    /// The server has no value for this request.
    Unavailable,
    Success(T),
    Error(Arc<Error>),
}

impl<T: Clone> Clone for NetworkResponse<T> {
    fn clone(&self) -> Self {
        match self {
            NetworkResponse::Loading => NetworkResponse::Loading,
            NetworkResponse::LoadPrevented => NetworkResponse::LoadPrevented,
            NetworkResponse::Unavailable => NetworkResponse::Unavailable,
            NetworkResponse::Success(value) => NetworkResponse::Success(value.clone()),
            NetworkResponse::Error(err) => NetworkResponse::Error(Arc::clone(err)),
        }
    }
}

impl<T> NetworkResponse<T> {
    pub fn can_refresh(&self) -> bool {
        matches!(
            self,
            NetworkResponse::Success(_) | NetworkResponse::Unavailable | NetworkResponse::Error(_)
        )
    }

    pub fn can_replace(&self) -> bool {
        matches!(self, NetworkResponse::Success(_) | NetworkResponse::Unavailable)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, NetworkResponse::Loading)
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            NetworkResponse::Success(value) => Some(value),
            _ => None,
        }
    }

    fn same_variant(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Tells a fetcher that its result is no longer wanted.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the load is cancelled or the resource is gone.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        }
    }
}

type Fetcher<T> =
    Arc<dyn Fn(CancelSignal) -> BoxFuture<'static, crate::Result<Option<T>>> + Send + Sync>;

/// Options for [`NetworkResource::spawn`].
pub struct NetworkResourceOptions {
    /// Shortest time a refresh shows `Loading`, so the user sees it happen.
    pub min_refresh: Duration,
    /// While `true` the resource stays in `LoadPrevented`.
    pub load_prevented: Option<Observable<bool>>,
    /// Any notification from these reloads the resource.
    pub depends_on: Vec<Arc<dyn Notifier>>,
}

impl Default for NetworkResourceOptions {
    fn default() -> Self {
        Self {
            min_refresh: Duration::from_millis(500),
            load_prevented: None,
            depends_on: Vec::new(),
        }
    }
}

impl NetworkResourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_refresh(mut self, min_refresh: Duration) -> Self {
        self.min_refresh = min_refresh;
        self
    }

    pub fn with_load_prevented(mut self, load_prevented: Observable<bool>) -> Self {
        self.load_prevented = Some(load_prevented);
        self
    }

    pub fn depends_on(mut self, dependency: Arc<dyn Notifier>) -> Self {
        self.depends_on.push(dependency);
        self
    }
}

#[derive(Default)]
struct Control {
    generation: u64,
    cancel: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    disposed: bool,
}

impl Control {
    /// Start a new generation, cancelling whatever was in flight.
    fn supersede(&mut self) -> u64 {
        self.generation += 1;
        if let Some(cancel) = self.cancel.take() {
            cancel.send_replace(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation
    }
}

struct ResourceInner<T> {
    state: Observable<NetworkResponse<T>>,
    fetcher: Fetcher<T>,
    min_refresh: Duration,
    load_prevented: Option<Observable<bool>>,
    control: Mutex<Control>,
    runtime: Handle,
}

impl<T: Send + 'static> ResourceInner<T> {
    fn is_prevented(&self) -> bool {
        self.load_prevented.as_ref().is_some_and(|prevented| prevented.get())
    }

    fn load(self: &Arc<Self>, min_duration: Option<Duration>) {
        let (cancel, rx) = watch::channel(false);
        let generation = {
            let mut control = lock(&self.control);
            if control.disposed {
                return;
            }
            let generation = control.supersede();
            control.cancel = Some(cancel);
            self.state.store(NetworkResponse::Loading);
            generation
        };
        self.state.notify();

        // The fetcher runs unlocked: it may reload or replace this resource.
        let fetch = (self.fetcher)(CancelSignal { rx });

        let mut control = lock(&self.control);
        if control.disposed || control.generation != generation {
            debug!(generation, "load superseded while creating its fetch");
            return;
        }
        let inner = Arc::downgrade(self);
        control.task = Some(self.runtime.spawn(async move {
            let started = Instant::now();
            let result = fetch.await;
            if let Some(min_duration) = min_duration {
                tokio::time::sleep_until(started + min_duration).await;
            }
            if let Some(inner) = inner.upgrade() {
                inner.finish(generation, result);
            }
        }));
    }

    fn finish(&self, generation: u64, result: crate::Result<Option<T>>) {
        {
            let mut control = lock(&self.control);
            if control.disposed || control.generation != generation {
                debug!(generation, "discarding superseded network response");
                return;
            }
            control.cancel = None;
            control.task = None;
            self.state.store(match result {
                Ok(Some(value)) => NetworkResponse::Success(value),
                Ok(None) => NetworkResponse::Unavailable,
                Err(err) => NetworkResponse::Error(Arc::new(err)),
            });
        }
        self.state.notify();
    }

    fn prevent(&self) {
        let changed = {
            let mut control = lock(&self.control);
            if control.disposed {
                return;
            }
            control.supersede();
            let changed = !self.state.with(|state| state.same_variant(&NetworkResponse::LoadPrevented));
            self.state.store(NetworkResponse::LoadPrevented);
            changed
        };
        if changed {
            self.state.notify();
        }
    }
}

/// A value loaded by a fetcher, with refresh, replace and reload-on-change.
///
/// Dropping the resource disposes it.
pub struct NetworkResource<T> {
    inner: Arc<ResourceInner<T>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<T: Send + 'static> NetworkResource<T> {
    /// Start loading. Must be called within a tokio runtime; later loads run
    /// on the same runtime whichever thread triggers them.
    pub fn spawn<F, Fut>(fetcher: F, options: NetworkResourceOptions) -> Self
    where
        F: Fn(CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<Option<T>>> + Send + 'static,
    {
        let fetcher: Fetcher<T> = Arc::new(
            move |signal: CancelSignal| -> BoxFuture<'static, crate::Result<Option<T>>> {
                Box::pin(fetcher(signal))
            },
        );
        let inner = Arc::new(ResourceInner {
            state: Observable::new(NetworkResponse::Loading),
            fetcher,
            min_refresh: options.min_refresh,
            load_prevented: options.load_prevented,
            control: Mutex::new(Control::default()),
            runtime: Handle::current(),
        });

        let mut subscriptions = Vec::new();
        if let Some(prevented) = &inner.load_prevented {
            let weak = Arc::downgrade(&inner);
            subscriptions.push(prevented.subscribe(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.is_prevented() {
                    inner.prevent();
                } else if inner.state.with(|state| state.same_variant(&NetworkResponse::LoadPrevented)) {
                    inner.load(Some(inner.min_refresh));
                }
            }));
        }
        for dependency in &options.depends_on {
            let weak: Weak<ResourceInner<T>> = Arc::downgrade(&inner);
            subscriptions.push(dependency.subscribe_notify(Arc::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.is_prevented() {
                    inner.load(None);
                }
            })));
        }

        if inner.is_prevented() {
            inner.prevent();
        } else {
            inner.load(None);
        }

        Self {
            inner,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    pub fn state(&self) -> Observable<NetworkResponse<T>> {
        self.inner.state.clone()
    }

    /// Reload, showing `Loading` for at least the configured minimum.
    /// Does nothing while loading or prevented.
    pub fn refresh(&self) {
        if self.inner.state.with(NetworkResponse::can_refresh) {
            self.inner.load(Some(self.inner.min_refresh));
        }
    }

    /// Publish a locally known value, e.g. after the user edited it. Allowed
    /// from `Success` and `Unavailable`; returns whether it was applied.
    pub fn replace(&self, value: T) -> bool {
        {
            let mut control = lock(&self.inner.control);
            if control.disposed || !self.inner.state.with(NetworkResponse::can_replace) {
                return false;
            }
            control.supersede();
            self.inner.state.store(NetworkResponse::Success(value));
        }
        self.inner.state.notify();
        true
    }

    /// Cancel any load and stop reacting to changes. Repeated calls are
    /// no-ops.
    pub fn dispose(&self) {
        {
            let mut control = lock(&self.inner.control);
            if control.disposed {
                return;
            }
            control.supersede();
            control.disposed = true;
        }
        let subscriptions = std::mem::take(&mut *lock(&self.subscriptions));
        drop(subscriptions);
    }
}

impl<T> Drop for NetworkResource<T> {
    fn drop(&mut self) {
        let mut control = lock(&self.inner.control);
        if !control.disposed {
            control.supersede();
            control.disposed = true;
        }
    }
}
