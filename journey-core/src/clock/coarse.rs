//! Low-resolution views of journey time.

use super::{SessionClock, TickSubscription};
use crate::observable::Observable;
use crate::registry::Subscription;

/// Journey time quantized to `granularity_ms` steps.
///
/// The index is `floor((time + offset_ms) / granularity_ms)`, optionally
/// clamped at zero, and subscribers are only notified when it changes. Useful
/// for anything that needs to react every second or every bin rather than
/// every frame.
pub struct CoarseTime {
    value: Observable<i64>,
    _tick: TickSubscription,
}

impl CoarseTime {
    pub fn new(clock: &SessionClock, offset_ms: f64, granularity_ms: f64, clamp_at_zero: bool) -> Self {
        let index = move |time: f64| {
            let index = ((time + offset_ms) / granularity_ms).floor() as i64;
            if clamp_at_zero {
                index.max(0)
            } else {
                index
            }
        };

        let value = Observable::new(index(clock.time()));
        let target = value.clone();
        let tick = clock.on_tick(move |event| {
            target.set_if_changed(index(event.current), |a, b| a == b);
        });
        Self { value, _tick: tick }
    }

    pub fn get(&self) -> i64 {
        self.value.get()
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.value.subscribe(callback)
    }

    /// The index as an observable. It stops updating once this `CoarseTime`
    /// is dropped.
    pub fn observable(&self) -> Observable<i64> {
        self.value.clone()
    }
}
