//! Session clock: the virtual playback position of one live journey.
//!
//! Time is measured in milliseconds since the start of the journey and may
//! begin negative to give a pre-roll. The host drives the clock by calling
//! [`SessionClock::on_frame`] with a monotonic timestamp once per frame
//! (see [`driver::spawn_frame_driver`]); each frame advances time by the frame
//! delta and fires every tick listener with `(last, current)`.
//!
//! # Phases
//!
//! ```text
//! NotStarted --frame--> Running --set_paused(true)--> Paused
//!     ^                                                  |
//!     +-------------------set_paused(false)--------------+
//! any --stop()--> Stopped (terminal)
//! ```
//!
//! A clock in `NotStarted` is waiting for a baseline frame: the first frame
//! after construction or after unpausing only records its timestamp, so time
//! spent paused never counts.

pub mod coarse;
pub mod driver;

pub use coarse::CoarseTime;

use crate::error::Cancelled;
use crate::observable::Observable;
use crate::registry::{lock, register, Registry, Subscription};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// One clock advance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickEvent {
    /// Time before this tick. Equals the previous tick's `current`.
    pub last: f64,
    pub current: f64,
}

impl TickEvent {
    /// Whether this tick moved time from below `boundary` to at or above it.
    pub fn crossed(&self, boundary: f64) -> bool {
        self.last < boundary && self.current >= boundary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockPhase {
    NotStarted,
    Running,
    Paused,
    Stopped,
}

/// Returned by a listener registered with [`SessionClock::on_tick_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickFlow {
    Continue,
    /// Remove this listener before the next tick.
    Done,
}

type Listener = Mutex<dyn FnMut(TickEvent) -> TickFlow + Send>;

struct ClockState {
    phase: ClockPhase,
    last_frame_at: Option<f64>,
    time: f64,
}

struct ClockInner {
    time: Observable<f64>,
    state: Mutex<ClockState>,
    listeners: Arc<Mutex<Registry<Listener>>>,
    stopped: watch::Sender<bool>,
}

/// Handle for a tick listener. Dropping it removes the listener.
#[must_use = "dropping a TickSubscription removes the listener"]
#[derive(Debug)]
pub struct TickSubscription(Subscription);

impl TickSubscription {
    /// Remove the listener. Repeated calls are no-ops.
    pub fn cancel(&self) {
        self.0.unsubscribe();
    }

    pub fn is_active(&self) -> bool {
        self.0.is_active()
    }

    /// Keep the listener until the clock stops.
    pub fn detach(self) {
        self.0.detach();
    }
}

/// Shared handle to a session clock. Clones refer to the same clock.
#[derive(Clone)]
pub struct SessionClock {
    inner: Arc<ClockInner>,
}

impl std::fmt::Debug for SessionClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("SessionClock")
            .field("phase", &state.phase)
            .field("time", &state.time)
            .finish()
    }
}

impl SessionClock {
    /// Create a clock at `initial_ms`. Unless `paused`, it starts ticking on
    /// the second frame it receives.
    pub fn new(initial_ms: f64, paused: bool) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClockInner {
                time: Observable::new(initial_ms),
                state: Mutex::new(ClockState {
                    phase: if paused {
                        ClockPhase::Paused
                    } else {
                        ClockPhase::NotStarted
                    },
                    last_frame_at: None,
                    time: initial_ms,
                }),
                listeners: Arc::new(Mutex::new(Registry::new())),
                stopped,
            }),
        }
    }

    /// Host frame callback. `frame_at_ms` is a monotonic timestamp.
    pub fn on_frame(&self, frame_at_ms: f64) {
        let event = {
            let mut state = lock(&self.inner.state);
            match state.phase {
                ClockPhase::Paused | ClockPhase::Stopped => return,
                ClockPhase::NotStarted => {
                    state.last_frame_at = Some(frame_at_ms);
                    state.phase = ClockPhase::Running;
                    return;
                }
                ClockPhase::Running => {}
            }
            let previous_frame = state.last_frame_at.unwrap_or(frame_at_ms);
            state.last_frame_at = Some(frame_at_ms);
            let last = state.time;
            state.time += (frame_at_ms - previous_frame).max(0.0);
            TickEvent {
                last,
                current: state.time,
            }
        };

        self.inner.time.set(event.current);

        let snapshot = lock(&self.inner.listeners).snapshot();
        for (id, listener) in snapshot {
            if self.is_stopped() {
                break;
            }
            let flow = {
                let mut listener = lock(&listener);
                (&mut *listener)(event)
            };
            if flow == TickFlow::Done {
                let removed = lock(&self.inner.listeners).remove(id);
                drop(removed);
            }
        }
    }

    /// Pause or resume. Resuming waits for a fresh baseline frame.
    pub fn set_paused(&self, paused: bool) {
        let mut state = lock(&self.inner.state);
        let next = match (state.phase, paused) {
            (ClockPhase::Paused, false) => ClockPhase::NotStarted,
            (ClockPhase::NotStarted | ClockPhase::Running, true) => ClockPhase::Paused,
            _ => return,
        };
        state.phase = next;
        state.last_frame_at = None;
        debug!(paused, time = state.time, "clock pause state changed");
    }

    /// Stop permanently. Every listener is released, so pending waits resolve
    /// as [`Cancelled`], and later registrations are inert.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.phase == ClockPhase::Stopped {
                return;
            }
            state.phase = ClockPhase::Stopped;
            debug!(time = state.time, "clock stopped");
        }
        self.inner.stopped.send_replace(true);
        let drained = lock(&self.inner.listeners).close();
        drop(drained);
    }

    pub fn time(&self) -> f64 {
        lock(&self.inner.state).time
    }

    /// Observable journey time, updated before tick listeners run.
    pub fn time_cell(&self) -> Observable<f64> {
        self.inner.time.clone()
    }

    pub fn phase(&self) -> ClockPhase {
        lock(&self.inner.state).phase
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.phase() == ClockPhase::Paused
    }

    /// Register a listener called on every tick, in registration order.
    pub fn on_tick(&self, mut listener: impl FnMut(TickEvent) + Send + 'static) -> TickSubscription {
        self.on_tick_until(move |event| {
            listener(event);
            TickFlow::Continue
        })
    }

    /// Register a listener that removes itself by returning
    /// [`TickFlow::Done`].
    pub fn on_tick_until(
        &self,
        listener: impl FnMut(TickEvent) -> TickFlow + Send + 'static,
    ) -> TickSubscription {
        let listener: Arc<Listener> = Arc::new(Mutex::new(listener));
        TickSubscription(register(&self.inner.listeners, listener))
    }

    /// Resolve with the first tick for which `condition` holds.
    ///
    /// Only future ticks are tested. Resolves `Err(Cancelled)` if the clock
    /// stops first; dropping the future removes the listener.
    pub fn wait_until(
        &self,
        mut condition: impl FnMut(TickEvent) -> bool + Send + 'static,
    ) -> impl Future<Output = Result<TickEvent, Cancelled>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let subscription = self.on_tick_until(move |event| {
            if !condition(event) {
                return TickFlow::Continue;
            }
            if let Some(tx) = tx.take() {
                let _ = tx.send(event);
            }
            TickFlow::Done
        });
        async move {
            let _subscription = subscription;
            rx.await.map_err(|_| Cancelled)
        }
    }

    /// Resolve once journey time is at least `target_ms`, immediately if it
    /// already is.
    pub fn wait_for_time(
        &self,
        target_ms: f64,
    ) -> impl Future<Output = Result<(), Cancelled>> + Send + 'static {
        let pending = if self.is_stopped() {
            Err(Cancelled)
        } else if self.time() >= target_ms {
            Ok(None)
        } else {
            Ok(Some(self.wait_until(move |event| event.current >= target_ms)))
        };
        async move {
            match pending {
                Err(cancelled) => Err(cancelled),
                Ok(None) => Ok(()),
                Ok(Some(wait)) => wait.await.map(|_| ()),
            }
        }
    }

    /// Resolve on the next tick.
    pub fn next_tick(&self) -> impl Future<Output = Result<TickEvent, Cancelled>> + Send + 'static {
        self.wait_until(|_| true)
    }

    /// Run `future` to completion unless the clock stops first.
    pub async fn or_stopped<F: Future>(&self, future: F) -> Result<F::Output, Cancelled> {
        let stopped = self.stopped();
        tokio::select! {
            biased;
            _ = stopped => Err(Cancelled),
            output = future => Ok(output),
        }
    }

    /// Resolve once the clock has stopped, or once every handle is gone.
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.inner.stopped.subscribe();
        async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_clock(initial: f64) -> SessionClock {
        let clock = SessionClock::new(initial, false);
        clock.on_frame(0.0);
        clock
    }

    fn recorder(clock: &SessionClock) -> (Arc<Mutex<Vec<TickEvent>>>, TickSubscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let events = Arc::clone(&events);
            clock.on_tick(move |event| lock(&events).push(event))
        };
        (events, sub)
    }

    #[test]
    fn test_first_frame_sets_baseline() {
        let clock = SessionClock::new(-2500.0, false);
        assert_eq!(clock.phase(), ClockPhase::NotStarted);
        let (events, _sub) = recorder(&clock);

        clock.on_frame(1_000_000.0);
        assert_eq!(clock.phase(), ClockPhase::Running);
        assert_eq!(clock.time(), -2500.0);
        assert!(lock(&events).is_empty());

        clock.on_frame(1_000_016.0);
        assert_eq!(clock.time(), -2484.0);
        assert_eq!(clock.time_cell().get(), -2484.0);
    }

    #[test]
    fn test_ticks_are_contiguous() {
        let clock = running_clock(0.0);
        let (events, _sub) = recorder(&clock);

        for frame in [16.0, 33.0, 50.0, 66.0, 83.0] {
            clock.on_frame(frame);
        }
        let events = lock(&events);
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].last, 0.0);
        for pair in events.windows(2) {
            assert_eq!(pair[0].current, pair[1].last);
        }
        assert_eq!(events[4].current, 83.0);
    }

    #[test]
    fn test_listeners_fire_in_registration_order() {
        let clock = running_clock(0.0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<_> = (0..3)
            .map(|n| {
                let order = Arc::clone(&order);
                clock.on_tick(move |_| lock(&order).push(n))
            })
            .collect();

        clock.on_frame(10.0);
        assert_eq!(*lock(&order), vec![0, 1, 2]);

        subs[1].cancel();
        subs[1].cancel();
        clock.on_frame(20.0);
        assert_eq!(*lock(&order), vec![0, 1, 2, 0, 2]);
    }

    #[test]
    fn test_on_tick_until_removes_itself() {
        let clock = running_clock(0.0);
        let calls = Arc::new(Mutex::new(0));
        let _sub = {
            let calls = Arc::clone(&calls);
            clock.on_tick_until(move |event| {
                *lock(&calls) += 1;
                if event.current >= 20.0 {
                    TickFlow::Done
                } else {
                    TickFlow::Continue
                }
            })
        };
        for frame in [10.0, 20.0, 30.0, 40.0] {
            clock.on_frame(frame);
        }
        assert_eq!(*lock(&calls), 2);
    }

    #[test]
    fn test_pause_discards_elapsed_time() {
        let clock = running_clock(0.0);
        clock.on_frame(100.0);
        clock.set_paused(true);
        assert!(clock.is_paused());

        clock.on_frame(5_000.0);
        assert_eq!(clock.time(), 100.0);

        clock.set_paused(false);
        assert_eq!(clock.phase(), ClockPhase::NotStarted);
        clock.on_frame(9_000.0);
        assert_eq!(clock.time(), 100.0);
        clock.on_frame(9_016.0);
        assert_eq!(clock.time(), 116.0);
    }

    #[test]
    fn test_backwards_frame_does_not_rewind() {
        let clock = running_clock(0.0);
        clock.on_frame(50.0);
        clock.on_frame(40.0);
        assert_eq!(clock.time(), 50.0);
        clock.on_frame(60.0);
        assert_eq!(clock.time(), 70.0);
    }

    #[test]
    fn test_stop_is_terminal() {
        let clock = running_clock(0.0);
        let (events, sub) = recorder(&clock);

        clock.stop();
        clock.stop();
        assert_eq!(clock.phase(), ClockPhase::Stopped);
        assert!(clock.is_stopped());
        clock.on_frame(100.0);
        assert!(lock(&events).is_empty());

        clock.set_paused(false);
        assert_eq!(clock.phase(), ClockPhase::Stopped);

        let late = clock.on_tick(|_| {});
        assert!(!late.is_active());
        sub.cancel();
    }

    #[test]
    fn test_stop_inside_listener_skips_the_rest() {
        let clock = running_clock(0.0);
        let handle = clock.clone();
        let _stopper = clock.on_tick(move |_| handle.stop());
        let (events, _sub) = recorder(&clock);
        clock.on_frame(10.0);
        assert!(lock(&events).is_empty());
    }

    #[test]
    fn test_wait_until() {
        let clock = running_clock(0.0);
        let mut wait = tokio_test::task::spawn(clock.wait_until(|event| event.current >= 30.0));
        tokio_test::assert_pending!(wait.poll());

        clock.on_frame(20.0);
        tokio_test::assert_pending!(wait.poll());
        clock.on_frame(35.0);
        let event = tokio_test::assert_ready_ok!(wait.poll());
        assert_eq!(event, TickEvent { last: 20.0, current: 35.0 });
    }

    #[test]
    fn test_wait_for_time_ready_when_already_reached() {
        let clock = running_clock(500.0);
        let mut wait = tokio_test::task::spawn(clock.wait_for_time(100.0));
        tokio_test::assert_ready_ok!(wait.poll());

        let mut later = tokio_test::task::spawn(clock.wait_for_time(600.0));
        tokio_test::assert_pending!(later.poll());
        clock.on_frame(100.0);
        tokio_test::assert_ready_ok!(later.poll());
    }

    #[test]
    fn test_stop_cancels_waits() {
        let clock = running_clock(0.0);
        let mut tick = tokio_test::task::spawn(clock.next_tick());
        let mut stopped = tokio_test::task::spawn(clock.stopped());
        tokio_test::assert_pending!(tick.poll());
        tokio_test::assert_pending!(stopped.poll());

        clock.stop();
        assert!(tick.is_woken());
        tokio_test::assert_ready_eq!(tick.poll(), Err(Cancelled));
        tokio_test::assert_ready!(stopped.poll());

        let mut after = tokio_test::task::spawn(clock.wait_for_time(1.0));
        tokio_test::assert_ready_eq!(after.poll(), Err(Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_or_stopped() {
        let clock = running_clock(0.0);
        let done = clock.or_stopped(async { 7 }).await;
        assert_eq!(done, Ok(7));

        let stopper = clock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            stopper.stop();
        });
        let slow = clock.or_stopped(tokio::time::sleep(std::time::Duration::from_secs(60)));
        assert_eq!(slow.await, Err(Cancelled));
    }

    #[test]
    fn test_dropping_wait_removes_listener() {
        let clock = running_clock(0.0);
        let wait = clock.next_tick();
        assert_eq!(lock(&clock.inner.listeners).len(), 1);
        drop(wait);
        assert_eq!(lock(&clock.inner.listeners).len(), 0);
    }

    #[test]
    fn test_crossed() {
        let event = TickEvent {
            last: -16.0,
            current: 0.0,
        };
        assert!(event.crossed(0.0));
        assert!(!event.crossed(-16.0));
        assert!(!event.crossed(1.0));
    }
}
