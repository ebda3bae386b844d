//! Join and leave analytics for a live session.
//!
//! A session is joined when journey time crosses zero (the end of the
//! pre-roll) and left when it crosses the journey's duration, or when the host
//! signals that the page is unloading. Each event is sent at most once per
//! session, even across trackers, because the flags live in a
//! [`SessionFlagStore`].

use crate::backend::JourneyBackend;
use crate::clock::{SessionClock, TickFlow, TickSubscription};
use crate::flags::{JoinLeaveInfo, SessionFlagStore};
use crate::journey::JourneyRef;
use crate::observable::Observable;
use crate::registry::{lock, Subscription};
use journey_api::{EventBody, EventKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug)]
struct LaneEvent {
    kind: EventKind,
    body: EventBody,
    /// Sent even if the clock stops before the lane gets to it.
    keepalive: bool,
}

struct Shared {
    clock: SessionClock,
    journey: JourneyRef,
    flags: Arc<dyn SessionFlagStore>,
    info: Observable<JoinLeaveInfo>,
    lane: Mutex<Option<mpsc::UnboundedSender<LaneEvent>>>,
}

impl Shared {
    fn join(&self, at_ms: f64) {
        if !self.flags.mark_joined(&self.journey.session_uid) {
            return;
        }
        self.publish_info();
        debug!(session = %self.journey.session_uid, at_ms, "joined journey");
        self.post(EventKind::Join, at_ms, false);
    }

    fn leave(&self, at_ms: f64, keepalive: bool) {
        if !self.flags.mark_left(&self.journey.session_uid) {
            return;
        }
        self.publish_info();
        debug!(session = %self.journey.session_uid, at_ms, keepalive, "left journey");
        self.post(EventKind::Leave, at_ms, keepalive);
    }

    fn unload(&self) {
        if self.clock.is_stopped() {
            return;
        }
        let at_ms = self.clock.time().min(self.journey.duration_ms());
        self.leave(at_ms, true);
    }

    fn publish_info(&self) {
        let info = self.flags.load(&self.journey.session_uid);
        self.info.set_if_changed(info, |a, b| a == b);
    }

    fn post(&self, kind: EventKind, at_ms: f64, keepalive: bool) {
        let event = LaneEvent {
            kind,
            body: self.journey.event_body(at_ms),
            keepalive,
        };
        if let Some(lane) = lock(&self.lane).as_ref() {
            let _ = lane.send(event);
        }
    }
}

/// Sends the join and leave events for one session.
///
/// Dropping the tracker stops it.
pub struct JoinLeaveTracker {
    shared: Arc<Shared>,
    ticks: Mutex<Vec<TickSubscription>>,
    unload: Mutex<Option<Subscription>>,
    stopped: AtomicBool,
}

impl JoinLeaveTracker {
    /// Start tracking. Must be called within a tokio runtime.
    ///
    /// If the clock is already inside the journey and the session has not
    /// joined, the join is sent immediately at the current time. `unload`
    /// turning `true` sends a best-effort leave.
    pub fn start(
        clock: &SessionClock,
        journey: JourneyRef,
        backend: Arc<dyn JourneyBackend>,
        flags: Arc<dyn SessionFlagStore>,
        unload: Option<&Observable<bool>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(clock.clone(), backend, rx));

        let session_uid = journey.session_uid.clone();
        let duration_ms = journey.duration_ms();
        let shared = Arc::new(Shared {
            clock: clock.clone(),
            info: Observable::new(flags.load(&session_uid)),
            journey,
            flags,
            lane: Mutex::new(Some(tx)),
        });

        let now = clock.time();
        if !clock.is_stopped() && (0.0..duration_ms).contains(&now) {
            shared.join(now);
        }

        let mut ticks = Vec::new();
        let info = shared.info.get();
        if !info.joined {
            let shared = Arc::clone(&shared);
            ticks.push(clock.on_tick_until(move |event| {
                if !event.crossed(0.0) {
                    return TickFlow::Continue;
                }
                shared.join(event.last.max(0.0));
                TickFlow::Done
            }));
        }
        if !info.left {
            let shared = Arc::clone(&shared);
            ticks.push(clock.on_tick_until(move |event| {
                if !event.crossed(duration_ms) {
                    return TickFlow::Continue;
                }
                shared.leave(event.current.min(duration_ms), false);
                TickFlow::Done
            }));
        }

        let unload = unload.map(|signal| {
            let weak_signal = signal.downgrade();
            let shared = Arc::clone(&shared);
            signal.subscribe(move || {
                let unloading = weak_signal.upgrade().is_some_and(|signal| signal.get());
                if unloading {
                    shared.unload();
                }
            })
        });

        Self {
            shared,
            ticks: Mutex::new(ticks),
            unload: Mutex::new(unload),
            stopped: AtomicBool::new(false),
        }
    }

    /// Current flags for this session.
    pub fn info(&self) -> Observable<JoinLeaveInfo> {
        self.shared.info.clone()
    }

    /// Stop listening. Events already queued are still delivered, subject
    /// to the clock-stopped rule. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let ticks = std::mem::take(&mut *lock(&self.ticks));
        drop(ticks);
        let unload = lock(&self.unload).take();
        drop(unload);
        let lane = lock(&self.shared.lane).take();
        drop(lane);
        debug!(session = %self.shared.journey.session_uid, "join/leave tracker stopped");
    }
}

impl Drop for JoinLeaveTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Posts events one at a time, in the order they were queued.
async fn run_lane(
    clock: SessionClock,
    backend: Arc<dyn JourneyBackend>,
    mut events: mpsc::UnboundedReceiver<LaneEvent>,
) {
    while let Some(event) = events.recv().await {
        if clock.is_stopped() && !event.keepalive {
            debug!(kind = %event.kind, "clock stopped, dropping journey event");
            continue;
        }
        if let Err(err) = backend.send_event(event.kind, &event.body).await {
            warn!(
                kind = %event.kind,
                journey_time = event.body.journey_time,
                "failed to post journey event: {}",
                err
            );
        }
    }
}
