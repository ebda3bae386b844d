//! One live journey session, wired together.
//!
//! [`LiveSession`] owns the clock and everything that listens to it: the
//! join/leave tracker, the statistics synchronizer and the profile picture
//! rotation. Stopping the session stops all of them.

use crate::backend::JourneyBackend;
use crate::clock::driver::{spawn_frame_driver, DEFAULT_FRAME_PERIOD};
use crate::clock::SessionClock;
use crate::error::Cancelled;
use crate::flags::{JoinLeaveInfo, MemoryFlagStore, SessionFlagStore};
use crate::join_leave::JoinLeaveTracker;
use crate::journey::JourneyRef;
use crate::observable::Observable;
use crate::profile_pictures::{ProfilePictures, ProfilePicturesState};
use crate::registry::lock;
use crate::stats::{StatBucket, StatsSynchronizer, SyncConfig, SyncStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Configuration for a live session.
#[derive(Clone)]
pub struct LiveSessionConfig {
    pub journey: JourneyRef,
    /// Journey time to start at. Negative values give a pre-roll.
    pub start_at_ms: f64,
    pub paused: bool,
    /// Drive the clock from a tokio interval. `None` leaves frames to the
    /// host via [`SessionClock::on_frame`].
    pub frame_period: Option<Duration>,
    pub sync: SyncConfig,
    pub profile_pictures: bool,
    pub flags: Arc<dyn SessionFlagStore>,
}

impl LiveSessionConfig {
    pub fn new(journey: JourneyRef) -> Self {
        Self {
            journey,
            start_at_ms: 0.0,
            paused: false,
            frame_period: Some(DEFAULT_FRAME_PERIOD),
            sync: SyncConfig::default(),
            profile_pictures: true,
            flags: Arc::new(MemoryFlagStore::new()),
        }
    }

    pub fn with_start_at(mut self, start_at_ms: f64) -> Self {
        self.start_at_ms = start_at_ms;
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    pub fn with_frame_period(mut self, frame_period: Option<Duration>) -> Self {
        self.frame_period = frame_period;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_profile_pictures(mut self, enabled: bool) -> Self {
        self.profile_pictures = enabled;
        self
    }

    /// Share join/leave flags with other sessions for the same session uid.
    pub fn with_flags(mut self, flags: Arc<dyn SessionFlagStore>) -> Self {
        self.flags = flags;
        self
    }
}

impl std::fmt::Debug for LiveSessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSessionConfig")
            .field("journey", &self.journey.uid)
            .field("start_at_ms", &self.start_at_ms)
            .field("paused", &self.paused)
            .field("frame_period", &self.frame_period)
            .field("profile_pictures", &self.profile_pictures)
            .finish()
    }
}

/// A running live journey.
///
/// Dropping the session stops it.
pub struct LiveSession {
    journey: JourneyRef,
    clock: SessionClock,
    unload: Observable<bool>,
    join_leave: JoinLeaveTracker,
    stats: StatsSynchronizer,
    pictures: Option<ProfilePictures>,
    driver: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl LiveSession {
    /// Start every component. Must be called within a tokio runtime.
    pub fn start(config: LiveSessionConfig, backend: Arc<dyn JourneyBackend>) -> Self {
        let clock = SessionClock::new(config.start_at_ms, config.paused);
        let unload = Observable::new(false);

        let join_leave = JoinLeaveTracker::start(
            &clock,
            config.journey.clone(),
            Arc::clone(&backend),
            config.flags,
            Some(&unload),
        );
        let stats = StatsSynchronizer::start(
            &clock,
            config.journey.clone(),
            Arc::clone(&backend),
            config.sync,
        );
        let pictures = config.profile_pictures.then(|| {
            ProfilePictures::start(&clock, config.journey.clone(), backend, stats.stats())
        });
        let driver = config
            .frame_period
            .map(|period| spawn_frame_driver(clock.clone(), period));

        info!(
            journey = %config.journey.uid,
            session = %config.journey.session_uid,
            start_at_ms = config.start_at_ms,
            "live session started"
        );

        Self {
            journey: config.journey,
            clock,
            unload,
            join_leave,
            stats,
            pictures,
            driver: Mutex::new(driver),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn journey(&self) -> &JourneyRef {
        &self.journey
    }

    pub fn clock(&self) -> &SessionClock {
        &self.clock
    }

    pub fn stats(&self) -> Observable<StatBucket> {
        self.stats.stats()
    }

    pub fn sync_status(&self) -> Observable<SyncStatus> {
        self.stats.status()
    }

    pub fn join_leave(&self) -> Observable<JoinLeaveInfo> {
        self.join_leave.info()
    }

    /// `None` when profile pictures are disabled.
    pub fn profile_pictures(&self) -> Option<Observable<ProfilePicturesState>> {
        self.pictures.as_ref().map(ProfilePictures::state)
    }

    pub fn set_paused(&self, paused: bool) {
        self.clock.set_paused(paused);
    }

    /// The host is going away: send a best-effort leave.
    pub fn unload(&self) {
        self.unload.set(true);
    }

    /// Resolve once the journey has played to its end. `Err(Cancelled)` if
    /// the session stopped first.
    pub async fn finished(&self) -> Result<(), Cancelled> {
        let end = self.journey.duration_ms();
        self.clock.wait_for_time(end).await
    }

    /// Stop the clock and every component. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clock.stop();
        self.join_leave.stop();
        self.stats.stop();
        if let Some(pictures) = &self.pictures {
            pictures.stop();
        }
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
        info!(journey = %self.journey.uid, time = self.clock.time(), "live session stopped");
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.stop();
    }
}
