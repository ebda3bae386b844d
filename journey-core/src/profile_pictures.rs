//! Rotating sample of participants' profile pictures.
//!
//! The server samples pictures per two-second bin of journey time. The fetch
//! duty stays one bin ahead of the clock; the display duty publishes the
//! current bin's pictures alongside how many other participants are present.

use crate::backend::JourneyBackend;
use crate::clock::{CoarseTime, SessionClock};
use crate::error::Cancelled;
use crate::journey::JourneyRef;
use crate::observable::Observable;
use crate::registry::lock;
use crate::stats::StatBucket;
use journey_api::{ImageRef, ProfilePicturesRequest};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const PICTURE_BIN_MS: f64 = 2000.0;
pub const PICTURE_LIMIT: u32 = 5;

/// What the participant strip shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePicturesState {
    pub pictures: Vec<ImageRef>,
    /// Participants present but not pictured.
    pub additional_users: u64,
}

/// Last bin with pictures for a journey of `duration_seconds`.
///
/// A bin starting exactly at the end of the journey has nobody in it.
pub fn last_picture_bin(duration_seconds: f64) -> i64 {
    let bins = (duration_seconds / (PICTURE_BIN_MS / 1000.0)).floor();
    let last = bins as i64;
    if bins * (PICTURE_BIN_MS / 1000.0) == duration_seconds {
        last - 1
    } else {
        last
    }
}

fn bin_at(time_ms: f64) -> u32 {
    (time_ms / PICTURE_BIN_MS).floor().max(0.0) as u32
}

struct Shared {
    clock: SessionClock,
    journey: JourneyRef,
    backend: Arc<dyn JourneyBackend>,
    stats: Observable<StatBucket>,
    bins: Mutex<BTreeMap<u32, Vec<ImageRef>>>,
    loaded: Notify,
    state: Observable<ProfilePicturesState>,
}

/// Keeps [`ProfilePicturesState`] current for a live session.
///
/// Dropping it stops both duties.
pub struct ProfilePictures {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ProfilePictures {
    /// Start fetching and displaying. Must be called within a tokio runtime.
    pub fn start(
        clock: &SessionClock,
        journey: JourneyRef,
        backend: Arc<dyn JourneyBackend>,
        stats: Observable<StatBucket>,
    ) -> Self {
        let shared = Arc::new(Shared {
            clock: clock.clone(),
            journey,
            backend,
            stats,
            bins: Mutex::new(BTreeMap::new()),
            loaded: Notify::new(),
            state: Observable::default(),
        });
        let tasks = vec![
            tokio::spawn(fetch_duty(Arc::clone(&shared))),
            tokio::spawn(display_duty(Arc::clone(&shared))),
        ];
        Self {
            shared,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> Observable<ProfilePicturesState> {
        self.shared.state.clone()
    }

    /// Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for ProfilePictures {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn fetch_duty(shared: Arc<Shared>) {
    if fetch_bins(&shared).await.is_err() {
        debug!("profile picture fetch cancelled");
    }
}

async fn fetch_bins(shared: &Shared) -> Result<(), Cancelled> {
    let last_bin = last_picture_bin(shared.journey.duration_seconds);
    let mut next_bin = bin_at(shared.clock.time());

    while i64::from(next_bin) <= last_bin {
        // Load a bin once the clock reaches the one before it.
        let ready_at = (f64::from(next_bin) - 1.0) * PICTURE_BIN_MS;
        shared.clock.wait_for_time(ready_at).await?;

        let request = ProfilePicturesRequest {
            uid: shared.journey.uid.clone(),
            jwt: shared.journey.jwt.clone(),
            journey_time: f64::from(next_bin) * PICTURE_BIN_MS / 1000.0,
            limit: PICTURE_LIMIT,
        };
        let pictures = match shared
            .clock
            .or_stopped(shared.backend.profile_pictures(&request))
            .await?
        {
            Ok(response) => response.items.into_iter().map(|item| item.picture).collect(),
            Err(err) => {
                warn!(
                    journey = %shared.journey.uid,
                    bin = next_bin,
                    "failed to fetch profile pictures: {}",
                    err
                );
                Vec::new()
            }
        };

        let current_bin = bin_at(shared.clock.time());
        {
            let mut bins = lock(&shared.bins);
            bins.insert(next_bin, pictures);
            bins.retain(|bin, _| *bin >= current_bin);
        }
        shared.loaded.notify_one();
        next_bin += 1;
    }
    Ok(())
}

async fn display_duty(shared: Arc<Shared>) {
    if display(&shared).await.is_err() {
        debug!("profile picture display cancelled");
    }
}

async fn display(shared: &Shared) -> Result<(), Cancelled> {
    let coarse = CoarseTime::new(&shared.clock, 0.0, PICTURE_BIN_MS, true);
    let changed = Arc::new(Notify::new());
    let _bin_changed = {
        let changed = Arc::clone(&changed);
        coarse.subscribe(move || changed.notify_one())
    };
    let _stats_changed = {
        let changed = Arc::clone(&changed);
        shared.stats.subscribe(move || changed.notify_one())
    };

    loop {
        let bin = u32::try_from(coarse.get()).unwrap_or(0);
        let pictures = lock(&shared.bins).get(&bin).cloned();
        if let Some(pictures) = pictures {
            let users = shared.stats.with(|stats| stats.users);
            let next = ProfilePicturesState {
                additional_users: users.saturating_sub(pictures.len() as u64),
                pictures,
            };
            shared.state.set_if_changed(next, |a, b| a == b);
        }

        shared
            .clock
            .or_stopped(async {
                tokio::select! {
                    _ = changed.notified() => {}
                    _ = shared.loaded.notified() => {}
                }
            })
            .await?;
    }
}
