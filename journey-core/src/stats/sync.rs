//! Fetch-ahead and easing for bucketed statistics.
//!
//! Two duties share one [`BinState`]:
//!
//! - The fetch duty is the only writer. It fetches bin 0 to learn the bin
//!   width, then fetches each later bin shortly before the clock reaches it.
//!   The lead is the worst fetch latency seen so far, clamped to
//!   [`SyncConfig::min_lead`]..[`SyncConfig::max_lead`]. Transient failures
//!   retry the same bin forever with backoff; a malformed response aborts.
//! - The easing duty reads the bins on every tick and publishes the linear
//!   interpolation between the bin the clock is in and the next one.

use super::bucket::StatBucket;
use crate::backend::JourneyBackend;
use crate::clock::SessionClock;
use crate::error::{Cancelled, Error, Result};
use crate::journey::JourneyRef;
use crate::observable::Observable;
use crate::registry::lock;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Timing knobs for [`StatsSynchronizer`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Never start fetching a bin later than this before it begins.
    pub min_lead: Duration,
    /// Never start fetching a bin earlier than this before it begins.
    pub max_lead: Duration,
    pub fast_backoff: Duration,
    pub slow_backoff: Duration,
    /// Consecutive failures retried after `fast_backoff` before switching to
    /// `slow_backoff`.
    pub fast_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_lead: Duration::from_millis(500),
            max_lead: Duration::from_millis(3500),
            fast_backoff: Duration::from_millis(250),
            slow_backoff: Duration::from_millis(1000),
            fast_retries: 4,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lead(mut self, min: Duration, max: Duration) -> Self {
        self.min_lead = min;
        self.max_lead = max.max(min);
        self
    }

    pub fn with_backoff(mut self, fast: Duration, slow: Duration, fast_retries: u32) -> Self {
        self.fast_backoff = fast;
        self.slow_backoff = slow;
        self.fast_retries = fast_retries;
        self
    }

    /// How far ahead of a bin to fetch it given the worst latency seen.
    pub fn lead_for(&self, worst_latency: Duration) -> Duration {
        worst_latency.max(self.min_lead).min(self.max_lead)
    }

    /// Delay before retry number `consecutive_failures` (1-based).
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures <= self.fast_retries {
            self.fast_backoff
        } else {
            self.slow_backoff
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Waiting for bin 0.
    Starting,
    Syncing,
    /// The session ended and the final bin was published.
    Finished,
    /// A malformed response or broken invariant stopped synchronization.
    Aborted,
}

#[derive(Debug, Default)]
struct BinState {
    bin_width_ms: Option<f64>,
    last_bin: u32,
    next_bin: u32,
    bins: BTreeMap<u32, StatBucket>,
    fetched_last_bin: bool,
}

struct SyncShared {
    clock: SessionClock,
    journey: JourneyRef,
    backend: Arc<dyn JourneyBackend>,
    config: SyncConfig,
    state: Mutex<BinState>,
    data_ready: Notify,
    halted: watch::Sender<bool>,
    stats: Observable<StatBucket>,
    status: Observable<SyncStatus>,
}

impl SyncShared {
    fn is_halted(&self) -> bool {
        *self.halted.borrow() || self.clock.is_stopped()
    }

    fn halt(&self) {
        self.halted.send_replace(true);
    }

    /// Run `future` unless the synchronizer halts or the clock stops first.
    async fn guard<F: Future>(&self, future: F) -> std::result::Result<F::Output, Cancelled> {
        let stopped = self.clock.stopped();
        let mut halted = self.halted.subscribe();
        tokio::select! {
            biased;
            _ = stopped => Err(Cancelled),
            _ = halted.wait_for(|halted| *halted) => Err(Cancelled),
            output = future => Ok(output),
        }
    }

    fn set_status(&self, status: SyncStatus) {
        self.status.set_if_changed(status, |a, b| a == b);
    }

    fn abort(&self, err: &Error) {
        error!(journey = %self.journey.uid, "stats sync aborted: {}", err);
        self.set_status(SyncStatus::Aborted);
        self.halt();
    }

    /// Fetch one bin, retrying transient failures. Returns the bucket and the
    /// latency of the successful attempt.
    async fn fetch_bin(&self, bin: u32) -> Result<(StatBucket, Duration)> {
        let mut failures = 0u32;
        loop {
            let started = Instant::now();
            let result = self
                .guard(self.backend.fetch_stats(&self.journey, bin))
                .await?;
            match result {
                Ok(response) => {
                    let bucket = StatBucket::try_from(response)?;
                    return Ok((bucket, started.elapsed()));
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    let delay = self.config.backoff(failures);
                    warn!(bin, failures, ?delay, "stats fetch failed, retrying: {}", err);
                    self.guard(tokio::time::sleep(delay)).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Keeps an eased [`StatBucket`] in step with a session clock.
///
/// Dropping the synchronizer stops it.
pub struct StatsSynchronizer {
    shared: Arc<SyncShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl StatsSynchronizer {
    /// Start both duties. Must be called within a tokio runtime.
    pub fn start(
        clock: &SessionClock,
        journey: JourneyRef,
        backend: Arc<dyn JourneyBackend>,
        config: SyncConfig,
    ) -> Self {
        let duration_ms = journey.duration_ms();
        let (halted, _) = watch::channel(false);
        let shared = Arc::new(SyncShared {
            clock: clock.clone(),
            journey,
            backend,
            config,
            state: Mutex::new(BinState::default()),
            data_ready: Notify::new(),
            halted,
            stats: Observable::new(StatBucket::empty()),
            status: Observable::new(SyncStatus::Starting),
        });

        let mut tasks = Vec::new();
        if duration_ms > 0.0 {
            tasks.push(tokio::spawn(fetch_duty(Arc::clone(&shared))));
            tasks.push(tokio::spawn(easing_duty(Arc::clone(&shared))));
        } else {
            debug!(journey = %shared.journey.uid, "empty journey, nothing to sync");
            shared.set_status(SyncStatus::Finished);
        }

        Self {
            shared,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        }
    }

    /// The eased statistics. Starts as [`StatBucket::empty`].
    pub fn stats(&self) -> Observable<StatBucket> {
        self.shared.stats.clone()
    }

    pub fn status(&self) -> Observable<SyncStatus> {
        self.shared.status.clone()
    }

    /// Bin width learned from bin 0, in milliseconds.
    pub fn bin_width_ms(&self) -> Option<f64> {
        lock(&self.shared.state).bin_width_ms
    }

    /// Bins currently held for easing.
    pub fn retained_bins(&self) -> Vec<u32> {
        lock(&self.shared.state).bins.keys().copied().collect()
    }

    /// Stop fetching and publishing. Repeated calls are no-ops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.halt();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        debug!(journey = %self.shared.journey.uid, "stats sync stopped");
    }
}

impl Drop for StatsSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn fetch_duty(shared: Arc<SyncShared>) {
    match fetch_bins(&shared).await {
        Ok(()) => debug!(journey = %shared.journey.uid, "fetched every stats bin"),
        Err(Error::Cancelled(_)) => debug!("stats fetch cancelled"),
        Err(err) => shared.abort(&err),
    }
}

async fn fetch_bins(shared: &SyncShared) -> Result<()> {
    let (first, first_latency) = shared.fetch_bin(0).await?;
    let bin_width_seconds = first.bin_width_seconds;
    if !(bin_width_seconds > 0.0 && bin_width_seconds.is_finite()) {
        return Err(Error::Protocol(format!(
            "bin width must be positive, got {bin_width_seconds}"
        )));
    }
    let bin_width_ms = bin_width_seconds * 1000.0;
    let duration_ms = shared.journey.duration_ms();
    let current_bin = (shared.clock.time() / bin_width_ms).floor().max(0.0) as u32;

    {
        let mut state = lock(&shared.state);
        state.bin_width_ms = Some(bin_width_ms);
        // Bins starting at or after the end of the session hold nobody.
        state.last_bin = ((duration_ms / bin_width_ms).ceil() as u32).saturating_sub(1);
        state.next_bin = current_bin.max(1);
        state.fetched_last_bin = state.next_bin > state.last_bin;
        state.bins.insert(0, first);
        debug!(
            bin_width_ms,
            last_bin = state.last_bin,
            next_bin = state.next_bin,
            "stats bin width discovered"
        );
    }
    shared.set_status(SyncStatus::Syncing);
    shared.data_ready.notify_one();

    let mut worst_latency = first_latency;
    loop {
        let bin = {
            let state = lock(&shared.state);
            if state.next_bin > state.last_bin {
                return Ok(());
            }
            state.next_bin
        };

        // Have each bin on hand when the bin before it starts, so the easing
        // duty can interpolate toward it for the whole of that bin.
        let lead = shared.config.lead_for(worst_latency);
        let fetch_at = (f64::from(bin) - 1.0) * bin_width_ms - lead.as_secs_f64() * 1000.0;
        shared.clock.wait_for_time(fetch_at).await?;

        let (bucket, latency) = shared.fetch_bin(bin).await?;
        worst_latency = worst_latency.max(latency);
        {
            let mut state = lock(&shared.state);
            state.bins.insert(bin, bucket);
            state.next_bin = bin + 1;
            state.fetched_last_bin = state.next_bin > state.last_bin;
        }
        shared.data_ready.notify_one();
    }
}

async fn easing_duty(shared: Arc<SyncShared>) {
    match ease(&shared).await {
        Ok(()) => {
            debug!(journey = %shared.journey.uid, "stats easing finished");
            if !shared.is_halted() {
                shared.set_status(SyncStatus::Finished);
            }
        }
        Err(Error::Cancelled(_)) => debug!("stats easing cancelled"),
        Err(err) => shared.abort(&err),
    }
}

async fn ease(shared: &SyncShared) -> Result<()> {
    loop {
        let has_data = !lock(&shared.state).bins.is_empty();
        if has_data {
            break;
        }
        shared.guard(shared.data_ready.notified()).await?;
    }
    let (bin_width_ms, last_bin) = {
        let state = lock(&shared.state);
        let bin_width_ms = state
            .bin_width_ms
            .ok_or_else(|| Error::Invariant("bin width unknown after the first bucket".into()))?;
        (bin_width_ms, state.last_bin)
    };
    let duration_ms = shared.journey.duration_ms();

    loop {
        let now = shared.clock.time();
        let ended = now >= duration_ms;
        let time = now.min(duration_ms);

        let from = ((time / bin_width_ms).floor().max(0.0) as u32).min(last_bin);
        let to = from + 1;
        let progress = ((time - from as f64 * bin_width_ms) / bin_width_ms).max(0.0);

        let (eased, finished) = {
            let mut state = lock(&shared.state);
            state.bins.retain(|bin, _| *bin >= from);
            match (state.bins.get(&from), state.bins.get(&to)) {
                (Some(a), Some(b)) => (Some(StatBucket::interpolate(a, b, progress)), false),
                (Some(a), None) => (Some(a.clone()), state.fetched_last_bin),
                (None, _) => (None, state.fetched_last_bin),
            }
        };

        if shared.is_halted() {
            return Err(Cancelled.into());
        }
        let published = eased.is_some();
        if let Some(eased) = eased {
            shared
                .stats
                .set_if_changed(eased, |old, new| old.same_counts(new));
        }
        if finished || (ended && published) {
            return Ok(());
        }

        let tick = shared.clock.next_tick();
        tokio::select! {
            result = tick => { result?; }
            _ = shared.guard(shared.data_ready.notified()) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::driver::{spawn_frame_driver, DEFAULT_FRAME_PERIOD};
    use crate::testing::{stat_bucket, MockBackend, MockFailure};

    fn journey(duration_seconds: f64) -> JourneyRef {
        JourneyRef::new("j1", "jwt", "s1", duration_seconds)
    }

    #[test]
    fn test_lead_is_clamped() {
        let config = SyncConfig::default();
        assert_eq!(config.lead_for(Duration::ZERO), Duration::from_millis(500));
        assert_eq!(config.lead_for(Duration::from_millis(1200)), Duration::from_millis(1200));
        assert_eq!(config.lead_for(Duration::from_secs(10)), Duration::from_millis(3500));
    }

    #[test]
    fn test_backoff_schedule() {
        let config = SyncConfig::default();
        let delays: Vec<_> = (1..=6).map(|n| config.backoff(n).as_millis()).collect();
        assert_eq!(delays, vec![250, 250, 250, 250, 1000, 1000]);
    }

    #[test]
    fn test_with_lead_keeps_order() {
        let config = SyncConfig::new().with_lead(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(config.max_lead, Duration::from_secs(5));
    }

    async fn frame(clock: &SessionClock, at_ms: f64) {
        clock.on_frame(at_ms);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_eases_between_bins() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 10.0, bin as u64 * 10)));
        let clock = SessionClock::new(0.0, false);
        let sync = StatsSynchronizer::start(&clock, journey(60.0), backend.clone(), SyncConfig::default());
        frame(&clock, 0.0).await;
        assert_eq!(sync.bin_width_ms(), Some(10_000.0));
        assert_eq!(sync.retained_bins(), vec![0, 1]);

        let mut users = Vec::new();
        for at in [2_500.0, 5_000.0, 7_500.0, 10_000.0] {
            frame(&clock, at).await;
            users.push(sync.stats().get().users);
        }
        assert_eq!(users, vec![3, 5, 8, 10]);
        assert_eq!(sync.status().get(), SyncStatus::Syncing);
        assert!(!sync.retained_bins().contains(&0));

        clock.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_each_bin_one_bin_early() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 10.0, bin as u64)));
        let clock = SessionClock::new(0.0, false);
        backend.observe_clock(&clock);

        let _sync = StatsSynchronizer::start(&clock, journey(60.0), backend.clone(), SyncConfig::default());
        let driver = spawn_frame_driver(clock.clone(), DEFAULT_FRAME_PERIOD);

        clock.wait_for_time(4_000.0).await.unwrap();
        let requested: Vec<u32> = backend.stats_calls().iter().map(|call| call.bin).collect();
        assert_eq!(requested, vec![0, 1]);

        clock.wait_for_time(9_600.0).await.unwrap();
        let call = backend.stats_calls()[2].clone();
        assert_eq!(call.bin, 2);
        let at = call.requested_at_ms.unwrap();
        assert!((9_500.0..9_520.0).contains(&at), "bin 2 requested at {at}");

        clock.stop();
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_holds_bucket_until_next_arrives() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 10.0, 3 + bin as u64 * 10)));
        // Eight failures with backoff keep bin 1 away for five seconds.
        backend.fail_stats(1, vec![MockFailure::Status(503); 8]);
        let clock = SessionClock::new(0.0, false);
        let sync = StatsSynchronizer::start(&clock, journey(60.0), backend.clone(), SyncConfig::default());
        let driver = spawn_frame_driver(clock.clone(), DEFAULT_FRAME_PERIOD);

        clock.wait_for_time(4_500.0).await.unwrap();
        assert_eq!(sync.stats().get().users, 3);
        assert_eq!(sync.retained_bins(), vec![0]);
        assert_eq!(sync.status().get(), SyncStatus::Syncing);

        clock.wait_for_time(7_500.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let users = sync.stats().get().users;
        assert!((10..=11).contains(&users), "users at 7.5s was {users}");

        clock.stop();
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_last_bin_at_session_end() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 10.0, bin as u64 * 10)));
        let clock = SessionClock::new(0.0, false);
        let sync = StatsSynchronizer::start(&clock, journey(30.0), backend.clone(), SyncConfig::default());
        frame(&clock, 0.0).await;

        frame(&clock, 15_000.0).await;
        assert_eq!(sync.stats().get().users, 15);

        frame(&clock, 30_000.0).await;
        assert_eq!(sync.stats().get().users, 20);
        assert_eq!(sync.status().get(), SyncStatus::Finished);
        let bins: Vec<u32> = backend.stats_calls().iter().map(|call| call.bin).collect();
        assert_eq!(bins, vec![0, 1, 2]);

        clock.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_same_bin() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 10.0, 1)));
        backend.fail_stats(
            0,
            vec![
                MockFailure::Network,
                MockFailure::Status(503),
                MockFailure::Network,
                MockFailure::Network,
                MockFailure::Network,
            ],
        );
        let clock = SessionClock::new(0.0, true);
        let sync = StatsSynchronizer::start(&clock, journey(60.0), backend.clone(), SyncConfig::default());

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(sync.status().get(), SyncStatus::Starting);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sync.status().get(), SyncStatus::Syncing);

        let bins: Vec<u32> = backend.stats_calls().iter().map(|call| call.bin).collect();
        assert_eq!(bins, vec![0, 0, 0, 0, 0, 0, 1]);
        clock.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_aborts() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 10.0, 1)));
        backend.fail_stats(0, vec![MockFailure::Malformed]);
        let clock = SessionClock::new(0.0, true);
        let sync = StatsSynchronizer::start(&clock, journey(60.0), backend.clone(), SyncConfig::default());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sync.status().get(), SyncStatus::Aborted);
        assert_eq!(backend.stats_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_bin_width_aborts() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 0.0, 1)));
        let clock = SessionClock::new(0.0, true);
        let sync = StatsSynchronizer::start(&clock, journey(60.0), backend.clone(), SyncConfig::default());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sync.status().get(), SyncStatus::Aborted);
        assert_eq!(sync.bin_width_ms(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_inside_session() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 10.0, bin as u64)));
        let clock = SessionClock::new(35_000.0, true);
        let _sync = StatsSynchronizer::start(&clock, journey(60.0), backend.clone(), SyncConfig::default());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let bins: Vec<u32> = backend.stats_calls().iter().map(|call| call.bin).collect();
        assert_eq!(bins, vec![0, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finishes_after_last_bin() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 5.0, bin as u64)));
        let clock = SessionClock::new(0.0, false);
        let sync = StatsSynchronizer::start(&clock, journey(12.0), backend.clone(), SyncConfig::default());
        let driver = spawn_frame_driver(clock.clone(), DEFAULT_FRAME_PERIOD);

        clock.wait_for_time(16_000.0).await.unwrap();
        assert_eq!(sync.status().get(), SyncStatus::Finished);
        let bins: Vec<u32> = backend.stats_calls().iter().map(|call| call.bin).collect();
        assert_eq!(bins, vec![0, 1, 2]);
        // Bin 2 is the last one starting before the end, so it is held.
        assert_eq!(sync.stats().get().users, 2);

        clock.stop();
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_fetching_and_publishing() {
        let backend = MockBackend::new();
        backend.set_stats(|bin| Some(stat_bucket(bin, 5.0, bin as u64 * 2)));
        let clock = SessionClock::new(0.0, false);
        let sync = StatsSynchronizer::start(&clock, journey(60.0), backend.clone(), SyncConfig::default());
        let driver = spawn_frame_driver(clock.clone(), DEFAULT_FRAME_PERIOD);

        clock.wait_for_time(6_000.0).await.unwrap();
        sync.stop();
        sync.stop();
        let calls = backend.stats_calls().len();
        let published = sync.stats().get();

        clock.wait_for_time(30_000.0).await.unwrap();
        assert_eq!(backend.stats_calls().len(), calls);
        assert_eq!(sync.stats().get(), published);

        clock.stop();
        driver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_journey_does_nothing() {
        let backend = MockBackend::new();
        let clock = SessionClock::new(0.0, false);
        let sync = StatsSynchronizer::start(&clock, journey(0.0), backend.clone(), SyncConfig::default());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sync.status().get(), SyncStatus::Finished);
        assert!(backend.stats_calls().is_empty());
    }
}
