//! Testing utilities for the live journey engine.
//!
//! This module provides tools for integration testing:
//! - `MockBackend` for deterministic sessions without a server
//! - `stat_bucket` for building server-shaped statistics
//!
//! Pair it with `#[tokio::test(start_paused = true)]` and the frame driver:
//! virtual time makes latencies and fetch-ahead timing exact.

use crate::backend::JourneyBackend;
use crate::clock::SessionClock;
use crate::journey::JourneyRef;
use crate::registry::lock;
use async_trait::async_trait;
use journey_api::{
    EventBody, EventKind, ImageRef, ProfilePictureItem, ProfilePicturesRequest,
    ProfilePicturesResponse, StatsResponse,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A scripted failure for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Transport failure.
    Network,
    /// Server rejected the request with this status.
    Status(u16),
    /// The response body did not match the expected shape.
    Malformed,
}

impl MockFailure {
    fn into_error(self) -> journey_api::Error {
        match self {
            MockFailure::Network => journey_api::Error::Network("connection reset".into()),
            MockFailure::Status(status) => journey_api::Error::Api {
                status,
                message: "scripted failure".into(),
            },
            MockFailure::Malformed => {
                journey_api::Error::Parse("missing field `bin_width`".into())
            }
        }
    }
}

/// One recorded statistics request.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsCall {
    pub bin: u32,
    /// Journey time when the request was made, if a clock is observed.
    pub requested_at_ms: Option<f64>,
    /// Journey time when the response was delivered.
    pub completed_at_ms: Option<f64>,
    pub succeeded: bool,
}

type StatsScript = Arc<dyn Fn(u32) -> Option<StatsResponse> + Send + Sync>;
type PicturesScript = Arc<dyn Fn(&ProfilePicturesRequest) -> Vec<ImageRef> + Send + Sync>;

struct MockState {
    stats: StatsScript,
    pictures: PicturesScript,
    latency: Duration,
    stats_failures: HashMap<u32, VecDeque<MockFailure>>,
    fail_events: bool,
    fail_pictures: bool,
    clock: Option<SessionClock>,
    stats_calls: Vec<StatsCall>,
    events: Vec<(EventKind, EventBody)>,
    event_attempts: usize,
    picture_calls: Vec<ProfilePicturesRequest>,
}

/// A journey backend that answers from scripts and records every call.
///
/// Without a stats script every bin is answered with an empty 10 second
/// bucket. A script returning `None` answers 404.
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                stats: Arc::new(|bin| Some(stat_bucket(bin, 10.0, 0))),
                pictures: Arc::new(|_| Vec::new()),
                latency: Duration::ZERO,
                stats_failures: HashMap::new(),
                fail_events: false,
                fail_pictures: false,
                clock: None,
                stats_calls: Vec::new(),
                events: Vec::new(),
                event_attempts: 0,
                picture_calls: Vec::new(),
            }),
        })
    }

    pub fn set_stats(&self, script: impl Fn(u32) -> Option<StatsResponse> + Send + Sync + 'static) {
        lock(&self.state).stats = Arc::new(script);
    }

    pub fn set_pictures(
        &self,
        script: impl Fn(&ProfilePicturesRequest) -> Vec<ImageRef> + Send + Sync + 'static,
    ) {
        lock(&self.state).pictures = Arc::new(script);
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    /// Fail the next requests for `bin`, one failure per request.
    pub fn fail_stats(&self, bin: u32, failures: Vec<MockFailure>) {
        lock(&self.state)
            .stats_failures
            .entry(bin)
            .or_default()
            .extend(failures);
    }

    pub fn fail_events(&self, fail: bool) {
        lock(&self.state).fail_events = fail;
    }

    pub fn fail_pictures(&self, fail: bool) {
        lock(&self.state).fail_pictures = fail;
    }

    /// Stamp recorded stats calls with this clock's journey time.
    pub fn observe_clock(&self, clock: &SessionClock) {
        lock(&self.state).clock = Some(clock.clone());
    }

    pub fn stats_calls(&self) -> Vec<StatsCall> {
        lock(&self.state).stats_calls.clone()
    }

    /// Events the server accepted, in arrival order.
    pub fn events(&self) -> Vec<(EventKind, EventBody)> {
        lock(&self.state).events.clone()
    }

    /// Events posted, including rejected ones.
    pub fn event_attempts(&self) -> usize {
        lock(&self.state).event_attempts
    }

    pub fn picture_calls(&self) -> Vec<ProfilePicturesRequest> {
        lock(&self.state).picture_calls.clone()
    }

    fn journey_time(&self) -> Option<f64> {
        lock(&self.state).clock.as_ref().map(SessionClock::time)
    }

    async fn delay(&self) {
        let latency = lock(&self.state).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl JourneyBackend for MockBackend {
    async fn fetch_stats(
        &self,
        _journey: &JourneyRef,
        bin: u32,
    ) -> Result<StatsResponse, journey_api::Error> {
        let requested_at_ms = self.journey_time();
        let index = {
            let mut state = lock(&self.state);
            state.stats_calls.push(StatsCall {
                bin,
                requested_at_ms,
                completed_at_ms: None,
                succeeded: false,
            });
            state.stats_calls.len() - 1
        };

        self.delay().await;

        let completed_at_ms = self.journey_time();
        let mut state = lock(&self.state);
        let failure = state
            .stats_failures
            .get_mut(&bin)
            .and_then(VecDeque::pop_front);
        let result = match failure {
            Some(failure) => Err(failure.into_error()),
            None => (state.stats)(bin).ok_or(journey_api::Error::Api {
                status: 404,
                message: format!("no bin {bin}"),
            }),
        };
        let call = &mut state.stats_calls[index];
        call.completed_at_ms = completed_at_ms;
        call.succeeded = result.is_ok();
        result
    }

    async fn send_event(&self, kind: EventKind, body: &EventBody) -> Result<(), journey_api::Error> {
        self.delay().await;
        let mut state = lock(&self.state);
        state.event_attempts += 1;
        if state.fail_events {
            return Err(MockFailure::Status(500).into_error());
        }
        state.events.push((kind, body.clone()));
        Ok(())
    }

    async fn profile_pictures(
        &self,
        request: &ProfilePicturesRequest,
    ) -> Result<ProfilePicturesResponse, journey_api::Error> {
        self.delay().await;
        let mut state = lock(&self.state);
        state.picture_calls.push(request.clone());
        if state.fail_pictures {
            return Err(MockFailure::Network.into_error());
        }
        let items = (state.pictures)(request)
            .into_iter()
            .map(|picture| ProfilePictureItem { picture })
            .collect();
        Ok(ProfilePicturesResponse { items })
    }
}

/// A server-shaped bucket for `bin` with `users` participants and no prompt
/// responses.
pub fn stat_bucket(bin: u32, bin_width_seconds: f64, users: u64) -> StatsResponse {
    StatsResponse {
        journey_time: f64::from(bin) * bin_width_seconds,
        bin_width: bin_width_seconds,
        users,
        likes: 0,
        numeric_active: None,
        press_active: None,
        press: None,
        color_active: None,
        word_active: None,
    }
}
