//! The server operations the live engine depends on.

use crate::journey::JourneyRef;
use async_trait::async_trait;
use journey_api::{
    Client, EventBody, EventKind, ProfilePicturesRequest, ProfilePicturesResponse, StatsResponse,
};

/// Server access used by the live session.
///
/// Implemented by [`journey_api::Client`] for real sessions and by
/// [`MockBackend`](crate::testing::MockBackend) in tests.
#[async_trait]
pub trait JourneyBackend: Send + Sync {
    /// Fetch statistics bucket `bin` of the journey.
    async fn fetch_stats(
        &self,
        journey: &JourneyRef,
        bin: u32,
    ) -> Result<StatsResponse, journey_api::Error>;

    async fn send_event(&self, kind: EventKind, body: &EventBody) -> Result<(), journey_api::Error>;

    async fn profile_pictures(
        &self,
        request: &ProfilePicturesRequest,
    ) -> Result<ProfilePicturesResponse, journey_api::Error>;
}

#[async_trait]
impl JourneyBackend for Client {
    async fn fetch_stats(
        &self,
        journey: &JourneyRef,
        bin: u32,
    ) -> Result<StatsResponse, journey_api::Error> {
        Client::fetch_stats(self, &journey.uid, &journey.jwt, bin).await
    }

    async fn send_event(&self, kind: EventKind, body: &EventBody) -> Result<(), journey_api::Error> {
        Client::send_event(self, kind, body).await
    }

    async fn profile_pictures(
        &self,
        request: &ProfilePicturesRequest,
    ) -> Result<ProfilePicturesResponse, journey_api::Error> {
        Client::profile_pictures(self, request).await
    }
}
