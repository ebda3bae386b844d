//! Minimal client for the live journey events API.
//!
//! This crate provides a focused client for the endpoints a live journey
//! needs:
//! - Bucketed participant statistics (`events/stats`)
//! - Join and leave analytics events (`events/join`, `events/leave`)
//! - Profile picture samples for the participant strip
//!
//! Failures are classified so callers can decide what to retry: transport
//! failures and server rejections are transient, parse failures are not.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "http://localhost:8084";
const EVENTS_PATH: &str = "/api/1/journeys/events";
const PROFILE_PICTURES_PATH: &str = "/api/1/journeys/profile_pictures";

/// Errors that can occur when using the journey client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures and non-success statuses are transient. A body that
    /// does not match the expected shape is a contract mismatch and retrying
    /// cannot fix it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Api { .. })
    }
}

/// Journey API client.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl Client {
    /// Create a new client for the given server root, e.g. `https://example.com`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Create a client from `JOURNEY_API_URL` and the optional
    /// `JOURNEY_API_TOKEN` environment variables.
    pub fn from_env() -> Result<Self, Error> {
        let base_url =
            std::env::var("JOURNEY_API_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let client = Self::new(base_url)?;
        Ok(match std::env::var("JOURNEY_API_TOKEN") {
            Ok(token) if !token.is_empty() => client.with_token(token),
            _ => client,
        })
    }

    /// Authenticate requests as the given user.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// The server root requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch one statistics bucket for a journey.
    pub async fn fetch_stats(&self, uid: &str, jwt: &str, bin: u32) -> Result<StatsResponse, Error> {
        let builder = self
            .http
            .get(format!("{}{EVENTS_PATH}/stats", self.base_url))
            .headers(self.build_headers(Some(jwt))?)
            .query(&[("uid", uid.to_string()), ("bin", bin.to_string())]);

        let text = self.send(builder).await?;
        serde_json::from_str(&text).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Post a join or leave event.
    pub async fn send_event(&self, kind: EventKind, body: &EventBody) -> Result<(), Error> {
        let builder = self
            .http
            .post(format!("{}{EVENTS_PATH}/{}", self.base_url, kind.as_str()))
            .headers(self.build_headers(None)?)
            .json(body);

        self.send(builder).await.map(|_| ())
    }

    /// Fetch a sample of participants' profile pictures at a journey time.
    pub async fn profile_pictures(
        &self,
        request: &ProfilePicturesRequest,
    ) -> Result<ProfilePicturesResponse, Error> {
        let builder = self
            .http
            .post(format!("{}{PROFILE_PICTURES_PATH}", self.base_url))
            .headers(self.build_headers(None)?)
            .json(request);

        let text = self.send(builder).await?;
        serde_json::from_str(&text).map_err(|e| Error::Parse(e.to_string()))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<String, Error> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }

    fn build_headers(&self, bearer: Option<&str>) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        if let Some(token) = bearer.or(self.token.as_deref()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("bearer {token}"))
                    .map_err(|e| Error::Config(format!("Invalid token: {e}")))?,
            );
        }
        Ok(headers)
    }
}

/// Which analytics event to post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Join,
    Leave,
}

impl EventKind {
    /// The path segment for this event.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Join => "join",
            EventKind::Leave => "leave",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a join or leave event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    pub journey_uid: String,
    pub journey_jwt: String,
    pub session_uid: String,
    /// Seconds since the start of the journey.
    pub journey_time: f64,
    /// Extension point, currently always empty.
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// One statistics bucket as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub journey_time: f64,
    pub bin_width: f64,
    pub users: u64,
    pub likes: u64,
    pub numeric_active: Option<HashMap<String, u64>>,
    pub press_active: Option<u64>,
    pub press: Option<u64>,
    pub color_active: Option<Vec<u64>>,
    pub word_active: Option<Vec<u64>>,
}

/// Request for a sample of profile pictures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePicturesRequest {
    pub uid: String,
    pub jwt: String,
    /// Seconds since the start of the journey.
    pub journey_time: f64,
    pub limit: u32,
}

/// Reference to an image the presentation layer can load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub uid: String,
    pub jwt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePictureItem {
    pub picture: ImageRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePicturesResponse {
    pub items: Vec<ProfilePictureItem>,
}
