//! Identity of the journey a live session is playing.

use journey_api::EventBody;
use serde::{Deserialize, Serialize};

/// Everything needed to talk to the server about one live journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyRef {
    pub uid: String,
    /// Grants access to the journey's stats and events.
    pub jwt: String,
    /// Identifies this viewing of the journey for join/leave events.
    pub session_uid: String,
    pub duration_seconds: f64,
}

impl JourneyRef {
    pub fn new(
        uid: impl Into<String>,
        jwt: impl Into<String>,
        session_uid: impl Into<String>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            uid: uid.into(),
            jwt: jwt.into(),
            session_uid: session_uid.into(),
            duration_seconds,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_seconds * 1000.0
    }

    /// Body for a join or leave event at `journey_time_ms`.
    pub fn event_body(&self, journey_time_ms: f64) -> EventBody {
        EventBody {
            journey_uid: self.uid.clone(),
            journey_jwt: self.jwt.clone(),
            session_uid: self.session_uid.clone(),
            journey_time: journey_time_ms / 1000.0,
            data: serde_json::Map::new(),
        }
    }
}
