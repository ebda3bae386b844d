//! Live journey engine: reactive state synchronized to a journey clock.
//!
//! This crate provides:
//! - Observable values with derived and combined views
//! - A session clock driven by frames, with pause and pre-roll
//! - Join/leave analytics sent exactly once per session
//! - Bucketed statistics fetched ahead of the clock and eased between bins
//! - A network resource container with refresh and replace semantics
//!
//! # Quick Start
//!
//! ```ignore
//! use journey_core::{JourneyRef, LiveSession, LiveSessionConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = journey_api::Client::from_env()?;
//!     let journey = JourneyRef::new("journey-uid", "jwt", "session-uid", 60.0);
//!
//!     let session = LiveSession::start(LiveSessionConfig::new(journey), Arc::new(client));
//!     let _users = session.stats().subscribe(|| println!("stats changed"));
//!
//!     session.finished().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod clock;
pub mod error;
pub mod flags;
pub mod join_leave;
pub mod journey;
pub mod live;
pub mod network_response;
pub mod observable;
pub mod optimistic;
pub mod profile_pictures;
mod registry;
pub mod stats;
pub mod testing;

// Primary public API
pub use backend::JourneyBackend;
pub use clock::{ClockPhase, CoarseTime, SessionClock, TickEvent, TickFlow, TickSubscription};
pub use error::{Cancelled, Error, Result};
pub use flags::{JoinLeaveInfo, MemoryFlagStore, SessionFlagStore};
pub use join_leave::JoinLeaveTracker;
pub use journey::JourneyRef;
pub use live::{LiveSession, LiveSessionConfig};
pub use network_response::{
    CancelSignal, NetworkResource, NetworkResourceOptions, NetworkResponse,
};
pub use observable::{batch, Derived, Notifier, Observable, WeakObservable};
pub use optimistic::Optimistic;
pub use profile_pictures::{ProfilePictures, ProfilePicturesState};
pub use registry::Subscription;
pub use stats::{StatBucket, StatsSynchronizer, SyncConfig, SyncStatus};
pub use testing::{MockBackend, MockFailure};
