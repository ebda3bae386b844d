//! Live participant statistics.
//!
//! The server aggregates statistics into fixed-width time bins and only
//! answers "give me bin N". [`StatsSynchronizer`] fetches bins ahead of the
//! session clock and publishes a smoothly eased [`StatBucket`] between them.

mod bucket;
mod sync;

pub use bucket::{percentages, StatBucket};
pub use sync::{StatsSynchronizer, SyncConfig, SyncStatus};
