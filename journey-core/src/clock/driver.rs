//! Frame source for headless hosts.

use super::SessionClock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Roughly one display frame at 60Hz.
pub const DEFAULT_FRAME_PERIOD: Duration = Duration::from_millis(16);

/// Drive `clock` with a frame every `period` until it stops.
///
/// Frame timestamps are milliseconds since the driver started, measured with
/// tokio's clock, so paused-time tests advance the session deterministically.
pub fn spawn_frame_driver(clock: SessionClock, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let origin = Instant::now();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stopped = clock.stopped();
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = interval.tick() => {
                    clock.on_frame(origin.elapsed().as_secs_f64() * 1000.0);
                }
            }
        }
        debug!("frame driver exited");
    })
}
