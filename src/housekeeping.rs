//! Background upkeep: dropping expired replay records and periodic stats lines.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::network::GatewayStats;

const MAX_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub purge_interval: Duration,
    /// `None` keeps stats out of the log; purging still runs.
    pub stats_interval: Option<Duration>,
}

/// Run `purge` every `purge_interval` and log stats every `stats_interval`
/// until `running` is cleared.
pub fn spawn_housekeeping<P>(
    schedule: Schedule,
    running: Arc<AtomicBool>,
    stats: Arc<GatewayStats>,
    purge: P,
) -> io::Result<JoinHandle<()>>
where
    P: Fn() -> Result<usize, StoreError> + Send + 'static,
{
    let tick = schedule
        .stats_interval
        .map_or(schedule.purge_interval, |s| s.min(schedule.purge_interval))
        .min(MAX_TICK)
        .max(Duration::from_millis(1));

    thread::Builder::new()
        .name("amfgate-housekeeping".into())
        .spawn(move || {
            let started = Instant::now();
            let mut last_purge = started;
            let mut last_stats = started;

            while running.load(Ordering::Acquire) {
                thread::sleep(tick);

                if last_purge.elapsed() >= schedule.purge_interval {
                    match purge() {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "expired replay records dropped"),
                        Err(e) => warn!(error = %e, "replay purge failed"),
                    }
                    last_purge = Instant::now();
                }

                if let Some(interval) = schedule.stats_interval {
                    if last_stats.elapsed() >= interval {
                        stats.log_snapshot(started.elapsed());
                        last_stats = Instant::now();
                    }
                }
            }
        })
}
