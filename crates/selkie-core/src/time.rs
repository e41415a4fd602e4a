//! Millisecond clock helpers.
//!
//! TigerStyle: Monotonic ms for scheduling, wall time for logs only.
//!
//! The runtime schedules everything against a process-local monotonic
//! millisecond clock; wall time is only used for logging.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since process start
pub fn monotonic_ms() -> u64 {
    let origin = ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_millis() as u64
}

/// Wall-clock milliseconds since the Unix epoch
pub fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
