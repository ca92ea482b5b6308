//! Active probes run against a measurement server before bandwidth tests.

pub mod latency;

pub use latency::LatencyProber;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp carried in `PING` lines.
pub(crate) fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
