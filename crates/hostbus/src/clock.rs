//! Wall-clock helpers.
//!
//! All persisted timestamps are `f64` epoch seconds. Timestamps must be
//! meaningful across processes (different `Instant` origins), so wall time
//! is used throughout; elapsed computations saturate so that backwards
//! clock jumps produce zero.

use std::time::{Duration, SystemTime};

use chrono::{Local, TimeZone};

/// Current wall time as fractional epoch seconds.
#[must_use]
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Current wall time in whole microseconds, for the activity sentinel.
#[must_use]
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as u64
}

/// Renders an epoch-seconds timestamp as a local `HH:MM:SS` display string.
#[must_use]
pub fn fmt_clock(ts: f64) -> String {
    let secs = ts.max(0.0) as i64;
    match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%H:%M:%S").to_string(),
        None => "??:??:??".to_string(),
    }
}

/// Whole non-negative seconds elapsed between two epoch timestamps.
#[must_use]
pub fn elapsed_secs(now: f64, since: f64) -> i64 {
    (now - since).max(0.0) as i64
}
