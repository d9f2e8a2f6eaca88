//! Millisecond wall clock used to stamp local changes.
//!
//! Local timestamps are strictly increasing within a process: two changes in
//! the same millisecond get distinct stamps, so an attribute's history and the
//! (timestamp, topic) key of persisted messages never collide.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

static LAST_MS: AtomicI64 = AtomicI64::new(0);

/// Current wall clock time in milliseconds since the UNIX epoch.
#[must_use]
pub fn wall_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a timestamp for a local event.
///
/// Follows the wall clock when it has advanced, otherwise steps one
/// millisecond past the last generated value.
#[must_use]
pub fn tick() -> i64 {
    let now = wall_ms();
    let mut last = LAST_MS.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last.saturating_add(1) };
        match LAST_MS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// Convert milliseconds to the fractional seconds used on the wire.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn to_seconds(ms: i64) -> f64 {
    ms as f64 / 1000.0
}

/// Convert wire seconds back to milliseconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn from_seconds(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_strictly_monotonic() {
        let mut prev = tick();
        for _ in 0..1000 {
            let next = tick();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn seconds_conversion() {
        assert!((to_seconds(1_500) - 1.5).abs() < f64::EPSILON);
        assert_eq!(from_seconds(1_700_000_000.123), 1_700_000_000_123);
    }
}
