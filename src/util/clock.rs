//! Clock helpers.
//!
//! Scheduling and wait bookkeeping use the monotonic clock only; `now_ms` is
//! kept for wall-clock stamps in logs and exported metrics.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Current monotonic time point.
#[must_use]
pub fn now() -> Instant {
    Instant::now()
}

/// `point + ms`, saturating at the far future instead of overflowing.
#[must_use]
pub fn add_ms(point: Instant, ms: u64) -> Instant {
    point
        .checked_add(Duration::from_millis(ms))
        .or_else(|| point.checked_add(FAR_FUTURE))
        .unwrap_or(point)
}

/// Signed milliseconds from `from` to `to` (negative when `to` is earlier).
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn diff_ms(from: Instant, to: Instant) -> i64 {
    if to >= from {
        to.duration_since(from).as_millis() as i64
    } else {
        -(from.duration_since(to).as_millis() as i64)
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_ms_sign() {
        let start = now();
        let later = add_ms(start, 25);
        assert_eq!(diff_ms(start, later), 25);
        assert_eq!(diff_ms(later, start), -25);
        assert_eq!(diff_ms(start, start), 0);
    }

    #[test]
    fn test_now_ms_after_epoch() {
        assert!(now_ms() > 0);
    }
}
