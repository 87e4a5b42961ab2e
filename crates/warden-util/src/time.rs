//! Time utilities for warden
//!
//! Lease timestamps are UTC wall-clock times (RFC 3339 on the wire) while
//! lease durations are `std::time::Duration` values. The helpers here bridge
//! the two without panicking on out-of-range values.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `WARDEN_MOCK_TIME` environment variable can be set
//! to shift the clock used by the broker and the enforcer. The shifted clock
//! advances at the same rate as real time.
//!
//! Format: RFC 3339 (e.g., `2025-12-25T14:30:00Z`)

use chrono::{DateTime, Utc};
use std::sync::OnceLock;
use std::time::Duration;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "WARDEN_MOCK_TIME";

/// Cached offset between mock time and real time at process start.
static MOCK_TIME_OFFSET: OnceLock<Option<chrono::Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)] // This is the internal implementation that wraps Utc::now()
fn get_mock_time_offset() -> Option<chrono::Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            if let Ok(mock_time_str) = std::env::var(MOCK_TIME_ENV_VAR) {
                match DateTime::parse_from_rfc3339(&mock_time_str) {
                    Ok(mock_dt) => {
                        let offset = mock_dt.with_timezone(&Utc).signed_duration_since(Utc::now());
                        tracing::info!(
                            mock_time = %mock_time_str,
                            offset_secs = offset.num_seconds(),
                            "Mock time enabled"
                        );
                        return Some(offset);
                    }
                    Err(e) => {
                        tracing::warn!(
                            mock_time = %mock_time_str,
                            error = %e,
                            "Invalid mock time format, expected RFC 3339"
                        );
                    }
                }
            }
            None
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Get the current time, respecting mock time settings in debug builds.
#[allow(clippy::disallowed_methods)] // This is the wrapper that provides mock time support
pub fn now() -> DateTime<Utc> {
    let real_now = Utc::now();

    if let Some(offset) = get_mock_time_offset() {
        real_now + offset
    } else {
        real_now
    }
}

/// Add a std duration to a timestamp, saturating at the maximum representable time.
pub fn add_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Subtract a std duration from a timestamp, saturating at the minimum representable time.
pub fn sub_duration(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Time remaining from `from` until `to`, or zero if `to` is not after `from`.
pub fn duration_until(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

/// Round a duration to whole seconds for display.
pub fn round_to_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs() + u64::from(d.subsec_millis() >= 500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn add_and_sub_are_inverse() {
        let t = Utc.with_ymd_and_hms(2025, 12, 25, 14, 30, 0).unwrap();
        let d = Duration::from_secs(90);
        assert_eq!(sub_duration(add_duration(t, d), d), t);
        assert_eq!(
            add_duration(t, d),
            Utc.with_ymd_and_hms(2025, 12, 25, 14, 31, 30).unwrap()
        );
    }

    #[test]
    fn add_duration_saturates() {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(add_duration(t, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn duration_until_is_never_negative() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 30).unwrap();
        assert_eq!(duration_until(t0, t1), Duration::from_secs(30));
        assert_eq!(duration_until(t1, t0), Duration::ZERO);
    }

    #[test]
    fn rounds_to_nearest_second() {
        assert_eq!(round_to_secs(Duration::from_millis(1499)), Duration::from_secs(1));
        assert_eq!(round_to_secs(Duration::from_millis(1500)), Duration::from_secs(2));
    }
}
