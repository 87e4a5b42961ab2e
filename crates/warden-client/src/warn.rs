//! When to warn a user whose broker is unreachable

use chrono::{DateTime, Utc};
use std::time::Duration;
use warden_api::Lease;
use warden_util::{add_duration, duration_until};

const FINAL_MINUTE: Duration = Duration::from_secs(60);

/// Returns true if the holder of `lease` should be warned that its lease
/// could not be renewed. `last` is when the previous warning was shown.
pub fn should_warn(lease: &Lease, at: DateTime<Utc>, last: Option<DateTime<Utc>>) -> bool {
    let expiration = lease.expiration();
    if expiration < at {
        return true;
    }

    let remaining = duration_until(at, expiration);
    if remaining < FINAL_MINUTE {
        return true;
    }

    let one_third = lease.duration / 3;
    let one_quarter = lease.duration / 4;

    if let Some(last) = last {
        // A clock that went backwards always warns
        if at < last {
            return true;
        }
        if duration_until(last, at) < one_quarter {
            return false;
        }
    }

    if remaining < one_third {
        return true;
    }

    let missed = add_duration(lease.renewed, lease.effective_refresh());
    at > add_duration(missed, one_quarter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use warden_api::{Instance, Properties, Refresh, Status, Strategy, Subject};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    // 12 minute lease renewed at 0, refreshed every 6 minutes
    fn lease() -> Lease {
        Lease {
            subject: Subject::new("app", Instance::new("H1", "U1", "I1")),
            status: Status::Active,
            started: t(0),
            renewed: t(0),
            released: None,
            strategy: Strategy::Instance,
            limit: 1,
            duration: Duration::from_secs(720),
            decay: Duration::ZERO,
            refresh: Refresh::default(),
            properties: Properties::new(),
        }
    }

    #[test]
    fn expired_or_final_minute_always_warns() {
        assert!(should_warn(&lease(), t(721), Some(t(720))));
        assert!(should_warn(&lease(), t(670), Some(t(669))));
    }

    #[test]
    fn fresh_lease_does_not_warn() {
        assert!(!should_warn(&lease(), t(60), None));
    }

    #[test]
    fn warns_a_quarter_duration_after_missed_renewal() {
        let mut ls = lease();
        ls.refresh.active = Duration::from_secs(60);
        // Renewal was due at 60; a quarter duration is 180
        assert!(!should_warn(&ls, t(239), None));
        assert!(should_warn(&ls, t(241), None));

        assert!(!should_warn(&lease(), t(470), None));
    }

    #[test]
    fn warns_in_final_third() {
        assert!(should_warn(&lease(), t(481), Some(t(200))));
    }

    #[test]
    fn recent_warning_is_suppressed() {
        assert!(!should_warn(&lease(), t(600), Some(t(500))));
        assert!(should_warn(&lease(), t(600), Some(t(700))));
    }
}
