//! Lease type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use warden_util::{add_duration, duration_str};

use crate::{Consumer, Instance, MINIMUM_REFRESH, Properties, Refresh, Status, Strategy, Subject};

/// A single assignment of a leased resource
///
/// Besides the subject and timestamps, a lease carries a snapshot of the
/// policy values in effect when it was issued, so that the broker can
/// refresh it without consulting policies again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    #[serde(flatten)]
    pub subject: Subject,
    pub status: Status,
    pub started: DateTime<Utc>,
    pub renewed: DateTime<Utc>,
    /// Set iff `status` is `Released`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Strategy::is_unspecified")]
    pub strategy: Strategy,
    #[serde(default)]
    pub limit: u32,
    #[serde(with = "duration_str")]
    pub duration: Duration,
    #[serde(default, with = "duration_str")]
    pub decay: Duration,
    #[serde(default, skip_serializing_if = "Refresh::is_zero")]
    pub refresh: Refresh,
    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
}

impl Lease {
    pub fn resource(&self) -> &str {
        &self.subject.resource
    }

    pub fn instance(&self) -> &Instance {
        &self.subject.instance
    }

    pub fn consumer(&self) -> Consumer {
        self.subject.consumer()
    }

    /// Active or released leases count against the resource limit
    pub fn is_consumptive(&self) -> bool {
        matches!(self.status, Status::Active | Status::Released)
    }

    /// Time at which the lease expires if it is not renewed
    pub fn expiration(&self) -> DateTime<Utc> {
        add_duration(self.renewed, self.duration)
    }

    /// Returns true if the lease is expired at the given time
    pub fn expired(&self, at: DateTime<Utc>) -> bool {
        at > self.expiration()
    }

    /// Time at which the lease stops counting against the limit
    pub fn decay_time(&self) -> DateTime<Utc> {
        let base = self.released.unwrap_or_else(|| self.expiration());
        add_duration(base, self.decay)
    }

    /// Returns true if the lease is fully decayed at the given time
    pub fn decayed(&self, at: DateTime<Utc>) -> bool {
        at > self.decay_time()
    }

    /// The interval at which the holder should refresh the lease.
    ///
    /// This is the refresh value for the current status if it is non-zero,
    /// otherwise half the lease duration. It is never less than
    /// `MINIMUM_REFRESH`.
    pub fn effective_refresh(&self) -> Duration {
        let configured = match self.status {
            Status::Active => self.refresh.active,
            Status::Queued => self.refresh.queued,
            Status::Released => Duration::ZERO,
        };

        let interval = if configured.is_zero() {
            self.duration / 2
        } else {
            configured
        };

        interval.max(MINIMUM_REFRESH)
    }

    /// User-friendly name of the resource
    pub fn resource_name(&self) -> &str {
        for key in ["resource.name", "resource.id"] {
            if let Some(name) = self.properties.get(key).filter(|v| !v.is_empty()) {
                return name;
            }
        }
        &self.subject.resource
    }
}
