//! Lease holder state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Lease, LeaseSet, Status};

/// What a lease maintainer knows about its lease
///
/// A new state is broadcast to listeners after every acquisition attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseState {
    /// Did the last attempt reach the broker?
    pub online: bool,
    /// Did the broker say that no lease is required?
    pub lease_not_required: bool,
    /// Has a lease of any status been acquired?
    pub acquired: bool,
    /// The most recent lease received from the broker
    pub lease: Option<Lease>,
    /// All leases for the lease's resource
    pub leases: LeaseSet,
    /// Retry interval used while no lease is held
    #[serde(with = "warden_util::duration_str")]
    pub retry: Duration,
    /// The most recent acquisition error
    pub err: Option<String>,
}

impl LeaseState {
    /// Returns true if the state holds a zero value
    pub fn is_zero(&self) -> bool {
        !self.online
            && !self.acquired
            && !self.lease_not_required
            && self.lease.is_none()
            && self.leases.is_empty()
            && self.err.is_none()
    }

    /// The held lease, if one has been acquired
    pub fn held(&self) -> Option<&Lease> {
        if self.acquired { self.lease.as_ref() } else { None }
    }

    /// Returns true if the state holds an active lease that has not expired
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.held()
            .is_some_and(|l| l.status == Status::Active && !l.expired(at))
    }
}
