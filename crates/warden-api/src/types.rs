//! Shared types for the warden lease model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use warden_util::{InstanceId, duration_str};

/// The minimum amount of time between lease refresh attempts.
///
/// This is a hard floor that keeps misconfigured policies from hammering the
/// broker. It also serves as the minimum lease duration.
pub const MINIMUM_REFRESH: Duration = Duration::from_secs(1);

/// Free-form lease properties
pub type Properties = BTreeMap<String, String>;

/// Merge property maps in order. Later maps win on conflicting keys.
pub fn merge_properties<'a>(maps: impl IntoIterator<Item = &'a Properties>) -> Properties {
    let mut merged = Properties::new();
    for map in maps {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Lease status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting for capacity; does not count against the limit
    Queued,
    /// In use and counted against the limit
    Active,
    /// Use has ended; still counted against the limit until it decays
    Released,
}

impl Status {
    /// Rank used for canonical lease set ordering: active, released, queued
    pub fn rank(self) -> u8 {
        match self {
            Status::Active => 0,
            Status::Released => 1,
            Status::Queued => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Active => "active",
            Status::Released => "released",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource counting strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// No strategy given; treated as `Instance`
    #[default]
    #[serde(rename = "")]
    Unspecified,
    /// Every lease counts against the limit
    Instance,
    /// All leases held by one consumer count once
    Consumer,
}

impl Strategy {
    /// The strategy actually used for counting
    pub fn effective(self) -> Strategy {
        match self {
            Strategy::Unspecified => Strategy::Instance,
            other => other,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Strategy::Unspecified
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Unspecified => "",
            Strategy::Instance => "instance",
            Strategy::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refresh intervals for active and queued leases. Zero means "use the default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Refresh {
    #[serde(default, with = "duration_str", skip_serializing_if = "Duration::is_zero")]
    pub active: Duration,
    #[serde(default, with = "duration_str", skip_serializing_if = "Duration::is_zero")]
    pub queued: Duration,
}

impl Refresh {
    pub fn is_zero(&self) -> bool {
        self.active.is_zero() && self.queued.is_zero()
    }
}

/// The (host, user) pair that identifies a consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Consumer {
    pub host: String,
    pub user: String,
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.host, self.user)
    }
}

/// One invocation by a consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instance {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "InstanceId::is_empty")]
    pub id: InstanceId,
}

impl Instance {
    pub fn new(host: impl Into<String>, user: impl Into<String>, id: impl Into<InstanceId>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            id: id.into(),
        }
    }

    pub fn consumer(&self) -> Consumer {
        Consumer {
            host: self.host.clone(),
            user: self.user.clone(),
        }
    }

    /// Returns true if this instance belongs to the given consumer
    pub fn is_consumer(&self, consumer: &Consumer) -> bool {
        self.host == consumer.host && self.user == consumer.user
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.user.is_empty() && self.id.is_empty()
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.host, self.user, self.id)
    }
}

/// What a lease is about
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub resource: String,
    #[serde(default, skip_serializing_if = "Instance::is_empty")]
    pub instance: Instance,
}

impl Subject {
    pub fn new(resource: impl Into<String>, instance: Instance) -> Self {
        Self {
            resource: resource.into(),
            instance,
        }
    }

    pub fn consumer(&self) -> Consumer {
        self.instance.consumer()
    }

    pub fn is_empty(&self) -> bool {
        self.resource.is_empty() && self.instance.is_empty()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.resource, self.instance)
    }
}
