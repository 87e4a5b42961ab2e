//! Lease sets and tallies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;
use warden_util::duration_until;

use crate::{Consumer, Instance, Lease, Op, Status, Strategy};

/// An ordered sequence of leases
///
/// For a single resource the canonical order is: active leases, then
/// released leases, then queued leases. Released leases are ordered by
/// latest decay time first and then by oldest release time; active and
/// queued leases by oldest start time. The first released lease found for a
/// consumer is therefore the one chosen for replacement, and the oldest
/// queued lease is promoted first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseSet(Vec<Lease>);

impl LeaseSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Collect leases as given, without sorting. Used to concatenate the
    /// sets of several resources.
    pub fn from_iter_unsorted<I: IntoIterator<Item = Lease>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Lease> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Lease] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Lease> {
        self.0
    }

    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<Lease> {
        &mut self.0
    }

    pub fn push(&mut self, lease: Lease) {
        self.0.push(lease);
    }

    /// Sort the set into canonical order. The sort is stable, so leases that
    /// compare equal keep their arrival order.
    pub fn sort(&mut self) {
        self.0.sort_by(canonical_order);
    }

    /// Find the lease held by the given instance of a resource
    pub fn instance(&self, resource: &str, instance: &Instance) -> Option<&Lease> {
        self.0
            .iter()
            .find(|l| l.subject.resource == resource && &l.subject.instance == instance)
    }

    /// All leases of a resource held by the given consumer, in set order
    pub fn consumer(&self, resource: &str, consumer: &Consumer) -> Vec<&Lease> {
        self.0
            .iter()
            .filter(|l| l.subject.resource == resource && l.subject.instance.is_consumer(consumer))
            .collect()
    }

    /// Leases with the given status, in set order
    pub fn with_status(&self, status: Status) -> Vec<&Lease> {
        self.0.iter().filter(|l| l.status == status).collect()
    }

    /// Replay transaction operations against this set
    ///
    /// Updates and deletions locate their target by the previous lease's
    /// subject. Operations whose target is missing are skipped.
    pub fn apply(&mut self, ops: &[Op]) {
        for op in ops {
            match op {
                Op::Create { lease } => self.0.push(lease.clone()),
                Op::Update { previous, lease } => {
                    if let Some(slot) = self.0.iter_mut().find(|l| l.subject == previous.subject) {
                        *slot = lease.clone();
                    }
                }
                Op::Delete { previous } => {
                    if let Some(pos) = self.0.iter().position(|l| l.subject == previous.subject) {
                        self.0.remove(pos);
                    }
                }
            }
        }
        self.sort();
    }

    /// Count leases by status, per instance and per consumer
    pub fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        let mut active = HashSet::new();
        let mut released = HashSet::new();
        let mut queued = HashSet::new();
        let mut consumed = HashSet::new();

        for lease in &self.0 {
            let consumer = lease.consumer();
            match lease.status {
                Status::Active => {
                    stats.instance.active += 1;
                    stats.instance.consumed += 1;
                    active.insert(consumer.clone());
                    consumed.insert(consumer);
                }
                Status::Released => {
                    stats.instance.released += 1;
                    stats.instance.consumed += 1;
                    released.insert(consumer.clone());
                    consumed.insert(consumer);
                }
                Status::Queued => {
                    stats.instance.queued += 1;
                    queued.insert(consumer);
                }
            }
        }

        stats.consumer = Tally {
            active: active.len() as u32,
            released: released.len() as u32,
            queued: queued.len() as u32,
            consumed: consumed.len() as u32,
        };
        stats
    }

    /// Shortest time from `now` until a consumptive lease in the set decays
    ///
    /// Returns `None` if the set holds no consumptive leases.
    pub fn decay_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.0
            .iter()
            .filter(|l| l.is_consumptive())
            .map(|l| duration_until(now, l.decay_time()))
            .min()
    }
}

fn canonical_order(a: &Lease, b: &Lease) -> Ordering {
    a.status.rank().cmp(&b.status.rank()).then_with(|| match a.status {
        Status::Released => b
            .decay_time()
            .cmp(&a.decay_time())
            .then_with(|| a.released.cmp(&b.released)),
        Status::Active | Status::Queued => a.started.cmp(&b.started),
    })
}

impl From<Vec<Lease>> for LeaseSet {
    fn from(leases: Vec<Lease>) -> Self {
        let mut set = Self(leases);
        set.sort();
        set
    }
}

impl FromIterator<Lease> for LeaseSet {
    fn from_iter<I: IntoIterator<Item = Lease>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl IntoIterator for LeaseSet {
    type Item = Lease;
    type IntoIter = std::vec::IntoIter<Lease>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a LeaseSet {
    type Item = &'a Lease;
    type IntoIter = std::slice::Iter<'a, Lease>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Number of leases (or consumers) with each status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub active: u32,
    pub released: u32,
    pub queued: u32,
    /// Active plus released
    pub consumed: u32,
}

/// Resource consumption for each counting strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub instance: Tally,
    pub consumer: Tally,
}

impl Stats {
    pub fn tally(&self, strategy: Strategy) -> Tally {
        match strategy.effective() {
            Strategy::Consumer => self.consumer,
            _ => self.instance,
        }
    }

    /// One-line allocation summary used in broker logs. An unlimited
    /// resource shows its limit as `∞`.
    pub fn summary(&self, strategy: Strategy, limit: u32) -> String {
        let t = self.tally(strategy);
        let limit = if limit == u32::MAX {
            "∞".to_string()
        } else {
            limit.to_string()
        };
        format!(
            "alloc: {}/{} active: {} released: {} queued: {}",
            t.consumed, limit, t.active, t.released, t.queued
        )
    }
}

/// A lease set for one resource at a store revision
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub resource: String,
    pub revision: u64,
    pub leases: LeaseSet,
    #[serde(default)]
    pub stats: Stats,
}

impl Snapshot {
    pub fn new(resource: impl Into<String>, revision: u64, leases: LeaseSet) -> Self {
        let stats = leases.stats();
        Self {
            resource: resource.into(),
            revision,
            leases,
            stats,
        }
    }
}
