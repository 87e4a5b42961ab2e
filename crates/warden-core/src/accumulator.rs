//! Per-consumer lease accounting

use std::collections::HashMap;
use warden_api::{Consumer, LeaseSet, Status, Strategy};

/// Counts active and released leases per consumer
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    total: u32,
    active: HashMap<Consumer, u32>,
    released: HashMap<Consumer, u32>,
    consumed: HashMap<Consumer, u32>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an accumulator over every lease in a set
    pub fn from_leases(leases: &LeaseSet) -> Self {
        let mut acc = Self::new();
        for lease in leases {
            acc.add(lease.consumer(), lease.status);
        }
        acc
    }

    /// Record a lease. Queued leases are not counted.
    pub fn add(&mut self, consumer: Consumer, status: Status) {
        match status {
            Status::Active => {
                self.total += 1;
                *self.active.entry(consumer.clone()).or_default() += 1;
                *self.consumed.entry(consumer).or_default() += 1;
            }
            Status::Released => {
                self.total += 1;
                *self.released.entry(consumer.clone()).or_default() += 1;
                *self.consumed.entry(consumer).or_default() += 1;
            }
            Status::Queued => {}
        }
    }

    /// Active leases held by a consumer
    pub fn active(&self, consumer: &Consumer) -> u32 {
        self.active.get(consumer).copied().unwrap_or(0)
    }

    /// Released leases held by a consumer
    pub fn released(&self, consumer: &Consumer) -> u32 {
        self.released.get(consumer).copied().unwrap_or(0)
    }

    /// Active and released leases held by a consumer
    pub fn consumed(&self, consumer: &Consumer) -> u32 {
        self.consumed.get(consumer).copied().unwrap_or(0)
    }

    /// Total consumption under a counting strategy: every lease for
    /// `Instance`, every distinct consumer for `Consumer`
    pub fn total(&self, strategy: Strategy) -> u32 {
        match strategy.effective() {
            Strategy::Consumer => self.consumed.len() as u32,
            _ => self.total,
        }
    }
}

/// Returns true if a new lease may be made active.
///
/// `active` is the number of active leases already held by the requesting
/// consumer and `consumed` the resource consumption under `strategy`.
pub fn can_activate(strategy: Strategy, active: u32, consumed: u32, limit: u32) -> bool {
    if limit == 0 {
        return false;
    }
    if consumed > limit {
        return false;
    }
    if strategy.effective() == Strategy::Consumer && active > 0 {
        return true;
    }
    consumed < limit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(host: &str) -> Consumer {
        Consumer {
            host: host.into(),
            user: "U".into(),
        }
    }

    #[test]
    fn totals_by_strategy() {
        let mut acc = Accumulator::new();
        acc.add(consumer("H1"), Status::Active);
        acc.add(consumer("H1"), Status::Active);
        acc.add(consumer("H1"), Status::Released);
        acc.add(consumer("H2"), Status::Released);
        acc.add(consumer("H3"), Status::Queued);

        assert_eq!(acc.total(Strategy::Instance), 4);
        assert_eq!(acc.total(Strategy::Unspecified), 4);
        assert_eq!(acc.total(Strategy::Consumer), 2);
        assert_eq!(acc.active(&consumer("H1")), 2);
        assert_eq!(acc.released(&consumer("H1")), 1);
        assert_eq!(acc.consumed(&consumer("H1")), 3);
        assert_eq!(acc.consumed(&consumer("H3")), 0);
    }

    #[test]
    fn zero_limit_never_activates() {
        assert!(!can_activate(Strategy::Instance, 0, 0, 0));
        assert!(!can_activate(Strategy::Consumer, 3, 0, 0));
    }

    #[test]
    fn over_limit_never_activates() {
        assert!(!can_activate(Strategy::Consumer, 1, 3, 2));
        assert!(!can_activate(Strategy::Instance, 0, 3, 2));
    }

    #[test]
    fn consumer_strategy_admits_existing_consumers_at_limit() {
        assert!(can_activate(Strategy::Consumer, 1, 1, 1));
        assert!(!can_activate(Strategy::Consumer, 0, 1, 1));
        assert!(!can_activate(Strategy::Instance, 1, 1, 1));
        assert!(can_activate(Strategy::Instance, 0, 0, 1));
    }
}
