//! Lease transactions
//!
//! A `Tx` stages mutations over the lease set of one resource as read at a
//! particular store revision. Every accepted mutation is recorded as an
//! `Op`; the store later decides whether the transaction may be committed.

use chrono::{DateTime, Utc};

use crate::{Consumer, Instance, Lease, LeaseSet, Status};

/// A recorded lease operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create { lease: Lease },
    Update { previous: Lease, lease: Lease },
    Delete { previous: Lease },
}

impl Op {
    /// The lease as it exists after the operation, if any
    pub fn lease(&self) -> Option<&Lease> {
        match self {
            Op::Create { lease } | Op::Update { lease, .. } => Some(lease),
            Op::Delete { .. } => None,
        }
    }

    /// The lease as it existed before the operation, if any
    pub fn previous(&self) -> Option<&Lease> {
        match self {
            Op::Create { .. } => None,
            Op::Update { previous, .. } | Op::Delete { previous } => Some(previous),
        }
    }

    /// An update that keeps the subject and status is a plain renewal
    pub fn is_renewal(&self) -> bool {
        match self {
            Op::Update { previous, lease } => {
                previous.subject == lease.subject && previous.status == lease.status
            }
            _ => false,
        }
    }

    /// Returns true if the operation changes what counts against the limit
    pub fn is_consumptive(&self) -> bool {
        self.previous().is_some_and(Lease::is_consumptive)
            || self.lease().is_some_and(Lease::is_consumptive)
    }
}

/// What a processing function wants done with a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Leave the lease untouched
    Keep,
    /// Replace the lease with the modified copy
    Update,
    /// Remove the lease
    Delete,
}

/// A lease transaction for one resource
#[derive(Debug, Clone)]
pub struct Tx {
    resource: String,
    revision: u64,
    leases: LeaseSet,
    ops: Vec<Op>,
}

impl Tx {
    pub fn new(resource: impl Into<String>, revision: u64, mut leases: LeaseSet) -> Self {
        leases.sort();
        Self {
            resource: resource.into(),
            revision,
            leases,
            ops: Vec::new(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Store revision the transaction is based on
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The lease set the transaction will produce
    pub fn leases(&self) -> &LeaseSet {
        &self.leases
    }

    pub fn into_leases(self) -> LeaseSet {
        self.leases
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Returns true if no mutation has been recorded
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Walk the working set once, letting `f` modify each lease and decide
    /// whether to keep, update or delete it. The set is re-sorted afterwards.
    pub fn process<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Lease) -> Action,
    {
        let leases = self.leases.as_mut_vec();
        let mut i = 0;
        while i < leases.len() {
            let mut candidate = leases[i].clone();
            match f(&mut candidate) {
                Action::Keep => i += 1,
                Action::Update => {
                    let previous = std::mem::replace(&mut leases[i], candidate.clone());
                    self.ops.push(Op::Update {
                        previous,
                        lease: candidate,
                    });
                    i += 1;
                }
                Action::Delete => {
                    let previous = leases.remove(i);
                    self.ops.push(Op::Delete { previous });
                }
            }
        }
        self.leases.sort();
    }

    /// The lease held by the given instance, if any
    pub fn instance(&self, instance: &Instance) -> Option<&Lease> {
        self.leases.instance(&self.resource, instance)
    }

    /// All leases held by the given consumer, in canonical order
    pub fn consumer(&self, consumer: &Consumer) -> Vec<&Lease> {
        self.leases.consumer(&self.resource, consumer)
    }

    /// Add a lease to the set
    pub fn create(&mut self, lease: Lease) {
        self.leases.push(lease.clone());
        self.ops.push(Op::Create { lease });
        self.leases.sort();
    }

    /// Replace the lease held by `instance` with `lease`. The replacement may
    /// carry a different subject. Returns false if no such lease exists.
    pub fn update(&mut self, instance: &Instance, lease: Lease) -> bool {
        let mut found = false;
        let resource = self.resource.clone();
        self.process(|current| {
            if found || current.subject.resource != resource || &current.subject.instance != instance {
                return Action::Keep;
            }
            found = true;
            *current = lease.clone();
            Action::Update
        });
        found
    }

    /// Release the lease held by `instance` at the given time.
    ///
    /// Active leases become released; queued leases are removed; released
    /// leases are left alone. Returns false if no such lease exists.
    pub fn release(&mut self, instance: &Instance, at: DateTime<Utc>) -> bool {
        let mut found = false;
        let resource = self.resource.clone();
        self.process(|current| {
            if found || current.subject.resource != resource || &current.subject.instance != instance {
                return Action::Keep;
            }
            found = true;
            match current.status {
                Status::Active => {
                    current.status = Status::Released;
                    current.released = Some(at);
                    Action::Update
                }
                Status::Queued => Action::Delete,
                Status::Released => Action::Keep,
            }
        });
        found
    }

    /// Remove the lease held by `instance`. Returns false if no such lease exists.
    pub fn delete(&mut self, instance: &Instance) -> bool {
        let mut found = false;
        let resource = self.resource.clone();
        self.process(|current| {
            if found || current.subject.resource != resource || &current.subject.instance != instance {
                return Action::Keep;
            }
            found = true;
            Action::Delete
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::test_support::*;

    fn tx_with(leases: Vec<Lease>) -> Tx {
        Tx::new("app", 7, leases.into())
    }

    #[test]
    fn new_tx_is_empty() {
        let tx = tx_with(vec![lease("I1", Status::Active, 0)]);
        assert!(tx.is_empty());
        assert_eq!(tx.revision(), 7);
        assert_eq!(tx.resource(), "app");
    }

    #[test]
    fn create_records_op_and_sorts() {
        let mut tx = tx_with(vec![lease("q", Status::Queued, 0)]);
        tx.create(lease("a", Status::Active, 5));

        assert_eq!(tx.ops().len(), 1);
        assert!(matches!(tx.ops()[0], Op::Create { .. }));
        assert_eq!(tx.leases().as_slice()[0].instance().id.as_str(), "a");
    }

    #[test]
    fn update_can_change_subject() {
        let old = lease("I1", Status::Released, 0);
        let mut tx = tx_with(vec![old.clone()]);

        let replacement = lease("I2", Status::Active, 10);
        assert!(tx.update(old.instance(), replacement.clone()));

        assert_eq!(tx.leases().len(), 1);
        assert_eq!(tx.leases().as_slice()[0], replacement);
        assert_eq!(
            tx.ops(),
            &[Op::Update {
                previous: old,
                lease: replacement
            }]
        );
    }

    #[test]
    fn update_of_missing_instance_is_a_no_op() {
        let mut tx = tx_with(vec![lease("I1", Status::Active, 0)]);
        let missing = Instance::new("H9", "U9", "I9");
        assert!(!tx.update(&missing, lease("I9", Status::Active, 0)));
        assert!(tx.is_empty());
    }

    #[test]
    fn release_by_status() {
        let active = lease("a", Status::Active, 0);
        let queued = lease("q", Status::Queued, 0);
        let mut tx = tx_with(vec![active.clone(), queued.clone()]);

        assert!(tx.release(active.instance(), t(5)));
        assert!(tx.release(queued.instance(), t(5)));

        assert_eq!(tx.leases().len(), 1);
        let released = &tx.leases().as_slice()[0];
        assert_eq!(released.status, Status::Released);
        assert_eq!(released.released, Some(t(5)));
        assert_eq!(tx.ops().len(), 2);

        // Releasing again changes nothing
        let before = tx.ops().len();
        assert!(tx.release(active.instance(), t(6)));
        assert_eq!(tx.ops().len(), before);
    }

    #[test]
    fn delete_removes_lease() {
        let a = lease("a", Status::Active, 0);
        let mut tx = tx_with(vec![a.clone(), lease("b", Status::Active, 1)]);
        assert!(tx.delete(a.instance()));
        assert_eq!(tx.leases().len(), 1);
        assert!(tx.instance(a.instance()).is_none());
        assert_eq!(tx.ops(), &[Op::Delete { previous: a }]);
    }

    #[test]
    fn ops_replay_to_the_same_set() {
        let a = lease("a", Status::Active, 0);
        let q = lease("q", Status::Queued, 1);
        let original: LeaseSet = vec![a.clone(), q.clone()].into();
        let mut tx = Tx::new("app", 1, original.clone());

        tx.release(a.instance(), t(2));
        tx.create(lease("n", Status::Queued, 3));
        tx.delete(q.instance());

        let mut replayed = original;
        replayed.apply(tx.ops());
        assert_eq!(&replayed, tx.leases());
    }

    #[test]
    fn renewal_detection() {
        let prev = lease("a", Status::Active, 0);
        let mut renewed = prev.clone();
        renewed.renewed = t(10);
        let renewal = Op::Update {
            previous: prev.clone(),
            lease: renewed,
        };
        assert!(renewal.is_renewal());

        let mut released = prev.clone();
        released.status = Status::Released;
        let release = Op::Update {
            previous: prev,
            lease: released,
        };
        assert!(!release.is_renewal());
        assert!(release.is_consumptive());
    }
}
