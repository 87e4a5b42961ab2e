//! Time-based lease transitions

use chrono::{DateTime, Utc};
use warden_api::{Action, Status, Tx};

use crate::Accumulator;

/// Bring every lease in a transaction up to date at time `at`.
///
/// In one pass over the canonically ordered set:
/// - decayed active and released leases are deleted
/// - expired active leases are released at `at`
/// - expired queued leases are deleted
/// - queued leases are promoted, oldest first, while the number of active
///   and released leases is below the lease's limit
///
/// Promotion counts every lease individually. Consumer limits are applied
/// when leases are acquired.
///
/// Returns an accumulator over the refreshed set.
pub fn refresh(tx: &mut Tx, at: DateTime<Utc>) -> Accumulator {
    let mut allocation: u32 = 0;

    tx.process(|lease| match lease.status {
        Status::Active => {
            if lease.decayed(at) {
                return Action::Delete;
            }
            allocation += 1;
            if lease.expired(at) {
                lease.status = Status::Released;
                lease.released = Some(at);
                Action::Update
            } else {
                Action::Keep
            }
        }
        Status::Released => {
            if lease.decayed(at) {
                return Action::Delete;
            }
            allocation += 1;
            Action::Keep
        }
        Status::Queued => {
            if lease.expired(at) {
                return Action::Delete;
            }
            if allocation < lease.limit {
                lease.status = Status::Active;
                allocation += 1;
                Action::Update
            } else {
                Action::Keep
            }
        }
    });

    Accumulator::from_leases(tx.leases())
}
