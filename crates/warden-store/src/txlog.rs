//! Transaction logging decorator
//!
//! Wraps another store and writes every committed lease change to the
//! `warden::txlog` tracing target. Renewals are not logged. A checkpoint
//! block listing every consumptive lease is written at startup and whenever
//! the configured number of consumptive operations has passed.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};
use warden_api::{LeaseSet, Op, Tx};

use crate::{LeaseStore, StoreError, StoreResult};

/// Tracing target for transaction log lines
pub const TXLOG_TARGET: &str = "warden::txlog";

const OPS_SUFFIX: &str = "ops";

/// Checkpoint after this many consumptive operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSchedule {
    pub ops: u64,
}

/// Parse a space-separated checkpoint schedule such as `"100ops"`
pub fn parse_schedule(s: &str) -> StoreResult<Vec<CheckpointSchedule>> {
    let mut schedule = Vec::new();
    for item in s.split_whitespace() {
        let Some(value) = item.strip_suffix(OPS_SUFFIX) else {
            return Err(StoreError::InvalidSchedule(format!(
                "\"{}\": expected a number of operations such as \"100ops\"",
                item
            )));
        };
        let ops: u64 = value.parse().map_err(|_| {
            StoreError::InvalidSchedule(format!(
                "\"{}\": unable to parse \"{}\" as an integer",
                item, value
            ))
        })?;
        if ops == 0 {
            return Err(StoreError::InvalidSchedule(format!(
                "\"{}\": ops must be greater than zero",
                item
            )));
        }
        schedule.push(CheckpointSchedule { ops });
    }
    Ok(schedule)
}

/// Format an operation as a transaction log line
pub fn describe_op(op: &Op) -> String {
    match op {
        Op::Create { lease } => format!("CREATE LEASE {}", lease.subject),
        Op::Update { previous, lease } => {
            format!("UPDATE LEASE {} FROM {}", lease.subject, previous.subject)
        }
        Op::Delete { previous } => format!("DELETE LEASE {}", previous.subject),
    }
}

/// A store decorator that logs lease transactions
pub struct TxLogStore<S> {
    inner: S,
    schedule: Vec<CheckpointSchedule>,
    // Held for reading by view/commit and for writing while checkpointing
    gate: RwLock<()>,
    ops: AtomicU64,
    last_checkpoint: AtomicU64,
    checkpoints: AtomicU64,
}

impl<S: LeaseStore> TxLogStore<S> {
    /// Wrap `inner` and write the initial checkpoint
    pub fn new(inner: S, schedule: Vec<CheckpointSchedule>) -> Self {
        let store = Self {
            inner,
            schedule,
            gate: RwLock::new(()),
            ops: AtomicU64::new(0),
            last_checkpoint: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
        };
        if let Err(e) = store.checkpoint() {
            warn!(error = %e, "Initial transaction log checkpoint failed");
        }
        store
    }

    /// Number of checkpoints written so far
    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoints.load(Ordering::SeqCst)
    }

    /// Number of consumptive operations logged so far
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::SeqCst)
    }

    /// Write every consumptive lease to the log in a checkpoint block
    pub fn checkpoint(&self) -> StoreResult<()> {
        let _guard = self.gate.write().unwrap();
        self.write_checkpoint()
    }

    fn write_checkpoint(&self) -> StoreResult<()> {
        let at = warden_util::now().timestamp_nanos_opt().unwrap_or_default();
        let resources = self.inner.resources()?;

        info!(target: TXLOG_TARGET, "CP {} START", at);
        for resource in resources {
            match self.inner.view(&resource) {
                Ok((revision, leases)) => {
                    info!(target: TXLOG_TARGET, "CP {} RESOURCE {} REV {}", at, resource, revision);
                    log_leases(at, &leases);
                }
                Err(e) => {
                    info!(target: TXLOG_TARGET, "CP {} RESOURCE {} ERR {}", at, resource, e);
                }
            }
        }
        info!(target: TXLOG_TARGET, "CP {} END", at);

        self.last_checkpoint
            .store(self.ops.load(Ordering::SeqCst), Ordering::SeqCst);
        self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Log the ops of a committed transaction and return the new op count
    fn record(&self, tx: &Tx) -> u64 {
        let mut consumptive = 0;
        for op in tx.ops() {
            if op.is_renewal() {
                continue;
            }
            info!(target: TXLOG_TARGET, "TX {}", describe_op(op));
            if op.is_consumptive() {
                consumptive += 1;
            }
        }
        self.ops.fetch_add(consumptive, Ordering::SeqCst) + consumptive
    }

    fn checkpoint_due(&self, current: u64) -> bool {
        let since = current.saturating_sub(self.last_checkpoint.load(Ordering::SeqCst));
        since > 0 && self.schedule.iter().any(|s| since >= s.ops)
    }
}

fn log_leases(at: i64, leases: &LeaseSet) {
    for lease in leases.iter().filter(|l| l.is_consumptive()) {
        info!(
            target: TXLOG_TARGET,
            "CP {} LEASE {} {}",
            at,
            lease.subject,
            lease.status.as_str().to_uppercase()
        );
    }
}

impl<S: LeaseStore> LeaseStore for TxLogStore<S> {
    fn name(&self) -> String {
        format!("{} (with logged transactions)", self.inner.name())
    }

    fn resources(&self) -> StoreResult<Vec<String>> {
        self.inner.resources()
    }

    fn view(&self, resource: &str) -> StoreResult<(u64, LeaseSet)> {
        let _guard = self.gate.read().unwrap();
        self.inner.view(resource)
    }

    fn commit(&self, tx: &Tx) -> StoreResult<()> {
        let current = {
            let _guard = self.gate.read().unwrap();
            self.inner.commit(tx)?;
            self.record(tx)
        };

        if self.checkpoint_due(current) {
            let _guard = self.gate.write().unwrap();
            // Another commit may have checkpointed while we waited
            if self.checkpoint_due(self.ops.load(Ordering::SeqCst)) {
                if let Err(e) = self.write_checkpoint() {
                    warn!(error = %e, "Transaction log checkpoint failed");
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        self.inner.close()
    }
}
