//! In-memory store implementation

use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;
use warden_api::{LeaseSet, Tx};

use crate::{LeaseStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct Record {
    revision: u64,
    leases: LeaseSet,
}

/// Lease store that keeps everything in memory
///
/// Records are kept after their lease set empties so that revisions never
/// go backwards.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryStore {
    fn name(&self) -> String {
        "Memory".to_string()
    }

    fn resources(&self) -> StoreResult<Vec<String>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|(_, r)| !r.leases.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn view(&self, resource: &str) -> StoreResult<(u64, LeaseSet)> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(resource)
            .map(|r| (r.revision, r.leases.clone()))
            .unwrap_or_default())
    }

    fn commit(&self, tx: &Tx) -> StoreResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(tx.resource().to_string()).or_default();

        if record.revision != tx.revision() {
            return Err(StoreError::Conflict {
                resource: tx.resource().to_string(),
                expected: tx.revision(),
                actual: record.revision,
            });
        }

        record.leases.apply(tx.ops());
        record.revision += 1;
        debug!(resource = tx.resource(), revision = record.revision, ops = tx.ops().len(), "Lease commit");
        Ok(())
    }
}
