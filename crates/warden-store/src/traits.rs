//! Store trait definitions

use warden_api::{LeaseSet, Tx};

use crate::StoreResult;

/// Revisioned storage of lease sets, one per resource
///
/// Each resource carries a revision that increases by exactly one on every
/// successful commit. A commit is accepted only if the transaction was built
/// against the current revision; otherwise it fails with
/// `StoreError::Conflict` and the caller is expected to re-read and retry.
pub trait LeaseStore: Send + Sync {
    /// Display name used in startup logs
    fn name(&self) -> String;

    /// Every resource that currently has lease data
    fn resources(&self) -> StoreResult<Vec<String>>;

    /// The current revision and lease set of a resource. An unknown
    /// resource is at revision 0 with no leases.
    fn view(&self, resource: &str) -> StoreResult<(u64, LeaseSet)>;

    /// Apply the operations of a transaction atomically
    fn commit(&self, tx: &Tx) -> StoreResult<()>;

    /// Release any resources held by the store
    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl<S: LeaseStore + ?Sized> LeaseStore for std::sync::Arc<S> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn resources(&self) -> StoreResult<Vec<String>> {
        (**self).resources()
    }

    fn view(&self, resource: &str) -> StoreResult<(u64, LeaseSet)> {
        (**self).view(resource)
    }

    fn commit(&self, tx: &Tx) -> StoreResult<()> {
        (**self).commit(tx)
    }

    fn close(&self) -> StoreResult<()> {
        (**self).close()
    }
}

impl<S: LeaseStore + ?Sized> LeaseStore for Box<S> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn resources(&self) -> StoreResult<Vec<String>> {
        (**self).resources()
    }

    fn view(&self, resource: &str) -> StoreResult<(u64, LeaseSet)> {
        (**self).view(resource)
    }

    fn commit(&self, tx: &Tx) -> StoreResult<()> {
        (**self).commit(tx)
    }

    fn close(&self) -> StoreResult<()> {
        (**self).close()
    }
}
