//! Lease storage for the warden broker
//!
//! Provides:
//! - The `LeaseStore` trait: revisioned views and optimistic commits
//! - An in-memory store
//! - A SQLite store
//! - A decorator that logs lease transactions with periodic checkpoints

mod memory;
mod sqlite;
mod traits;
mod txlog;

pub use memory::*;
pub use sqlite::*;
pub use traits::*;
pub use txlog::*;

use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The resource was modified after the transaction's view was taken
    #[error("revision conflict on \"{resource}\": transaction is based on {expected}, store is at {actual}")]
    Conflict {
        resource: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid checkpoint schedule: {0}")]
    InvalidSchedule(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use warden_api::{Instance, Lease, Properties, Refresh, Status, Strategy, Subject};

    pub fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    pub fn lease(resource: &str, id: &str, status: Status) -> Lease {
        Lease {
            subject: Subject::new(resource, Instance::new("H1", "U1", id)),
            status,
            started: t(0),
            renewed: t(0),
            released: None,
            strategy: Strategy::Instance,
            limit: 2,
            duration: Duration::from_secs(60),
            decay: Duration::ZERO,
            refresh: Refresh::default(),
            properties: Properties::new(),
        }
    }
}
