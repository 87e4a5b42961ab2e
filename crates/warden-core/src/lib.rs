//! Lease broker engine for warden
//!
//! This crate is the heart of the broker, containing:
//! - Lease refresh (expiry, decay and queue promotion)
//! - Per-consumer accounting and activation rules
//! - Acquire, release and purge transactions with optimistic retries

mod accumulator;
mod engine;
mod refresh;

pub use accumulator::*;
pub use engine::*;
pub use refresh::*;

use thiserror::Error;
use warden_api::ApiError;
use warden_config::ConfigError;
use warden_store::StoreError;

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Request(#[from] ApiError),

    #[error("unable to retrieve policies: {0}")]
    Policies(#[from] ConfigError),

    #[error("lease store error: {0}")]
    Store(#[from] StoreError),

    #[error("transaction on \"{resource}\" abandoned after {attempts} conflicting attempts")]
    Contention { resource: String, attempts: usize },
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use warden_api::{Instance, Lease, Properties, Refresh, Status, Strategy, Subject};

    pub fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    pub fn lease(host: &str, id: &str, status: Status, started: i64, limit: u32) -> Lease {
        Lease {
            subject: Subject::new("app", Instance::new(host, "U1", id)),
            status,
            started: t(started),
            renewed: t(started),
            released: None,
            strategy: Strategy::Instance,
            limit,
            duration: Duration::from_secs(60),
            decay: Duration::from_secs(30),
            refresh: Refresh::default(),
            properties: Properties::new(),
        }
    }
}
