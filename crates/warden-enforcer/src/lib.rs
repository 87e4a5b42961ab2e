//! Per-host enforcement for warden
//!
//! This crate provides:
//! - `PolicyManager`, which keeps a current policy set fetched from the broker
//! - The process filter built from policy criteria, and the blocklist
//! - `Invocation`, which gates one program on its lease
//! - `Orchestrator`, which scans processes and supervises invocations
//! - `Enforcer`, which runs policy refresh and enforcement on intervals

mod blocklist;
mod instance;
mod invocation;
mod orchestrator;
mod policies;
mod scanner;
mod service;

pub use blocklist::*;
pub use instance::*;
pub use invocation::*;
pub use orchestrator::*;
pub use policies::*;
pub use scanner::*;
pub use service::*;

use thiserror::Error;
use warden_client::ClientError;
use warden_config::ConfigError;
use warden_host_api::HostError;

/// Enforcer errors
#[derive(Debug, Error)]
pub enum EnforcerError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("policy retrieval timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type EnforcerResult<T> = std::result::Result<T, EnforcerError>;
