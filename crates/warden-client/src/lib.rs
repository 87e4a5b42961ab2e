//! Broker client for warden
//!
//! Provides:
//! - `LeaseService`, the acquire/release capability used by lease holders
//! - Endpoint selection by health probing
//! - Resolvers that produce candidate endpoints
//! - `Client`, which caches a selected endpoint
//! - `Maintainer`, a task that acquires and renews one lease
//! - The offline warning rule

mod client;
mod endpoints;
mod maintainer;
mod resolver;
mod service;
mod warn;

pub use client::*;
pub use endpoints::*;
pub use maintainer::*;
pub use resolver::*;
pub use service::*;
pub use warn::*;

use thiserror::Error;
use warden_http::HttpError;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("endpoint selection failed: no servers available")]
    NoEndpoints,

    #[error("endpoint selection failed: {failures} attempts to connect to {endpoints} servers failed: {first}")]
    SelectionFailed {
        failures: usize,
        endpoints: usize,
        first: String,
    },

    #[error("failed to locate broker endpoints: {0}")]
    Resolve(String),

    #[error("the lease maintainer has already been started")]
    Started,

    #[error("already closed")]
    Closed,
}

impl ClientError {
    /// Returns true if the broker could not be reached
    pub fn is_offline(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_transport(),
            ClientError::NoEndpoints | ClientError::SelectionFailed { .. } | ClientError::Resolve(_) => true,
            ClientError::Started | ClientError::Closed => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
