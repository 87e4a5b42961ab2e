//! HTTP layer for warden
//!
//! Provides:
//! - The broker's HTTP server (axum)
//! - Periodic purge and graceful shutdown
//! - `Endpoint`, a reqwest client for one broker

mod client;
mod server;

pub use client::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_config::PolicySet;

/// HTTP errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid endpoint URL \"{0}\"")]
    InvalidUrl(String),

    /// The broker answered with a non-success status
    #[error("broker returned {status}: {message}")]
    Status { status: u16, message: String },
}

impl HttpError {
    /// Returns true if the broker could not be reached or did not answer
    pub fn is_transport(&self) -> bool {
        matches!(self, HttpError::Transport(_) | HttpError::Io(_))
    }
}

pub type HttpResult<T> = Result<T, HttpError>;

/// Response to `GET /policies`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoliciesResponse {
    pub policies: PolicySet,
}
