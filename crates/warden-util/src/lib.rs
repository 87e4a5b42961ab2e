//! Shared utilities for warden
//!
//! This crate provides:
//! - ID types (InstanceId)
//! - Time utilities (wall clock with mock override, lease arithmetic)
//! - Injectable clocks for deterministic tests
//! - Compact duration strings (`1h30m`) used on the wire and in policy files
//! - Error types
//! - Expiring memory for recently seen keys
//! - Default paths for data, cache and database files

mod clock;
mod duration;
mod error;
mod ids;
mod paths;
mod recent;
mod time;

pub use clock::*;
pub use duration::*;
pub use error::*;
pub use ids::*;
pub use paths::*;
pub use recent::*;
pub use time::*;
