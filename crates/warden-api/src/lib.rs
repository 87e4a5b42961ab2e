//! Lease model and wire types for warden
//!
//! This crate defines the data shared by the broker and its clients:
//! - Subjects, instances and consumers
//! - Leases and their status, strategy and refresh settings
//! - Lease sets in canonical order, with tallies
//! - Transactions (staged mutations over a revisioned lease set)
//! - Lease maintainer state
//! - HTTP request and response bodies

mod error;
mod lease;
mod set;
mod state;
mod transport;
mod tx;
mod types;

pub use error::*;
pub use lease::*;
pub use set::*;
pub use state::*;
pub use transport::*;
pub use tx::*;
pub use types::*;
