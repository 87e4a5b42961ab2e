//! Process host interfaces for the warden enforcer
//!
//! This crate defines the narrow boundary between the enforcer and the
//! operating system: enumerating processes, opening handles to them,
//! terminating them, starting programs in a user's session and observing
//! their exit. It contains no platform code itself.

mod handle;
mod mock;
mod process;
mod traits;

pub use handle::*;
pub use mock::*;
pub use process::*;
pub use traits::*;
