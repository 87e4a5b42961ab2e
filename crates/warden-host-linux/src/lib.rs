//! Linux process host for the warden enforcer
//!
//! Provides:
//! - Process enumeration from `/proc`
//! - Immediate termination with SIGKILL
//! - Starting programs with the credentials of an observed session
//! - Exit observation for children and foreign processes

mod adapter;
mod procfs;

pub use adapter::*;
pub use procfs::*;
