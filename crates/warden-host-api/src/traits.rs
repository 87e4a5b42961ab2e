//! Process host trait

use async_trait::async_trait;
use thiserror::Error;

use crate::{ExitStatus, ProcessHandle, ProcessInfo, Session};

/// Errors from process host operations
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Process {0} not found")]
    NotFound(u32),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Terminate failed: {0}")]
    TerminateFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type HostResult<T> = Result<T, HostError>;

/// Filter over program names used while scanning
pub type NameFilter<'a> = dyn Fn(&str) -> bool + Send + Sync + 'a;

/// The enforcer's view of the operating system
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// The name this host reports to the broker
    fn hostname(&self) -> String;

    /// Enumerate running processes whose program name passes `filter`.
    ///
    /// Processes that fail the filter are not inspected further.
    async fn scan(&self, filter: &NameFilter<'_>) -> HostResult<Vec<ProcessInfo>>;

    /// Open a scanned process. In passive mode the handle may only observe.
    async fn open(&self, info: &ProcessInfo, passive: bool) -> HostResult<ProcessHandle>;

    /// Kill the process immediately
    async fn terminate(&self, handle: &ProcessHandle) -> HostResult<()>;

    /// Start `command_line` in `session` with its credentials, returning
    /// the new process ID
    async fn spawn_in_session(&self, session: &Session, command_line: &[String]) -> HostResult<u32>;

    /// Wait for the process to exit
    async fn wait_exit(&self, handle: &ProcessHandle) -> HostResult<ExitStatus>;
}
