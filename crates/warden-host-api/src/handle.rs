//! Process handles

use serde::{Deserialize, Serialize};

use crate::{ProcessInfo, UniqueId};

/// Rights held on an opened process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// May observe and terminate the process
    Full,
    /// May only observe the process
    Passive,
}

/// An opened process
///
/// Created by the host when a scanned process is opened. The handle keeps
/// the process description captured at scan time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessHandle {
    info: ProcessInfo,
    access: Access,
}

impl ProcessHandle {
    pub fn new(info: ProcessInfo, access: Access) -> Self {
        Self { info, access }
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn unique_id(&self) -> UniqueId {
        self.info.unique_id
    }

    pub fn pid(&self) -> u32 {
        self.info.pid()
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn can_terminate(&self) -> bool {
        self.access == Access::Full
    }
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code if the process exited normally and the code is known
    pub code: Option<i32>,

    /// Signal number if the process was killed by a signal
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// A process that ended without reporting how
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}
