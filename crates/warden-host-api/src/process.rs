//! Process descriptions

use serde::{Deserialize, Serialize};
use std::fmt;
use warden_api::Properties;

/// Property holding the program's file name
pub const PROP_PROGRAM_NAME: &str = "program.name";
pub const PROP_PROGRAM_PATH: &str = "program.path";
pub const PROP_PROGRAM_COMMANDLINE: &str = "program.commandline";
pub const PROP_PROCESS_ID: &str = "process.id";
pub const PROP_PROCESS_SESSION: &str = "process.session";
pub const PROP_USER_NAME: &str = "user.name";
pub const PROP_HOST_NAME: &str = "host.name";

/// Identifies one process for its whole lifetime
///
/// Process IDs are recycled by the OS; the creation time tells two
/// processes with the same ID apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId {
    pub pid: u32,
    /// Creation time in host-specific units
    pub created: u64,
}

impl UniqueId {
    pub fn new(pid: u32, created: u64) -> Self {
        Self { pid, created }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.created)
    }
}

/// The login session a process runs in, with the credentials needed to
/// start another program there
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: u32,
    pub uid: u32,
    pub gid: u32,
}

/// What the host knows about a running process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub unique_id: UniqueId,
    /// File name of the program
    pub name: String,
    /// Full path of the program, if it could be read
    pub path: String,
    pub command_line: Vec<String>,
    pub session: Session,
    pub user: String,
    /// The host considers this process essential to the OS
    #[serde(default)]
    pub protected: bool,
}

impl ProcessInfo {
    pub fn pid(&self) -> u32 {
        self.unique_id.pid
    }

    /// The command line joined for display
    pub fn command_line_string(&self) -> String {
        self.command_line.join(" ")
    }

    /// Lease properties describing this process
    pub fn properties(&self, host: &str) -> Properties {
        let mut props = Properties::new();
        props.insert(PROP_PROGRAM_NAME.into(), self.name.clone());
        props.insert(PROP_PROGRAM_PATH.into(), self.path.clone());
        props.insert(PROP_PROGRAM_COMMANDLINE.into(), self.command_line_string());
        props.insert(PROP_PROCESS_ID.into(), self.pid().to_string());
        props.insert(PROP_PROCESS_SESSION.into(), self.session.id.to_string());
        props.insert(PROP_USER_NAME.into(), self.user.clone());
        props.insert(PROP_HOST_NAME.into(), host.to_string());
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_describe_process() {
        let info = ProcessInfo {
            unique_id: UniqueId::new(42, 1000),
            name: "app".into(),
            path: "/usr/bin/app".into(),
            command_line: vec!["/usr/bin/app".into(), "--fast".into()],
            session: Session { id: 7, uid: 1000, gid: 1000 },
            user: "alice".into(),
            protected: false,
        };

        let props = info.properties("H1");
        assert_eq!(props[PROP_PROGRAM_NAME], "app");
        assert_eq!(props[PROP_PROGRAM_COMMANDLINE], "/usr/bin/app --fast");
        assert_eq!(props[PROP_PROCESS_ID], "42");
        assert_eq!(props[PROP_PROCESS_SESSION], "7");
        assert_eq!(props[PROP_HOST_NAME], "H1");
        assert_eq!(props.len(), 7);
    }

    #[test]
    fn unique_ids_differ_by_creation_time() {
        assert_ne!(UniqueId::new(42, 1), UniqueId::new(42, 2));
        assert_eq!(UniqueId::new(42, 1).to_string(), "42@1");
    }
}
