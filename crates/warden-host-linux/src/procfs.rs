//! /proc parsing

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Fields read from `/proc/<pid>/stat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub comm: String,
    pub state: char,
    pub session: u32,
    /// Start time in clock ticks after boot
    pub start_time: u64,
}

impl Stat {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Real user and group of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// A proc filesystem mounted at some root
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, pid: u32, file: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(file)
    }

    /// Every numeric entry of the root
    pub fn pids(&self) -> io::Result<Vec<u32>> {
        let mut pids: Vec<u32> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    pub fn stat(&self, pid: u32) -> io::Result<Stat> {
        let raw = fs::read_to_string(self.path(pid, "stat"))?;
        parse_stat(&raw).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("malformed stat for {}", pid)))
    }

    /// Arguments of the process; empty for kernel threads
    pub fn cmdline(&self, pid: u32) -> io::Result<Vec<String>> {
        let raw = fs::read(self.path(pid, "cmdline"))?;
        Ok(raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect())
    }

    pub fn exe(&self, pid: u32) -> io::Result<PathBuf> {
        fs::read_link(self.path(pid, "exe"))
    }

    pub fn credentials(&self, pid: u32) -> io::Result<Credentials> {
        let raw = fs::read_to_string(self.path(pid, "status"))?;
        parse_credentials(&raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("malformed status for {}", pid)))
    }

    pub fn hostname(&self) -> io::Result<String> {
        let raw = fs::read_to_string(self.root.join("sys/kernel/hostname"))?;
        Ok(raw.trim().to_string())
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

/// Parse the contents of a stat file. The command name may itself hold
/// spaces and parentheses, so fields are counted from the last `)`.
pub fn parse_stat(raw: &str) -> Option<Stat> {
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    let comm = raw.get(open + 1..close)?.to_string();
    let fields: Vec<&str> = raw.get(close + 1..)?.split_whitespace().collect();

    Some(Stat {
        comm,
        state: fields.first()?.chars().next()?,
        session: fields.get(3)?.parse().ok()?,
        start_time: fields.get(19)?.parse().ok()?,
    })
}

fn parse_credentials(raw: &str) -> Option<Credentials> {
    let real = |prefix: &str| -> Option<u32> {
        raw.lines()
            .find_map(|line| line.strip_prefix(prefix))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|id| id.parse().ok())
    };
    Some(Credentials {
        uid: real("Uid:")?,
        gid: real("Gid:")?,
    })
}

/// The file name of a program path
pub fn program_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
