//! Linux process host implementation

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, Uid, User};
use std::collections::HashMap;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_host_api::{
    Access, ExitStatus, HostError, HostResult, NameFilter, ProcessHandle, ProcessHost, ProcessInfo,
    Session, UniqueId,
};

use crate::procfs::{ProcFs, program_name};

/// How often a foreign process is checked for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Process host backed by `/proc` and signals
pub struct LinuxHost {
    proc: ProcFs,
    hostname: String,
    /// Processes we started; they must be reaped by us
    children: Mutex<HashMap<u32, Child>>,
}

impl LinuxHost {
    pub fn new() -> Self {
        Self::with_procfs(ProcFs::default())
    }

    pub fn with_procfs(proc: ProcFs) -> Self {
        let hostname = proc.hostname().unwrap_or_else(|e| {
            warn!(error = %e, "Unable to read host name");
            "localhost".to_string()
        });
        Self {
            proc,
            hostname,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Report the host under a different name
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Describe one process, or `None` if it vanished while being read
    pub fn describe(&self, pid: u32) -> Option<ProcessInfo> {
        let stat = self.proc.stat(pid).ok()?;
        let command_line = self.proc.cmdline(pid).ok()?;
        self.describe_with(pid, stat, command_line)
    }

    fn describe_with(&self, pid: u32, stat: crate::Stat, command_line: Vec<String>) -> Option<ProcessInfo> {
        let creds = self.proc.credentials(pid).ok()?;
        let path = match self.proc.exe(pid) {
            Ok(exe) => exe.to_string_lossy().into_owned(),
            Err(_) => command_line.first().cloned().unwrap_or_default(),
        };
        let name = match command_line.first() {
            Some(arg0) => program_name(arg0).to_string(),
            None => stat.comm.clone(),
        };
        let user = User::from_uid(Uid::from_raw(creds.uid))
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| creds.uid.to_string());

        Some(ProcessInfo {
            unique_id: UniqueId::new(pid, stat.start_time),
            name,
            path,
            // Kernel threads, init and session-less processes belong to the OS
            protected: command_line.is_empty() || pid == 1 || stat.session == 0,
            command_line,
            session: Session {
                id: stat.session,
                uid: creds.uid,
                gid: creds.gid,
            },
            user,
        })
    }

    /// Returns true if the process named by `id` is still alive
    fn alive(&self, id: UniqueId) -> bool {
        self.proc
            .stat(id.pid)
            .is_ok_and(|stat| stat.start_time == id.created && !stat.is_zombie())
    }
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new()
    }
}

fn exit_status(status: std::process::ExitStatus) -> ExitStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitStatus::with_code(code),
        (None, Some(sig)) => ExitStatus::signaled(sig),
        (None, None) => ExitStatus::unknown(),
    }
}

#[async_trait]
impl ProcessHost for LinuxHost {
    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    async fn scan(&self, filter: &NameFilter<'_>) -> HostResult<Vec<ProcessInfo>> {
        let mut found = Vec::new();
        for pid in self.proc.pids()? {
            let Ok(command_line) = self.proc.cmdline(pid) else {
                continue;
            };
            let Ok(stat) = self.proc.stat(pid) else {
                continue;
            };
            let name = match command_line.first() {
                Some(arg0) => program_name(arg0),
                None => stat.comm.as_str(),
            };
            if !filter(name) {
                continue;
            }
            if let Some(info) = self.describe_with(pid, stat, command_line) {
                found.push(info);
            }
        }
        Ok(found)
    }

    async fn open(&self, info: &ProcessInfo, passive: bool) -> HostResult<ProcessHandle> {
        if !self.alive(info.unique_id) {
            return Err(HostError::NotFound(info.pid()));
        }

        // A null signal checks permission without delivering anything
        match signal::kill(Pid::from_raw(info.pid() as i32), None) {
            Ok(()) => Ok(ProcessHandle::new(info.clone(), Access::Full)),
            Err(Errno::EPERM) if passive => {
                debug!(pid = info.pid(), "Opening process passively");
                Ok(ProcessHandle::new(info.clone(), Access::Passive))
            }
            Err(Errno::EPERM) => Err(HostError::PermissionDenied(format!("process {}", info.pid()))),
            Err(Errno::ESRCH) => Err(HostError::NotFound(info.pid())),
            Err(e) => Err(HostError::Internal(format!("probe of process {} failed: {}", info.pid(), e))),
        }
    }

    async fn terminate(&self, handle: &ProcessHandle) -> HostResult<()> {
        if !handle.can_terminate() {
            return Err(HostError::PermissionDenied(format!(
                "process {} was opened passively",
                handle.pid()
            )));
        }
        // The pid may have been recycled since the handle was opened
        if !self.alive(handle.unique_id()) {
            return Ok(());
        }

        match signal::kill(Pid::from_raw(handle.pid() as i32), Signal::SIGKILL) {
            Ok(()) => {
                debug!(pid = handle.pid(), "Sent SIGKILL");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(HostError::TerminateFailed(format!(
                "Failed to send SIGKILL to {}: {}",
                handle.pid(),
                e
            ))),
        }
    }

    async fn spawn_in_session(&self, session: &Session, command_line: &[String]) -> HostResult<u32> {
        let Some((program, args)) = command_line.split_first() else {
            return Err(HostError::SpawnFailed("Empty command line".into()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Only root may start programs for another user
        if Uid::effective().is_root() && session.uid != 0 {
            cmd.uid(session.uid).gid(session.gid);
        }

        let child = cmd
            .spawn()
            .map_err(|e| HostError::SpawnFailed(format!("Failed to spawn {}: {}", program, e)))?;
        let pid = child.id();
        info!(pid, program = %program, session = session.id, uid = session.uid, "Spawned process");

        self.children.lock().unwrap().insert(pid, child);
        Ok(pid)
    }

    async fn wait_exit(&self, handle: &ProcessHandle) -> HostResult<ExitStatus> {
        let id = handle.unique_id();
        loop {
            {
                let mut children = self.children.lock().unwrap();
                if let Some(child) = children.get_mut(&id.pid) {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            children.remove(&id.pid);
                            return Ok(exit_status(status));
                        }
                        Ok(None) => {}
                        Err(e) => return Err(HostError::Internal(format!("Wait failed: {}", e))),
                    }
                } else if !self.alive(id) {
                    return Ok(ExitStatus::unknown());
                }
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procfs::test_support::fake_process;

    #[tokio::test]
    async fn scan_reads_matching_processes() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), 2, "kthreadd", &[], 0, 1, 0);
        fake_process(dir.path(), 10, "app", &["/opt/app/app", "--big"], 3, 500, 0);
        fake_process(dir.path(), 11, "bash", &["-bash"], 3, 501, 0);

        let host = LinuxHost::with_procfs(ProcFs::new(dir.path())).with_hostname("H1");
        assert_eq!(host.hostname(), "H1");

        let found = host.scan(&|name: &str| name == "app" || name == "kthreadd").await.unwrap();
        assert_eq!(found.len(), 2);

        let kthreadd = &found[0];
        assert!(kthreadd.protected);
        assert_eq!(kthreadd.name, "kthreadd");

        let app = &found[1];
        assert!(!app.protected);
        assert_eq!(app.unique_id, UniqueId::new(10, 500));
        assert_eq!(app.path, "/opt/app/app");
        assert_eq!(app.command_line, ["/opt/app/app", "--big"]);
        assert_eq!(app.session.id, 3);
    }

    #[tokio::test]
    async fn spawned_child_is_terminated_and_reaped() {
        let host = LinuxHost::new();
        let session = Session {
            id: 0,
            uid: Uid::current().as_raw(),
            gid: nix::unistd::Gid::current().as_raw(),
        };

        let pid = host
            .spawn_in_session(&session, &["sleep".to_string(), "30".to_string()])
            .await
            .unwrap();
        let info = host.describe(pid).unwrap();
        let handle = host.open(&info, false).await.unwrap();

        host.terminate(&handle).await.unwrap();
        let status = host.wait_exit(&handle).await.unwrap();
        assert_eq!(status, ExitStatus::signaled(9));
    }

    #[tokio::test]
    async fn empty_command_line_is_rejected() {
        let host = LinuxHost::new();
        let err = host.spawn_in_session(&Session::default(), &[]).await.unwrap_err();
        assert!(matches!(err, HostError::SpawnFailed(_)));
    }
}
