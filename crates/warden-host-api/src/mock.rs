//! Mock process host for testing

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::watch;

use crate::{
    Access, ExitStatus, HostError, HostResult, NameFilter, ProcessHandle, ProcessHost, ProcessInfo,
    Session, UniqueId,
};

const SIGKILL: i32 = 9;

struct MockProcess {
    info: ProcessInfo,
    exit: watch::Sender<Option<ExitStatus>>,
}

impl MockProcess {
    fn running(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

/// In-memory process table for unit and integration testing
pub struct MockHost {
    hostname: String,
    next_pid: AtomicU32,
    next_created: AtomicU64,
    processes: Mutex<HashMap<u32, MockProcess>>,
    denied: Mutex<HashSet<u32>>,
    terminated: Mutex<Vec<UniqueId>>,
    spawned: Mutex<Vec<Vec<String>>>,

    /// Configure spawn to fail
    pub fail_spawn: AtomicBool,
}

impl MockHost {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            next_pid: AtomicU32::new(100),
            next_created: AtomicU64::new(1),
            processes: Mutex::new(HashMap::new()),
            denied: Mutex::new(HashSet::new()),
            terminated: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            fail_spawn: AtomicBool::new(false),
        }
    }

    /// Simulate a user starting `name`
    pub fn launch(&self, name: &str, user: &str) -> ProcessInfo {
        let session = Session {
            id: 1,
            uid: 1000,
            gid: 1000,
        };
        self.insert(vec![format!("/usr/bin/{}", name)], session, user, false)
    }

    /// Simulate an OS process the host reports as protected
    pub fn launch_protected(&self, name: &str) -> ProcessInfo {
        self.insert(vec![format!("/sbin/{}", name)], Session::default(), "root", true)
    }

    fn insert(&self, command_line: Vec<String>, session: Session, user: &str, protected: bool) -> ProcessInfo {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let created = self.next_created.fetch_add(1, Ordering::SeqCst);
        let path = command_line.first().cloned().unwrap_or_default();
        let name = path.rsplit('/').next().unwrap_or_default().to_string();

        let info = ProcessInfo {
            unique_id: UniqueId::new(pid, created),
            name,
            path,
            command_line,
            session,
            user: user.to_string(),
            protected,
        };

        let (exit, _) = watch::channel(None);
        self.processes.lock().unwrap().insert(
            pid,
            MockProcess {
                info: info.clone(),
                exit,
            },
        );
        info
    }

    /// Simulate the process exiting on its own
    pub fn exit(&self, pid: u32, status: ExitStatus) {
        if let Some(process) = self.processes.lock().unwrap().get(&pid) {
            process.exit.send_replace(Some(status));
        }
    }

    /// Simulate the host losing track of `pid`. Anyone waiting on it gets
    /// an error instead of an exit status.
    pub fn lose(&self, pid: u32) {
        self.processes.lock().unwrap().remove(&pid);
    }

    /// Make every attempt to open `pid` fail
    pub fn deny_open(&self, pid: u32) {
        self.denied.lock().unwrap().insert(pid);
    }

    /// Running processes with the given program name
    pub fn running(&self, name: &str) -> Vec<ProcessInfo> {
        let mut running: Vec<_> = self
            .processes
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.running() && p.info.name == name)
            .map(|p| p.info.clone())
            .collect();
        running.sort_by_key(|p| p.unique_id);
        running
    }

    /// Processes killed through `terminate`, in order
    pub fn terminated(&self) -> Vec<UniqueId> {
        self.terminated.lock().unwrap().clone()
    }

    /// Command lines started through `spawn_in_session`, in order
    pub fn spawned(&self) -> Vec<Vec<String>> {
        self.spawned.lock().unwrap().clone()
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl ProcessHost for MockHost {
    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    async fn scan(&self, filter: &NameFilter<'_>) -> HostResult<Vec<ProcessInfo>> {
        let mut found: Vec<_> = self
            .processes
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.running() && filter(&p.info.name))
            .map(|p| p.info.clone())
            .collect();
        found.sort_by_key(|p| p.unique_id);
        Ok(found)
    }

    async fn open(&self, info: &ProcessInfo, passive: bool) -> HostResult<ProcessHandle> {
        if self.denied.lock().unwrap().contains(&info.pid()) {
            return Err(HostError::PermissionDenied(format!("process {}", info.pid())));
        }

        let processes = self.processes.lock().unwrap();
        match processes.get(&info.pid()) {
            Some(p) if p.running() && p.info.unique_id == info.unique_id => {
                let access = if passive { Access::Passive } else { Access::Full };
                Ok(ProcessHandle::new(p.info.clone(), access))
            }
            _ => Err(HostError::NotFound(info.pid())),
        }
    }

    async fn terminate(&self, handle: &ProcessHandle) -> HostResult<()> {
        if !handle.can_terminate() {
            return Err(HostError::PermissionDenied(format!(
                "process {} was opened passively",
                handle.pid()
            )));
        }

        let processes = self.processes.lock().unwrap();
        match processes.get(&handle.pid()) {
            Some(p) if p.info.unique_id == handle.unique_id() => {
                p.exit.send_replace(Some(ExitStatus::signaled(SIGKILL)));
                self.terminated.lock().unwrap().push(handle.unique_id());
                Ok(())
            }
            _ => Err(HostError::NotFound(handle.pid())),
        }
    }

    async fn spawn_in_session(&self, session: &Session, command_line: &[String]) -> HostResult<u32> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(HostError::SpawnFailed("mock spawn failure".into()));
        }
        if command_line.is_empty() {
            return Err(HostError::SpawnFailed("empty command line".into()));
        }

        let user = self
            .processes
            .lock()
            .unwrap()
            .values()
            .find(|p| p.info.session == *session)
            .map(|p| p.info.user.clone())
            .unwrap_or_default();

        self.spawned.lock().unwrap().push(command_line.to_vec());
        let info = self.insert(command_line.to_vec(), session.clone(), &user, false);
        Ok(info.pid())
    }

    async fn wait_exit(&self, handle: &ProcessHandle) -> HostResult<ExitStatus> {
        let rx = {
            let processes = self.processes.lock().unwrap();
            match processes.get(&handle.pid()) {
                Some(p) if p.info.unique_id == handle.unique_id() => p.exit.subscribe(),
                _ => return Ok(ExitStatus::unknown()),
            }
        };

        let mut rx = rx;
        let status = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| HostError::Internal(format!("process {} is no longer tracked", handle.pid())))?;
        Ok(status.clone().unwrap_or_else(ExitStatus::unknown))
    }
}
