//! Invocation state machine
//!
//! An invocation is a user's intent to run one program. It supervises the
//! program's process while a lease maintainer keeps the program's lease,
//! terminating the process when the lease is lost and starting it again
//! when the lease is regained. The replacement process is handed over by
//! the orchestrator once a scan observes it ("absorption").

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_api::{Instance, LeaseState, Status};
use warden_client::{LeaseService, Maintainer, should_warn};
use warden_host_api::{ProcessHandle, ProcessHost, Session};
use warden_util::{Clock, SystemClock, duration_until, format_duration, round_to_secs};

/// How long either side of an absorption waits for the other
pub const ABSORB_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval of an invocation's lease maintainer
pub const INVOCATION_RETRY: Duration = Duration::from_secs(5);

struct AbsorptionRequest {
    handle: ProcessHandle,
    reply: oneshot::Sender<bool>,
}

/// Everything an invocation needs to supervise a process
#[derive(Clone)]
pub struct InvocationContext {
    pub service: Arc<dyn LeaseService>,
    pub host: Arc<dyn ProcessHost>,
    pub clock: Arc<dyn Clock>,
    pub retry: Duration,
}

impl InvocationContext {
    pub fn new(service: Arc<dyn LeaseService>, host: Arc<dyn ProcessHost>) -> Self {
        Self {
            service,
            host,
            clock: Arc::new(SystemClock),
            retry: INVOCATION_RETRY,
        }
    }
}

/// A supervised program
pub struct Invocation {
    instance: Instance,
    name: String,
    absorption: Mutex<Option<mpsc::Sender<AbsorptionRequest>>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    state: Arc<Mutex<Option<LeaseState>>>,
    orphaned: Arc<AtomicBool>,
}

impl Invocation {
    /// Begin supervising the opened process
    pub fn start(ctx: InvocationContext, instance: Instance, process: ProcessHandle) -> Self {
        let (absorb_tx, absorb_rx) = mpsc::channel(1);
        let (stop, stop_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(None));
        let orphaned = Arc::new(AtomicBool::new(false));
        let info = process.info().clone();

        let worker = Worker {
            ctx,
            instance: instance.clone(),
            name: info.name.clone(),
            session: info.session.clone(),
            command_line: info.command_line.clone(),
            state: state.clone(),
            orphaned: orphaned.clone(),
            last_warning: None,
            absorption: absorb_rx,
            stop: stop_rx,
        };
        let task = tokio::spawn(worker.run(process));

        Self {
            instance,
            name: info.name,
            absorption: Mutex::new(Some(absorb_tx)),
            stop,
            task: Mutex::new(Some(task)),
            state,
            orphaned,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The most recent lease state reported to the invocation
    pub fn lease_state(&self) -> Option<LeaseState> {
        self.state.lock().unwrap().clone()
    }

    /// Offer a newly observed process to the invocation. Returns true if
    /// the invocation took ownership of it.
    pub async fn absorb(&self, handle: ProcessHandle) -> bool {
        let Some(tx) = self.absorption.lock().unwrap().clone() else {
            return false;
        };

        let (reply, result) = oneshot::channel();
        let request = AbsorptionRequest { handle, reply };
        if tx.send_timeout(request, ABSORB_TIMEOUT).await.is_err() {
            return false;
        }
        matches!(tokio::time::timeout(ABSORB_TIMEOUT, result).await, Ok(Ok(true)))
    }

    /// Returns true if the invocation has ceased supervision. An
    /// invocation that lost sight of its process is done but keeps its
    /// lease until stopped.
    pub fn is_done(&self) -> bool {
        self.orphaned.load(Ordering::SeqCst)
            || self.task.lock().unwrap().as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop supervising without killing the process. The lease is released.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(instance = %self.instance, error = %e, "Invocation task failed");
            }
        }
        self.absorption.lock().unwrap().take();
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

enum Phase {
    /// Supervising a running process
    Managing(ProcessHandle),
    /// The process is gone; waiting for permission to start it again
    Waiting,
}

/// What follows the managing state
enum Next {
    Wait,
    Exit,
    /// The process can no longer be observed
    Orphaned,
}

enum Absorption {
    Absorbed(ProcessHandle),
    TimedOut,
    Cancelled,
}

struct Worker {
    ctx: InvocationContext,
    instance: Instance,
    name: String,
    session: Session,
    command_line: Vec<String>,
    state: Arc<Mutex<Option<LeaseState>>>,
    orphaned: Arc<AtomicBool>,
    last_warning: Option<DateTime<Utc>>,
    absorption: mpsc::Receiver<AbsorptionRequest>,
    stop: watch::Receiver<bool>,
}

pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Title-case status for log lines
fn status_title(status: Status) -> &'static str {
    match status {
        Status::Queued => "Queued",
        Status::Active => "Active",
        Status::Released => "Released",
    }
}

impl Worker {
    fn log(&self, msg: impl AsRef<str>) {
        info!(instance = %self.instance.id, process = %self.name, "{}", msg.as_ref());
    }

    async fn run(mut self, process: ProcessHandle) {
        let props = process.info().properties(&self.instance.host);
        let maintainer = Maintainer::with_clock(
            self.ctx.service.clone(),
            self.instance.clone(),
            props,
            self.ctx.retry,
            self.ctx.clock.clone(),
        );
        let mut states = maintainer.listen(1);
        if let Err(e) = maintainer.start() {
            self.log(format!("Unable to start lease maintainer: {}", e));
            return;
        }

        self.log(format!("Managing process {}", process.pid()));

        let mut phase = Phase::Managing(process);
        loop {
            phase = match phase {
                Phase::Managing(process) => match self.maintain(&mut states, &process).await {
                    Next::Wait => Phase::Waiting,
                    Next::Exit => break,
                    Next::Orphaned => {
                        self.orphaned.store(true, Ordering::SeqCst);
                        self.absorption.close();
                        self.linger(&mut states).await;
                        break;
                    }
                },
                Phase::Waiting => {
                    let Some(pid) = self.wait_for_acquisition(&mut states).await else {
                        break;
                    };
                    match self.wait_for_absorption(pid).await {
                        Absorption::Absorbed(process) => Phase::Managing(process),
                        Absorption::TimedOut => Phase::Waiting,
                        Absorption::Cancelled => break,
                    }
                }
            };
        }

        drop(states);
        maintainer.close().await;
        self.absorption.close();
    }

    /// Supervise a running process until it exits or supervision ends
    async fn maintain(&mut self, states: &mut mpsc::Receiver<LeaseState>, process: &ProcessHandle) -> Next {
        let host = self.ctx.host.clone();
        let exited = host.wait_exit(process);
        tokio::pin!(exited);

        let pid = process.pid();
        let mut term_pending = false;
        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => {
                    self.log("Ceasing management");
                    return Next::Exit;
                }
                Some(req) = self.absorption.recv() => {
                    let _ = req.reply.send(false);
                }
                result = &mut exited => {
                    return match result {
                        Ok(_) if term_pending => Next::Wait,
                        Ok(_) => {
                            self.log("Exited");
                            Next::Exit
                        }
                        Err(e) => {
                            self.log(format!("Observation failed: {}", e));
                            Next::Orphaned
                        }
                    };
                }
                state = states.recv() => {
                    let Some(state) = state else {
                        self.log("Lease maintainer closed");
                        return Next::Exit;
                    };

                    let now = self.ctx.clock.now();
                    self.record_state(&state, now);

                    let terminate = match state.held() {
                        Some(lease) => lease.status != Status::Active || lease.expired(now),
                        None if state.lease_not_required => return Next::Exit,
                        None => !state.online,
                    };

                    if terminate && !term_pending {
                        self.log(format!("Terminating process {}", pid));
                        match host.terminate(process).await {
                            Ok(()) => {
                                term_pending = true;
                                self.log(format!("Terminated process {}", pid));
                            }
                            Err(e) => self.log(format!("Termination of process {} failed: {}", pid, e)),
                        }
                    }
                }
            }
        }
    }

    /// Keep the lease until supervision is stopped
    async fn linger(&mut self, states: &mut mpsc::Receiver<LeaseState>) {
        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => {
                    self.log("Ceasing management");
                    return;
                }
                state = states.recv() => {
                    let Some(state) = state else {
                        self.log("Lease maintainer closed");
                        return;
                    };
                    let now = self.ctx.clock.now();
                    self.record_state(&state, now);
                }
            }
        }
    }

    /// Wait for permission to run the program, then start it
    async fn wait_for_acquisition(&mut self, states: &mut mpsc::Receiver<LeaseState>) -> Option<u32> {
        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => {
                    self.log("Ceasing management");
                    return None;
                }
                Some(req) = self.absorption.recv() => {
                    let _ = req.reply.send(false);
                }
                state = states.recv() => {
                    let Some(state) = state else {
                        self.log("Lease maintainer closed");
                        return None;
                    };

                    let now = self.ctx.clock.now();
                    self.record_state(&state, now);

                    let start = match state.held() {
                        Some(lease) => lease.status == Status::Active && !lease.expired(now),
                        None => state.lease_not_required,
                    };
                    if start {
                        return self.spawn().await;
                    }
                }
            }
        }
    }

    async fn spawn(&self) -> Option<u32> {
        self.log("Starting new process");
        match self.ctx.host.spawn_in_session(&self.session, &self.command_line).await {
            Ok(pid) => {
                self.log(format!("Started process {}", pid));
                Some(pid)
            }
            Err(e) => {
                self.log(format!("Failed to start: {}", e));
                None
            }
        }
    }

    /// Wait for the orchestrator to hand over the started process.
    /// Lease reports are not consumed meanwhile.
    async fn wait_for_absorption(&mut self, pid: u32) -> Absorption {
        let deadline = tokio::time::sleep(ABSORB_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = stopped(&mut self.stop) => {
                    self.log("Ceasing management");
                    return Absorption::Cancelled;
                }
                Some(req) = self.absorption.recv() => {
                    if req.handle.pid() != pid {
                        let _ = req.reply.send(false);
                        continue;
                    }
                    self.log(format!("Absorbing process {}", pid));
                    let _ = req.reply.send(true);
                    return Absorption::Absorbed(req.handle);
                }
                _ = &mut deadline => {
                    self.log(format!("Failed to absorb process {}", pid));
                    return Absorption::TimedOut;
                }
            }
        }
    }

    fn record_state(&mut self, state: &LeaseState, now: DateTime<Utc>) {
        let old = self.state.lock().unwrap().replace(state.clone());

        let was_online = old.is_some_and(|s| s.online);
        if state.online != was_online {
            self.log(if state.online { "Online" } else { "Offline" });
        }

        let Some(lease) = state.held() else {
            if state.lease_not_required {
                self.log("Lease Not Required");
            } else if !state.online {
                self.log("Lease Acquisition Failed");
            }
            return;
        };

        if lease.expired(now) {
            self.log("Lease Expired");
            return;
        }

        let remaining = duration_until(now, lease.expiration());
        if !state.online && should_warn(lease, now, self.last_warning) {
            warn!(
                instance = %self.instance.id,
                process = %self.name,
                remaining = %format_duration(round_to_secs(remaining)),
                "Lease renewal failed while offline"
            );
            self.last_warning = Some(now);
        }

        let status = status_title(lease.status);
        let elapsed = lease.duration.saturating_sub(remaining);
        if elapsed < Duration::from_secs(1) {
            self.log(format!(
                "{} ({}, {})",
                status,
                lease.resource(),
                format_duration(lease.duration)
            ));
        } else {
            self.log(format!(
                "{} ({}, {} / {})",
                status,
                lease.resource(),
                format_duration(round_to_secs(remaining)),
                format_duration(lease.duration)
            ));
        }
        debug!(instance = %self.instance.id, status = %lease.status, "Recorded lease state");
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use warden_host_api::{ExitStatus, MockHost};

    async fn eventually(mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn invocation(broker: Arc<ScriptedBroker>, host: Arc<MockHost>) -> (Invocation, ProcessHandle) {
        let info = host.launch("app", "alice");
        let handle = host.open(&info, false).await.unwrap();
        let instance = Instance::new("H1", "alice", "I1");
        let ctx = InvocationContext::new(broker, host);
        (Invocation::start(ctx, instance, handle.clone()), handle)
    }

    #[tokio::test]
    async fn active_lease_keeps_process_running() {
        let host = Arc::new(MockHost::new("H1"));
        let broker = ScriptedBroker::new(vec![Reply::Active]);
        let (inv, _) = invocation(broker.clone(), host.clone()).await;

        assert!(eventually(|| inv.lease_state().is_some()).await);
        assert!(host.terminated().is_empty());
        assert!(!inv.is_done());

        // Stopping never kills the process but does release the lease
        inv.stop().await;
        assert!(inv.is_done());
        assert!(host.terminated().is_empty());
        assert_eq!(host.running("app").len(), 1);
        assert_eq!(broker.releases.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queued_lease_terminates_process() {
        let host = Arc::new(MockHost::new("H1"));
        let broker = ScriptedBroker::new(vec![Reply::Queued]);
        let (inv, handle) = invocation(broker, host.clone()).await;

        assert!(eventually(|| !host.terminated().is_empty()).await);
        assert_eq!(host.terminated(), vec![handle.unique_id()]);
        assert!(!inv.is_done());
        inv.stop().await;
    }

    #[tokio::test]
    async fn stale_lease_terminates_process() {
        let host = Arc::new(MockHost::new("H1"));
        let broker = ScriptedBroker::new(vec![Reply::Stale]);
        let (inv, _) = invocation(broker, host.clone()).await;

        assert!(eventually(|| host.terminated().len() == 1).await);
        inv.stop().await;
    }

    #[tokio::test]
    async fn offline_without_lease_terminates_process() {
        let host = Arc::new(MockHost::new("H1"));
        let broker = ScriptedBroker::new(vec![Reply::Offline]);
        let (inv, _) = invocation(broker, host.clone()).await;

        assert!(eventually(|| host.terminated().len() == 1).await);
        inv.stop().await;
    }

    #[tokio::test]
    async fn lease_not_required_ends_supervision() {
        let host = Arc::new(MockHost::new("H1"));
        let broker = ScriptedBroker::new(vec![Reply::NotRequired]);
        let (inv, _) = invocation(broker, host.clone()).await;

        assert!(eventually(|| inv.is_done()).await);
        assert!(host.terminated().is_empty());
    }

    #[tokio::test]
    async fn voluntary_exit_ends_supervision() {
        let host = Arc::new(MockHost::new("H1"));
        let broker = ScriptedBroker::new(vec![Reply::Active]);
        let (inv, handle) = invocation(broker.clone(), host.clone()).await;

        assert!(eventually(|| inv.lease_state().is_some()).await);
        host.exit(handle.pid(), ExitStatus::with_code(0));

        assert!(eventually(|| inv.is_done()).await);
        assert!(eventually(|| broker.releases.lock().unwrap().len() == 1).await);
    }

    #[tokio::test]
    async fn lost_process_keeps_lease_until_stopped() {
        let host = Arc::new(MockHost::new("H1"));
        let broker = ScriptedBroker::new(vec![Reply::Active]);
        let (inv, handle) = invocation(broker.clone(), host.clone()).await;

        assert!(eventually(|| inv.lease_state().is_some()).await);
        host.lose(handle.pid());

        assert!(eventually(|| inv.is_done()).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(broker.releases.lock().unwrap().is_empty());
        assert!(host.terminated().is_empty());

        // A done invocation takes no more processes
        let other = host.launch("app", "alice");
        let other = host.open(&other, false).await.unwrap();
        assert!(!inv.absorb(other).await);

        inv.stop().await;
        assert_eq!(broker.releases.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn absorption_is_refused_while_managing() {
        let host = Arc::new(MockHost::new("H1"));
        let broker = ScriptedBroker::new(vec![Reply::Active]);
        let (inv, _) = invocation(broker, host.clone()).await;

        let other = host.launch("app", "alice");
        let other = host.open(&other, false).await.unwrap();
        assert!(!inv.absorb(other).await);

        inv.stop().await;
        let late = host.launch("app", "alice");
        let late = host.open(&late, false).await.unwrap();
        assert!(!inv.absorb(late).await);
    }
}
