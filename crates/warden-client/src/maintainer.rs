//! Lease maintainer
//!
//! A maintainer is a task that acquires a lease for one instance and keeps
//! renewing it until it is stopped. Every acquisition result is broadcast to
//! listeners as a `LeaseState`. Listeners that fall behind block the task.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_api::{Instance, LeaseRequest, LeaseState, MINIMUM_REFRESH, Properties, Status, Subject};
use warden_util::{Clock, SystemClock, duration_until, format_duration, sub_duration};

use crate::{ClientError, ClientResult, LeaseService};

/// Time reserved for a renewal to reach the broker before the lease expires
pub const TRANSPORT_ALLOWANCE: Duration = Duration::from_millis(800);

/// How long to wait before asking again after the broker said no lease is
/// required
pub const NOT_REQUIRED_RECHECK: Duration = Duration::from_secs(300);

/// The wait before the next acquisition attempt
pub fn next_interval(state: &LeaseState, now: DateTime<Utc>) -> Duration {
    let interval = match state.held() {
        None if state.lease_not_required => NOT_REQUIRED_RECHECK,
        None => state.retry,
        Some(lease) => {
            let mut interval = lease.effective_refresh();
            if !state.online {
                interval = interval.min(state.retry);
            }
            match lease.status {
                Status::Active => {
                    let deadline = sub_duration(lease.expiration(), TRANSPORT_ALLOWANCE);
                    interval = interval.min(duration_until(now, deadline));
                }
                Status::Queued => {
                    if let Some(decay) = state.leases.decay_duration(now) {
                        interval = interval.min(decay);
                    }
                }
                Status::Released => {}
            }
            interval
        }
    };
    interval.max(MINIMUM_REFRESH)
}

enum Worker {
    Idle,
    Running {
        stop: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

#[derive(Default)]
struct Inner {
    current: Option<LeaseState>,
    listeners: Vec<mpsc::Sender<LeaseState>>,
    closed: bool,
}

struct Shared {
    service: Arc<dyn LeaseService>,
    instance: Instance,
    properties: Properties,
    retry: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

/// Acquires and maintains one lease
pub struct Maintainer {
    shared: Arc<Shared>,
    worker: Mutex<Worker>,
}

impl Maintainer {
    /// Create a maintainer for `instance`. `properties` are sent with every
    /// request; `retry` is the wait between attempts while no lease is held.
    pub fn new(
        service: Arc<dyn LeaseService>,
        instance: Instance,
        properties: Properties,
        retry: Duration,
    ) -> Self {
        Self::with_clock(service, instance, properties, retry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        service: Arc<dyn LeaseService>,
        instance: Instance,
        properties: Properties,
        retry: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                service,
                instance,
                properties,
                retry: retry.max(MINIMUM_REFRESH),
                clock,
                inner: Mutex::new(Inner::default()),
            }),
            worker: Mutex::new(Worker::Idle),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.shared.instance
    }

    /// Spawn the maintenance task. The first attempt is made immediately.
    pub fn start(&self) -> ClientResult<()> {
        let mut worker = self.worker.lock().unwrap();
        match *worker {
            Worker::Idle => {}
            Worker::Running { .. } => return Err(ClientError::Started),
            Worker::Stopped => return Err(ClientError::Closed),
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(self.shared.clone(), stop_rx));
        *worker = Worker::Running { stop, handle };
        Ok(())
    }

    /// Receive every subsequent state. The most recent state, if any, is
    /// delivered first. The channel closes when the maintainer closes.
    pub fn listen(&self, buffer: usize) -> mpsc::Receiver<LeaseState> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.closed {
            return rx;
        }
        if let Some(current) = &inner.current {
            let _ = tx.try_send(current.clone());
        }
        inner.listeners.push(tx);
        rx
    }

    /// The most recent state
    pub fn current(&self) -> Option<LeaseState> {
        self.shared.inner.lock().unwrap().current.clone()
    }

    /// Stop the task, releasing any held lease, and close all listeners
    pub async fn stop(&self) {
        let worker = std::mem::replace(&mut *self.worker.lock().unwrap(), Worker::Stopped);
        if let Worker::Running { stop, handle } = worker {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                warn!(instance = %self.shared.instance, error = %e, "Lease maintainer task failed");
            }
        }
        self.shared.close_listeners();
    }

    pub async fn close(&self) {
        self.stop().await;
    }
}

impl Drop for Maintainer {
    fn drop(&mut self) {
        if let Ok(worker) = self.worker.get_mut() {
            if let Worker::Running { stop, .. } = worker {
                let _ = stop.send(true);
            }
        }
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut wait = Duration::ZERO;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stopped(&mut stop) => break,
        }

        let state = shared.acquire().await;
        wait = next_interval(&state, shared.clock.now());
        debug!(instance = %shared.instance, next = %format_duration(wait), "Next lease refresh scheduled");

        let listeners = shared.record(state.clone());
        tokio::select! {
            _ = broadcast(&listeners, state) => {}
            _ = stopped(&mut stop) => break,
        }
        shared.prune_listeners();
    }

    shared.release().await;
    shared.close_listeners();
}

async fn broadcast(listeners: &[mpsc::Sender<LeaseState>], state: LeaseState) {
    for listener in listeners {
        let _ = listener.send(state.clone()).await;
    }
}

impl Shared {
    async fn acquire(&self) -> LeaseState {
        let previous = self.inner.lock().unwrap().current.clone().unwrap_or_default();

        // Renewals name the subject the broker issued
        let subject = match previous.held() {
            Some(lease) => lease.subject.clone(),
            None => Subject::new("", self.instance.clone()),
        };
        let request = LeaseRequest::new(subject, self.properties.clone());

        match self.service.acquire(&request).await {
            Ok(Some(response)) => LeaseState {
                online: true,
                lease_not_required: false,
                acquired: true,
                lease: Some(response.lease),
                leases: response.leases,
                retry: self.retry,
                err: None,
            },
            Ok(None) => LeaseState {
                online: true,
                lease_not_required: true,
                retry: self.retry,
                ..Default::default()
            },
            Err(e) => {
                warn!(instance = %self.instance, error = %e, "Lease acquisition failed");
                LeaseState {
                    online: false,
                    retry: self.retry,
                    err: Some(e.to_string()),
                    ..previous
                }
            }
        }
    }

    /// Store a new state and return the listeners it must be sent to
    fn record(&self, state: LeaseState) -> Vec<mpsc::Sender<LeaseState>> {
        let mut inner = self.inner.lock().unwrap();
        inner.current = Some(state);
        inner.listeners.clone()
    }

    fn prune_listeners(&self) {
        self.inner.lock().unwrap().listeners.retain(|l| !l.is_closed());
    }

    async fn release(&self) {
        let subject = {
            let mut inner = self.inner.lock().unwrap();
            let subject = inner
                .current
                .as_ref()
                .and_then(|s| s.held())
                .map(|l| l.subject.clone());
            if let Some(current) = inner.current.as_mut() {
                current.online = false;
            }
            subject
        };

        let Some(subject) = subject else {
            return;
        };
        let request = LeaseRequest::new(subject, self.properties.clone());
        match self.service.release(&request).await {
            Ok(_) => info!(subject = %request.subject, "Lease released"),
            Err(e) => warn!(subject = %request.subject, error = %e, "Lease release failed"),
        }
    }

    fn close_listeners(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.clear();
        inner.closed = true;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use warden_api::{AcquireResponse, Lease, LeaseSet, Refresh, ReleaseResponse, Strategy};
    use warden_http::HttpError;

    pub fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    pub fn lease(status: Status, renewed: i64) -> Lease {
        Lease {
            subject: Subject::new("app", Instance::new("H1", "U1", "I1")),
            status,
            started: t(0),
            renewed: t(renewed),
            released: None,
            strategy: Strategy::Instance,
            limit: 1,
            duration: Duration::from_secs(60),
            decay: Duration::ZERO,
            refresh: Refresh::default(),
            properties: Properties::new(),
        }
    }

    pub enum Reply {
        Lease(Lease),
        NotRequired,
        Offline,
    }

    /// A lease service that answers from a script
    #[derive(Default)]
    pub struct ScriptedService {
        replies: Mutex<VecDeque<Reply>>,
        pub acquired: Mutex<Vec<LeaseRequest>>,
        pub released: Mutex<Vec<LeaseRequest>>,
    }

    impl ScriptedService {
        pub fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl LeaseService for ScriptedService {
        async fn acquire(&self, request: &LeaseRequest) -> ClientResult<Option<AcquireResponse>> {
            self.acquired.lock().unwrap().push(request.clone());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Offline);
            match reply {
                Reply::Lease(lease) => Ok(Some(AcquireResponse {
                    request: request.clone(),
                    leases: LeaseSet::from(vec![lease.clone()]),
                    lease,
                })),
                Reply::NotRequired => Ok(None),
                Reply::Offline => Err(ClientError::Http(HttpError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )))),
            }
        }

        async fn release(&self, request: &LeaseRequest) -> ClientResult<ReleaseResponse> {
            self.released.lock().unwrap().push(request.clone());
            Ok(ReleaseResponse {
                request: request.clone(),
                success: true,
            })
        }
    }
}
