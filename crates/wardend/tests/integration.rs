//! Integration tests for wardend
//!
//! The broker scenarios run the real HTTP server on an ephemeral port with
//! policies read from a directory, and talk to it through the enforcement
//! client. Time on the broker is driven by a manual clock.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use warden_api::{
    AcquireResponse, Instance, Lease, LeaseRequest, LeaseSet, Properties, Refresh, ReleaseResponse,
    Status, Strategy, Subject, Tx,
};
use warden_client::{Client, ClientError, ClientResult, LeaseService};
use warden_config::{CachedPolicies, Comparison, Criterion, DirectoryPolicies, Policy, PolicySet};
use warden_core::Broker;
use warden_enforcer::{Invocation, InvocationContext};
use warden_host_api::{MockHost, ProcessHost};
use warden_http::{ServerOptions, serve};
use warden_store::{LeaseStore, MemoryStore, StoreResult};
use warden_util::ManualClock;

struct TestBroker {
    client: Client,
    clock: Arc<ManualClock>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestBroker {
    async fn start(policies: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in policies {
            std::fs::write(dir.path().join(name), body).unwrap();
        }

        let source = Arc::new(CachedPolicies::new(DirectoryPolicies::new(dir.path())));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let broker = Arc::new(Broker::new(source, Arc::new(MemoryStore::new())).with_clock(clock.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stopped.await;
            };
            serve(listener, broker, ServerOptions::default(), shutdown).await.unwrap();
        });

        Self {
            client: Client::with_servers([addr.to_string()]),
            clock,
            stop: Some(stop),
            task,
            _dir: dir,
        }
    }

    async fn acquire(&self, host: &str, user: &str, id: &str) -> AcquireResponse {
        self.client
            .acquire(&request(host, user, id))
            .await
            .unwrap()
            .expect("a lease is required")
    }

    async fn release(&self, host: &str, user: &str, id: &str) -> ReleaseResponse {
        let mut req = request(host, user, id);
        req.subject.resource = "app".into();
        self.client.release(&req).await.unwrap()
    }

    async fn leases(&self) -> LeaseSet {
        let req = LeaseRequest::new(Subject::new("app", Instance::default()), Properties::new());
        self.client.leases(&req).await.unwrap().leases
    }

    fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap();
    }
}

fn request(host: &str, user: &str, id: &str) -> LeaseRequest {
    let mut properties = Properties::new();
    properties.insert("program.name".into(), "App.exe".into());
    LeaseRequest::new(Subject::new("", Instance::new(host, user, id)), properties)
}

fn app_policy(extra: &str) -> String {
    format!(
        r#"{{"resource":"app","criteria":[{{"key":"program.name","comparison":"ignorecase","value":"app.exe"}}],"limit":1,"duration":"1m"{}}}"#,
        extra
    )
}

// S1
#[tokio::test]
async fn test_acquire_and_release() {
    let policy = app_policy(r#","decay":"0s""#);
    let broker = TestBroker::start(&[("app.pol", &policy)]).await;

    let acquired = broker.acquire("H1", "U1", "I1").await;
    assert_eq!(acquired.lease.status, Status::Active);
    assert_eq!(acquired.lease.resource(), "app");
    assert_eq!(acquired.leases.len(), 1);

    let released = broker.release("H1", "U1", "I1").await;
    assert!(released.success);

    broker.advance(1);
    assert!(broker.leases().await.is_empty());

    broker.shutdown().await;
}

// S2
#[tokio::test]
async fn test_queue_and_promote() {
    let policy = app_policy(r#","decay":"30s""#);
    let broker = TestBroker::start(&[("app.pol", &policy)]).await;

    assert_eq!(broker.acquire("H1", "U1", "A").await.lease.status, Status::Active);
    broker.advance(1);
    assert_eq!(broker.acquire("H2", "U2", "B").await.lease.status, Status::Queued);

    broker.advance(1);
    assert!(broker.release("H1", "U1", "A").await.success);

    // The released lease holds the slot until it decays
    broker.advance(10);
    assert_eq!(broker.acquire("H2", "U2", "B").await.lease.status, Status::Queued);

    broker.advance(21);
    let promoted = broker.acquire("H2", "U2", "B").await;
    assert_eq!(promoted.lease.status, Status::Active);
    assert_eq!(promoted.leases.len(), 1);

    broker.shutdown().await;
}

// S3
#[tokio::test]
async fn test_consumer_strategy() {
    let policy = app_policy(r#","strategy":"consumer""#);
    let broker = TestBroker::start(&[("app.pol", &policy)]).await;

    assert_eq!(broker.acquire("H1", "U1", "I1").await.lease.status, Status::Active);
    assert_eq!(broker.acquire("H1", "U1", "I2").await.lease.status, Status::Active);

    let other = broker.acquire("H2", "U2", "I3").await;
    assert_eq!(other.lease.status, Status::Queued);
    assert_eq!(other.leases.len(), 3);

    broker.shutdown().await;
}

// S5
#[tokio::test]
async fn test_decay_replacement() {
    let policy = app_policy(r#","decay":"1m""#);
    let broker = TestBroker::start(&[("app.pol", &policy)]).await;

    assert_eq!(broker.acquire("H1", "U1", "I1").await.lease.status, Status::Active);
    broker.advance(1);
    assert!(broker.release("H1", "U1", "I1").await.success);

    broker.advance(5);
    let replacement = broker.acquire("H1", "U1", "I2").await;
    assert_eq!(replacement.lease.status, Status::Active);
    assert_eq!(replacement.leases.len(), 1);
    assert_eq!(replacement.leases.as_slice()[0].instance().id.as_str(), "I2");

    assert_eq!(broker.acquire("H2", "U2", "I3").await.lease.status, Status::Queued);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_request_needs_no_lease() {
    let policy = app_policy("");
    let broker = TestBroker::start(&[("app.pol", &policy)]).await;

    let mut req = request("H1", "U1", "I1");
    req.properties.insert("program.name".into(), "editor".into());
    assert!(broker.client.acquire(&req).await.unwrap().is_none());

    broker.shutdown().await;
}

/// Lets the first two views through together, so both see one revision
struct LockstepStore {
    inner: MemoryStore,
    barrier: Barrier,
    views: AtomicUsize,
    conflicts: AtomicUsize,
}

impl LeaseStore for LockstepStore {
    fn name(&self) -> String {
        "Lockstep".to_string()
    }

    fn resources(&self) -> StoreResult<Vec<String>> {
        self.inner.resources()
    }

    fn view(&self, resource: &str) -> StoreResult<(u64, LeaseSet)> {
        let view = self.inner.view(resource);
        if self.views.fetch_add(1, Ordering::SeqCst) < 2 {
            self.barrier.wait();
        }
        view
    }

    fn commit(&self, tx: &Tx) -> StoreResult<()> {
        let result = self.inner.commit(tx);
        if result.as_ref().is_err_and(|e| e.is_conflict()) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

// S4
#[test]
fn test_optimistic_lock_retry() {
    let policy = Policy::new(
        "app",
        Strategy::Instance,
        2,
        Duration::from_secs(60),
        vec![Criterion::new("program.name", Comparison::IgnoreCase, "app.exe")],
    );
    let store = Arc::new(LockstepStore {
        inner: MemoryStore::new(),
        barrier: Barrier::new(2),
        views: AtomicUsize::new(0),
        conflicts: AtomicUsize::new(0),
    });
    let broker = Broker::new(Arc::new(PolicySet::from(vec![policy])), store.clone());
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

    let statuses: Vec<Status> = std::thread::scope(|s| {
        let a = s.spawn(|| broker.acquire_at(request("H1", "U1", "I1"), now));
        let b = s.spawn(|| broker.acquire_at(request("H2", "U2", "I2"), now));
        [a, b]
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().lease().unwrap().status)
            .collect()
    });

    assert_eq!(statuses, [Status::Active, Status::Active]);
    assert_eq!(store.conflicts.load(Ordering::SeqCst), 1);
    assert_eq!(store.views.load(Ordering::SeqCst), 3);

    let (revision, leases) = store.inner.view("app").unwrap();
    assert_eq!(revision, 2);
    assert_eq!(leases.len(), 2);
    assert_eq!(leases, leases.iter().cloned().collect::<LeaseSet>());
}

/// A broker that grants short leases while reachable
struct FlakyBroker {
    online: AtomicBool,
    acquisitions: AtomicUsize,
    duration: Duration,
    released: Mutex<Vec<LeaseRequest>>,
}

#[async_trait]
impl LeaseService for FlakyBroker {
    async fn acquire(&self, request: &LeaseRequest) -> ClientResult<Option<AcquireResponse>> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(ClientError::NoEndpoints);
        }

        let now = Utc::now();
        let lease = Lease {
            subject: Subject::new("app", request.instance().clone()),
            status: Status::Active,
            started: now,
            renewed: now,
            released: None,
            strategy: Strategy::Instance,
            limit: 1,
            duration: self.duration,
            decay: Duration::ZERO,
            refresh: Refresh::default(),
            properties: request.properties.clone(),
        };
        Ok(Some(AcquireResponse {
            request: request.clone(),
            leases: LeaseSet::from(vec![lease.clone()]),
            lease,
        }))
    }

    async fn release(&self, request: &LeaseRequest) -> ClientResult<ReleaseResponse> {
        self.released.lock().unwrap().push(request.clone());
        Ok(ReleaseResponse {
            request: request.clone(),
            success: true,
        })
    }
}

async fn eventually(mut f: impl FnMut() -> bool, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    f()
}

// S6
#[tokio::test]
async fn test_offline_tolerance() {
    let broker = Arc::new(FlakyBroker {
        online: AtomicBool::new(true),
        acquisitions: AtomicUsize::new(0),
        duration: Duration::from_secs(3),
        released: Mutex::new(Vec::new()),
    });
    let host = Arc::new(MockHost::new("H1"));
    let app = host.launch("app", "U1");
    let handle = host.open(&app, false).await.unwrap();

    let mut ctx = InvocationContext::new(broker.clone(), host.clone());
    ctx.retry = Duration::from_secs(1);
    let inv = Invocation::start(ctx, Instance::new("H1", "U1", "I1"), handle);

    assert!(eventually(|| broker.acquisitions.load(Ordering::SeqCst) >= 1, Duration::from_secs(2)).await);
    broker.online.store(false, Ordering::SeqCst);

    // The held lease covers the outage until it expires
    assert!(eventually(|| inv.lease_state().is_some_and(|s| !s.online), Duration::from_secs(3)).await);
    assert!(host.terminated().is_empty());
    assert!(inv.lease_state().unwrap().held().is_some());

    assert!(eventually(|| host.terminated() == vec![app.unique_id], Duration::from_secs(5)).await);
    let state = inv.lease_state().unwrap();
    assert!(state.held().is_some_and(|lease| lease.expired(Utc::now())));

    // Reachable again: the program is started afresh
    broker.online.store(true, Ordering::SeqCst);
    assert!(eventually(|| host.spawned().len() == 1, Duration::from_secs(4)).await);
    assert_eq!(host.spawned()[0], app.command_line);

    inv.stop().await;
    assert!(inv.is_done());
    assert_eq!(broker.released.lock().unwrap().len(), 1);
}
