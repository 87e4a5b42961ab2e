//! Enforcement service
//!
//! Runs two loops until shutdown: one keeps the policy set current, the
//! other applies it to the host's processes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::invocation::stopped;
use crate::{Orchestrator, PolicyManager};

/// Default time between enforcement passes
pub const DEFAULT_ENFORCE_INTERVAL: Duration = Duration::from_secs(1);

/// Default time between policy retrievals
pub const DEFAULT_POLICY_INTERVAL: Duration = Duration::from_secs(60);

/// Policy retrieval retry until the first retrieval succeeds
pub const STARTUP_POLICY_RETRY: Duration = Duration::from_secs(5);

const MINIMUM_ENFORCE_INTERVAL: Duration = Duration::from_millis(100);

pub struct Enforcer {
    policies: Arc<PolicyManager>,
    orchestrator: Arc<Orchestrator>,
    policy_interval: Duration,
    enforce_interval: Duration,
}

impl Enforcer {
    pub fn new(policies: Arc<PolicyManager>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            policies,
            orchestrator,
            policy_interval: DEFAULT_POLICY_INTERVAL,
            enforce_interval: DEFAULT_ENFORCE_INTERVAL,
        }
    }

    pub fn with_policy_interval(mut self, interval: Duration) -> Self {
        self.policy_interval = interval;
        self
    }

    pub fn with_enforce_interval(mut self, interval: Duration) -> Self {
        self.enforce_interval = interval.max(MINIMUM_ENFORCE_INTERVAL);
        self
    }

    pub fn policies(&self) -> &Arc<PolicyManager> {
        &self.policies
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Enforce policies until `shutdown` resolves, then stop supervising
    /// every process.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        self.policies.load_cache();

        // Try to pull policies before enforcement begins
        let started = tokio::select! {
            result = self.policies.update() => result.is_ok(),
            _ = &mut shutdown => {
                info!("Shutdown requested before enforcement began");
                return;
            }
        };
        info!(
            host = %self.orchestrator.hostname(),
            policies = self.policies.policies().len(),
            started,
            "Enforcement running"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let refresh = tokio::spawn(refresh_policies(
            self.policies.clone(),
            self.policy_interval,
            started,
            stop_rx.clone(),
        ));
        let enforce = tokio::spawn(enforce(
            self.policies.clone(),
            self.orchestrator.clone(),
            self.enforce_interval,
            stop_rx,
        ));

        shutdown.await;
        info!("Stopping enforcement");

        let _ = stop_tx.send(true);
        let _ = refresh.await;
        let _ = enforce.await;

        debug!("Stopping process management");
        self.orchestrator.stop().await;
        info!("Enforcement stopped");
    }
}

async fn refresh_policies(
    policies: Arc<PolicyManager>,
    interval: Duration,
    mut started: bool,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let wait = if started { interval } else { STARTUP_POLICY_RETRY };
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = tokio::time::sleep(wait) => {}
        }
        tokio::select! {
            _ = stopped(&mut stop) => break,
            result = policies.update() => started |= result.is_ok(),
        }
    }
    debug!("Stopped policy manager");
}

async fn enforce(
    policies: Arc<PolicyManager>,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = timer.tick() => {
                if let Err(e) = orchestrator.enforce(&policies.policies()).await {
                    warn!(error = %e, "Enforcement failed");
                }
            }
        }
    }
    debug!("Stopped enforcement loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InvocationContext;
    use crate::invocation::test_support::{Reply, ScriptedBroker};
    use crate::policies::test_support::FixedPolicies;
    use tokio::sync::oneshot;
    use warden_api::Strategy;
    use warden_config::{Comparison, Criterion, Policy, PolicyCache, PolicySet};
    use warden_host_api::{MockHost, PROP_PROGRAM_NAME};

    fn policies() -> PolicySet {
        PolicySet::from(vec![Policy::new(
            "app",
            Strategy::Instance,
            1,
            Duration::from_secs(60),
            vec![Criterion::new(PROP_PROGRAM_NAME, Comparison::Exact, "app")],
        )])
    }

    async fn managed_eventually(orchestrator: &Orchestrator, count: usize) -> bool {
        for _ in 0..100 {
            if orchestrator.managed().await.len() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn enforces_until_shutdown() {
        let host = Arc::new(MockHost::new("H1"));
        host.launch("app", "alice");
        let broker = ScriptedBroker::new(vec![Reply::Active]);

        let manager = Arc::new(PolicyManager::new(FixedPolicies::new(policies()), None));
        let orchestrator = Arc::new(Orchestrator::new(
            InvocationContext::new(broker.clone(), host.clone()),
            "H1",
            false,
        ));
        let enforcer = Enforcer::new(manager, orchestrator.clone()).with_enforce_interval(Duration::from_millis(100));

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(enforcer.run(async move {
            let _ = rx.await;
        }));

        assert!(managed_eventually(&orchestrator, 1).await);

        tx.send(()).unwrap();
        task.await.unwrap();

        assert_eq!(orchestrator.invocation_count().await, 0);
        assert_eq!(broker.releases.lock().unwrap().len(), 1);
        assert_eq!(host.running("app").len(), 1);
    }

    #[tokio::test]
    async fn cached_policies_apply_while_broker_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PolicyCache::new(dir.path().join("policies.json"));
        cache.store(&policies()).unwrap();

        let host = Arc::new(MockHost::new("H1"));
        host.launch("app", "alice");

        let unreachable = Arc::new(FixedPolicies::default());
        let manager = Arc::new(PolicyManager::new(unreachable, Some(cache)));
        let orchestrator = Arc::new(Orchestrator::new(
            InvocationContext::new(ScriptedBroker::new(vec![Reply::Active]), host.clone()),
            "H1",
            false,
        ));
        let enforcer = Enforcer::new(manager.clone(), orchestrator.clone())
            .with_enforce_interval(Duration::from_millis(100));

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(enforcer.run(async move {
            let _ = rx.await;
        }));

        assert!(managed_eventually(&orchestrator, 1).await);
        assert_eq!(manager.policies().len(), 1);

        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
