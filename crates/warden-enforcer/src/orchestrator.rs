//! Enforcement orchestrator

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use warden_api::Instance;
use warden_config::PolicySet;
use warden_host_api::{ProcessInfo, UniqueId};
use warden_util::RecentSet;

use crate::{EnforcerResult, Invocation, InvocationContext, blocklisted, process_instance, scan};

/// How long a process that could not be opened is left alone
pub const UNMANAGEABLE_TTL: Duration = Duration::from_secs(60);

struct Tables {
    managed: HashMap<UniqueId, Instance>,
    skipped: HashSet<UniqueId>,
    invocations: HashMap<Instance, Arc<Invocation>>,
    unmanageable: RecentSet<UniqueId>,
}

/// Applies a policy set to the processes of one host
pub struct Orchestrator {
    ctx: InvocationContext,
    hostname: String,
    passive: bool,
    tables: Mutex<Tables>,
}

impl Orchestrator {
    /// In passive mode processes are opened with whatever rights are
    /// available, even if that means they cannot be terminated.
    pub fn new(ctx: InvocationContext, hostname: impl Into<String>, passive: bool) -> Self {
        Self {
            ctx,
            hostname: hostname.into(),
            passive,
            tables: Mutex::new(Tables {
                managed: HashMap::new(),
                skipped: HashSet::new(),
                invocations: HashMap::new(),
                unmanageable: RecentSet::new(UNMANAGEABLE_TTL),
            }),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Managed processes and the instance each belongs to
    pub async fn managed(&self) -> Vec<(UniqueId, Instance)> {
        let tables = self.tables.lock().await;
        let mut managed: Vec<_> = tables.managed.iter().map(|(id, i)| (*id, i.clone())).collect();
        managed.sort();
        managed
    }

    pub async fn invocation_count(&self) -> usize {
        self.tables.lock().await.invocations.len()
    }

    /// Run one enforcement pass over the host's processes
    ///
    /// The tables are never locked while an invocation is being stopped or
    /// offered a process.
    pub async fn enforce(&self, policies: &PolicySet) -> EnforcerResult<()> {
        let procs = scan(self.ctx.host.as_ref(), policies).await?;
        let mut scanned = HashSet::with_capacity(procs.len());
        let mut pending = Vec::new();
        let mut retired = Vec::new();

        {
            let mut guard = self.tables.lock().await;
            let tables = &mut *guard;

            for proc in procs {
                let id = proc.unique_id;
                scanned.insert(id);

                if blocklisted(&proc) {
                    if let Some(instance) = tables.managed.remove(&id) {
                        if let Some(inv) = tables.invocations.remove(&instance) {
                            info!(instance = %instance.id, name = %proc.name, "Stopping management of blocklisted invocation");
                            retired.push((instance, inv));
                        }
                        tables.skipped.insert(id);
                        info!(process = %id, name = %proc.name, "Stopped management of blocklisted process");
                    } else if tables.skipped.insert(id) {
                        info!(process = %id, name = %proc.name, "Skipped management of blocklisted process");
                    }
                    continue;
                }
                tables.skipped.remove(&id);

                if tables.managed.contains_key(&id) || tables.unmanageable.contains(&id) {
                    continue;
                }

                if !policies.matching(&proc.properties(&self.hostname)).is_empty() {
                    pending.push(proc);
                }
            }

            // An invocation outlives its process while it waits to restart it
            tables.managed.retain(|id, _| {
                let alive = scanned.contains(id);
                if !alive {
                    debug!(process = %id, "Stopped management of process");
                }
                alive
            });
            tables.skipped.retain(|id| scanned.contains(id));
            tables.unmanageable.cleanup();

            let done: Vec<Instance> = tables
                .invocations
                .iter()
                .filter(|(_, inv)| inv.is_done())
                .map(|(instance, _)| instance.clone())
                .collect();
            for instance in done {
                if let Some(inv) = tables.invocations.remove(&instance) {
                    retired.push((instance, inv));
                }
            }
        }

        for (instance, inv) in retired {
            inv.stop().await;
            debug!(instance = %instance.id, "Stopped management of invocation");
        }

        if pending.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = pending.iter().map(|p| p.unique_id.to_string()).collect();
        debug!(count = pending.len(), processes = %ids.join(", "), "Enforcement found new processes");

        for proc in pending {
            self.manage(proc).await;
        }
        Ok(())
    }

    async fn manage(&self, proc: ProcessInfo) {
        let id = proc.unique_id;
        let handle = match self.ctx.host.open(&proc, self.passive).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(process = %id, name = %proc.name, error = %e, "Unable to manage process");
                self.tables.lock().await.unmanageable.insert(id);
                return;
            }
        };

        // A restarted program is claimed by the invocation that started it
        let candidates: Vec<(Instance, Arc<Invocation>)> = self
            .tables
            .lock()
            .await
            .invocations
            .iter()
            .filter(|(_, inv)| !inv.is_done())
            .map(|(instance, inv)| (instance.clone(), inv.clone()))
            .collect();
        for (instance, inv) in candidates {
            if inv.absorb(handle.clone()).await {
                debug!(process = %id, instance = %instance.id, "Process absorbed into instance");
                self.tables.lock().await.managed.insert(id, instance);
                return;
            }
        }

        let instance = process_instance(&self.hostname, &proc);
        info!(process = %id, name = %proc.name, instance = %instance.id, "Started management of process");
        let inv = Arc::new(Invocation::start(self.ctx.clone(), instance.clone(), handle));
        let mut tables = self.tables.lock().await;
        tables.invocations.insert(instance.clone(), inv);
        tables.managed.insert(id, instance);
    }

    /// Stop supervising every process. Processes keep running.
    pub async fn stop(&self) {
        let invocations: Vec<(Instance, Arc<Invocation>)> = {
            let mut tables = self.tables.lock().await;
            tables.managed.clear();
            tables.invocations.drain().collect()
        };
        for (instance, inv) in invocations {
            info!(instance = %instance.id, "Stopping management of invocation");
            inv.stop().await;
        }
    }
}
