//! Lease broker engine
//!
//! The broker answers acquire and release requests by matching them against
//! the current policies and running an optimistic transaction against the
//! lease store. Every handler re-reads the store and retries when another
//! writer got there first.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use warden_api::{
    FORM_RESOURCE, Lease, LeaseRequest, Refresh, Snapshot, Status, Strategy, Subject, Tx,
    merge_properties,
};
use warden_config::{PolicySet, PolicySource};
use warden_store::{LeaseStore, StoreError};
use warden_util::{Clock, SystemClock, format_duration};

use crate::{BrokerError, BrokerResult, can_activate, refresh};

/// Number of times a transaction is attempted before giving up
pub const MAX_ATTEMPTS: usize = 5;

/// The result of an acquire request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// No policy applies to the request
    NotRequired { request: LeaseRequest },
    /// A lease was issued or renewed
    Leased {
        request: LeaseRequest,
        lease: Lease,
        snapshot: Snapshot,
    },
}

impl Acquisition {
    pub fn lease(&self) -> Option<&Lease> {
        match self {
            Acquisition::Leased { lease, .. } => Some(lease),
            Acquisition::NotRequired { .. } => None,
        }
    }
}

/// The result of a release request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub request: LeaseRequest,
    /// The lease as it was before the release, if it existed
    pub previous: Option<Lease>,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Creation,
    Renewal,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Creation => f.write_str("Creation"),
            Mode::Renewal => f.write_str("Renewal"),
        }
    }
}

/// The lease broker
pub struct Broker {
    policies: Arc<dyn PolicySource>,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
}

impl Broker {
    pub fn new(policies: Arc<dyn PolicySource>, store: Arc<dyn LeaseStore>) -> Self {
        info!(
            policies = %policies.name(),
            store = %store.name(),
            "Broker initialized"
        );
        Self {
            policies,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used by the handlers that don't take a time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// The complete current policy set
    pub fn policies(&self) -> BrokerResult<PolicySet> {
        Ok(self.policies.policies()?)
    }

    pub fn acquire(&self, request: LeaseRequest) -> BrokerResult<Acquisition> {
        self.acquire_at(request, self.now())
    }

    pub fn release(&self, request: LeaseRequest) -> BrokerResult<Release> {
        self.release_at(request, self.now())
    }

    pub fn purge(&self) -> BrokerResult<usize> {
        self.purge_at(self.now())
    }

    pub fn snapshots(&self, resource: &str) -> BrokerResult<Vec<Snapshot>> {
        self.snapshots_at(resource, self.now())
    }

    /// The policies that apply to a request. The request's resource takes
    /// part in matching under the `resource` key.
    fn matching(&self, request: &LeaseRequest) -> BrokerResult<PolicySet> {
        let mut props = request.properties.clone();
        props.insert(FORM_RESOURCE.to_string(), request.subject.resource.clone());
        Ok(self.policies()?.matching(&props))
    }

    /// Issue or renew a lease
    pub fn acquire_at(&self, mut request: LeaseRequest, now: DateTime<Utc>) -> BrokerResult<Acquisition> {
        request.require_consumer()?;
        let policies = self.matching(&request)?;
        let effect = policies.effect();

        if effect.resource != request.subject.resource {
            if !request.subject.resource.is_empty() {
                // The subject was transmuted by a policy change since the
                // lease was issued; give back what it held before.
                self.release_subject(&request.subject, effect.strategy, effect.limit, now)?;
            }
            request.subject.resource = effect.resource.clone();
        }

        if request.subject.resource.is_empty() {
            debug!(instance = %request.subject.instance, "No policy applies; lease not required");
            return Ok(Acquisition::NotRequired { request });
        }

        let subject = request.subject.clone();
        info!("{}: Lease acquisition requested", subject);

        let properties = merge_properties([&request.properties, &effect.properties]);
        let template = Lease {
            subject: subject.clone(),
            status: Status::Queued,
            started: now,
            renewed: now,
            released: None,
            strategy: effect.strategy,
            limit: effect.limit,
            duration: effect.duration,
            decay: effect.decay,
            refresh: sane_refresh(&subject, effect.refresh, effect.duration),
            properties,
        };

        let (lease, snapshot, mode) = self.acquire_tx(&template, now)?;

        let summary = snapshot.stats.summary(template.strategy, template.limit);
        info!("{}: {} of {} lease succeeded ({})", subject, mode, lease.status, summary);

        Ok(Acquisition::Leased {
            request,
            lease,
            snapshot,
        })
    }

    fn acquire_tx(&self, template: &Lease, now: DateTime<Utc>) -> BrokerResult<(Lease, Snapshot, Mode)> {
        let subject = &template.subject;
        let instance = &subject.instance;
        let consumer = subject.consumer();
        let strategy = template.strategy;
        let limit = template.limit;

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let (revision, leases) = match self.store.view(&subject.resource) {
                Ok(view) => view,
                Err(e) => {
                    warn!(attempt, "{}: Lease retrieval failed: {}", subject, e);
                    last_err = Some(e);
                    continue;
                }
            };

            let mut tx = Tx::new(subject.resource.clone(), revision, leases);
            let acc = refresh(&mut tx, now);
            let consumed = acc.total(strategy);
            let released = acc.released(&consumer);

            let mut lease = template.clone();
            let mut mode = Mode::Creation;

            match tx.instance(instance).cloned() {
                Some(existing) if existing.status == Status::Released => {
                    // The holder kept renewing a lease that had already
                    // lapsed; issue it afresh
                    lease.status = if consumed <= limit {
                        Status::Active
                    } else {
                        Status::Queued
                    };
                    tx.update(instance, lease.clone());
                }
                Some(existing) => {
                    mode = Mode::Renewal;
                    lease.status = existing.status;
                    lease.started = existing.started;
                    tx.update(instance, lease.clone());
                }
                None => {
                    let replaceable = if released > 0 && consumed <= limit {
                        tx.consumer(&consumer)
                            .into_iter()
                            .filter(|l| l.status == Status::Released)
                            .last()
                            .map(|l| l.instance().clone())
                    } else {
                        None
                    };

                    match replaceable {
                        Some(replaced) => {
                            debug!("{}: Replacing released lease of {}", subject, replaced);
                            lease.status = Status::Active;
                            tx.update(&replaced, lease.clone());
                        }
                        None => {
                            lease.status = if can_activate(strategy, acc.active(&consumer), consumed, limit) {
                                Status::Active
                            } else {
                                Status::Queued
                            };
                            tx.create(lease.clone());
                        }
                    }
                }
            }

            let resource = tx.resource().to_string();
            if tx.is_empty() {
                return Ok((lease, Snapshot::new(resource, revision, tx.into_leases()), mode));
            }

            match self.store.commit(&tx) {
                Ok(()) => {
                    let snapshot = Snapshot::new(resource, revision + 1, tx.into_leases());
                    return Ok((lease, snapshot, mode));
                }
                Err(e) => {
                    warn!(attempt, "{}: Lease acquisition failed: {}", subject, e);
                    last_err = Some(e);
                }
            }
        }

        Err(exhausted(&subject.resource, last_err))
    }

    /// Release a lease
    ///
    /// Releasing a lease that is missing or already released succeeds.
    pub fn release_at(&self, mut request: LeaseRequest, now: DateTime<Utc>) -> BrokerResult<Release> {
        request.require_consumer()?;
        let effect = self.matching(&request)?.effect();
        if request.subject.resource.is_empty() {
            request.subject.resource = effect.resource.clone();
        }
        if request.subject.resource.is_empty() {
            debug!(instance = %request.subject.instance, "No resource to release");
            return Ok(Release {
                request,
                previous: None,
                snapshot: Snapshot::default(),
            });
        }

        info!("{}: Release requested", request.subject);
        let (previous, snapshot) =
            self.release_subject(&request.subject, effect.strategy, effect.limit, now)?;

        Ok(Release {
            request,
            previous,
            snapshot,
        })
    }

    fn release_subject(
        &self,
        subject: &Subject,
        strategy: Strategy,
        limit: u32,
        now: DateTime<Utc>,
    ) -> BrokerResult<(Option<Lease>, Snapshot)> {
        let mut outcome = None;
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let (revision, leases) = match self.store.view(&subject.resource) {
                Ok(view) => view,
                Err(e) => {
                    warn!(attempt, "{}: Release failed: {}", subject, e);
                    last_err = Some(e);
                    continue;
                }
            };

            let mut tx = Tx::new(subject.resource.clone(), revision, leases);
            refresh(&mut tx, now);
            let found = tx.instance(&subject.instance).cloned();
            tx.release(&subject.instance, now);
            refresh(&mut tx, now);

            let resource = tx.resource().to_string();
            if tx.is_empty() {
                outcome = Some((found, Snapshot::new(resource, revision, tx.into_leases())));
                break;
            }

            match self.store.commit(&tx) {
                Ok(()) => {
                    outcome = Some((found, Snapshot::new(resource, revision + 1, tx.into_leases())));
                    break;
                }
                Err(e) => {
                    warn!(attempt, "{}: Release failed: {}", subject, e);
                    last_err = Some(e);
                }
            }
        }

        let Some((found, snapshot)) = outcome else {
            return Err(exhausted(&subject.resource, last_err));
        };

        let summary = snapshot.stats.summary(strategy, limit);
        match &found {
            Some(lease) if lease.status == Status::Released => info!(
                "{}: Release ignored because the lease had already been released ({})",
                subject, summary
            ),
            Some(lease) => info!("{}: Release of {} lease succeeded ({})", subject, lease.status, summary),
            None => info!(
                "{}: Release ignored because the lease could not be found ({})",
                subject, summary
            ),
        }

        Ok((found, snapshot))
    }

    /// Refresh every resource in the store, committing any changes.
    /// Returns the number of resources that changed.
    pub fn purge_at(&self, now: DateTime<Utc>) -> BrokerResult<usize> {
        let mut changed = 0;
        for resource in self.store.resources()? {
            let mut last_err = None;
            let mut done = false;

            for attempt in 1..=MAX_ATTEMPTS {
                let (revision, leases) = match self.store.view(&resource) {
                    Ok(view) => view,
                    Err(e) => {
                        warn!(attempt, "Purge of \"{}\" failed: {}", resource, e);
                        last_err = Some(e);
                        continue;
                    }
                };

                let mut tx = Tx::new(resource.clone(), revision, leases);
                refresh(&mut tx, now);
                if tx.is_empty() {
                    done = true;
                    break;
                }

                match self.store.commit(&tx) {
                    Ok(()) => {
                        debug!(resource = %resource, ops = tx.ops().len(), "Purged leases");
                        changed += 1;
                        done = true;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, "Purge of \"{}\" failed: {}", resource, e);
                        last_err = Some(e);
                    }
                }
            }

            if !done {
                return Err(exhausted(&resource, last_err));
            }
        }
        Ok(changed)
    }

    /// Every resource named by a policy or present in the store
    pub fn resources(&self) -> BrokerResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut resources = Vec::new();
        let named = self.policies()?.resources().into_iter();
        for resource in named.chain(self.store.resources()?) {
            if !resource.is_empty() && seen.insert(resource.clone()) {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    /// Refreshed lease sets for one resource, or for every known resource
    /// when `resource` is empty. Changes are committed on a best-effort
    /// basis.
    pub fn snapshots_at(&self, resource: &str, now: DateTime<Utc>) -> BrokerResult<Vec<Snapshot>> {
        let resources = if resource.is_empty() {
            self.resources()?
        } else {
            vec![resource.to_string()]
        };

        resources
            .into_iter()
            .map(|resource| self.snapshot_at(&resource, now))
            .collect()
    }

    fn snapshot_at(&self, resource: &str, now: DateTime<Utc>) -> BrokerResult<Snapshot> {
        let (revision, leases) = self.store.view(resource)?;
        let mut tx = Tx::new(resource, revision, leases);
        refresh(&mut tx, now);

        let mut current = revision;
        if !tx.is_empty() {
            match self.store.commit(&tx) {
                Ok(()) => current += 1,
                Err(e) => debug!(resource, error = %e, "Best-effort refresh commit failed"),
            }
        }

        Ok(Snapshot::new(resource, current, tx.into_leases()))
    }
}

/// Refresh intervals that are not shorter than the lease duration are
/// replaced by the default
fn sane_refresh(subject: &Subject, mut refresh: Refresh, duration: std::time::Duration) -> Refresh {
    for (name, interval) in [("active", &mut refresh.active), ("queued", &mut refresh.queued)] {
        if !interval.is_zero() && *interval >= duration {
            warn!(
                "{}: The lease policy specified an {} refresh interval of {} for a lease with a duration of {}. The refresh interval will be overridden.",
                subject,
                name,
                format_duration(*interval),
                format_duration(duration)
            );
            *interval = std::time::Duration::ZERO;
        }
    }
    refresh
}

fn exhausted(resource: &str, last_err: Option<StoreError>) -> BrokerError {
    match last_err {
        Some(e) if !e.is_conflict() => BrokerError::Store(e),
        _ => BrokerError::Contention {
            resource: resource.to_string(),
            attempts: MAX_ATTEMPTS,
        },
    }
}
