//! Leader election using Kubernetes Leases
//!
//! Only one replica may patch nodes at a time. The holder of the
//! `coordination.k8s.io/v1` Lease is the leader; it renews the lease in the
//! background and signals through [`Leadership::lost`] when renewal fails.
//!
//! # Atomicity
//!
//! Takeover and renewal replace the lease with the resourceVersion that was
//! read, so a concurrent change makes the write fail and the attempt is
//! retried instead of two replicas both believing they lead.

use crate::error::ControllerError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive failed acquisition attempts before giving up.
const MAX_ACQUIRE_FAILURES: u32 = 12;

/// Blocks until this replica is the only writer.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Waits for leadership.
    ///
    /// Returns `Ok(None)` when `cancel` fires before leadership is acquired.
    async fn become_leader(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Leadership>, ControllerError>;
}

/// Held leadership.
///
/// Dropping it stops lease renewal.
#[derive(Debug)]
pub struct Leadership {
    lost: CancellationToken,
    renewal: Option<JoinHandle<()>>,
}

impl Leadership {
    /// Leadership that is never lost, used when election is disabled.
    #[must_use]
    pub fn unconditional() -> Self {
        Self {
            lost: CancellationToken::new(),
            renewal: None,
        }
    }

    /// Leadership whose loss is signalled through `lost`.
    #[must_use]
    pub fn new(lost: CancellationToken, renewal: Option<JoinHandle<()>>) -> Self {
        Self { lost, renewal }
    }

    /// Resolves once leadership is lost.
    pub async fn lost(&self) {
        self.lost.cancelled().await;
    }

    /// True once leadership is lost.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }
}

impl Drop for Leadership {
    fn drop(&mut self) {
        if let Some(task) = self.renewal.take() {
            task.abort();
        }
    }
}

/// Lease based [`LeaderElector`].
#[derive(Clone)]
pub struct LeaseElector {
    lock: Arc<LeaseLock>,
}

struct LeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaseElector {
    /// Creates an elector for lease `name` in `namespace` with default timing
    /// (30s lease, 10s renew, 5s retry).
    #[must_use]
    pub fn new(client: Client, name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            lock: Arc::new(LeaseLock {
                api: Api::namespaced(client, namespace),
                name: name.to_string(),
                namespace: namespace.to_string(),
                identity: identity.to_string(),
                lease_duration: LEASE_DURATION,
                renew_interval: RENEW_INTERVAL,
                retry_interval: RETRY_INTERVAL,
            }),
        }
    }
}

#[async_trait]
impl LeaderElector for LeaseElector {
    async fn become_leader(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Leadership>, ControllerError> {
        let lock = &self.lock;
        info!(
            identity = %lock.identity,
            lease = %lock.name,
            namespace = %lock.namespace,
            "Trying to become leader"
        );

        let mut failures = 0;
        loop {
            match lock.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %lock.identity, "Acquired leader lock, continuing");
                    let lost = CancellationToken::new();
                    let renewal = tokio::spawn(Arc::clone(lock).renewal_loop(lost.clone()));
                    return Ok(Some(Leadership::new(lost, Some(renewal))));
                }
                Ok(false) => {
                    failures = 0;
                    debug!(
                        identity = %lock.identity,
                        retry_secs = lock.retry_interval.as_secs(),
                        "Lease held by another instance, waiting"
                    );
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        identity = %lock.identity,
                        error = %e,
                        attempt = failures,
                        "Failed to acquire lease"
                    );
                    if failures >= MAX_ACQUIRE_FAILURES {
                        return Err(ControllerError::LeaderElection(format!(
                            "giving up on lease {}/{} after {failures} failed attempts: {e}",
                            lock.namespace, lock.name
                        )));
                    }
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(lock.retry_interval) => {}
            }
        }
    }
}

/// What a replica may do with the lease it just read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseAction {
    /// We hold the lease and renew it
    Renew,
    /// The previous holder let the lease expire
    TakeOver,
    /// Another holder owns a live lease
    Wait,
}

/// Decides between renewal, takeover and waiting for the lease `spec`.
fn lease_action(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        LeaseAction::Renew
    } else if lease_expired(spec, now) {
        LeaseAction::TakeOver
    } else {
        LeaseAction::Wait
    }
}

/// A lease without holder, renew time or duration counts as expired.
fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref().is_none_or(str::is_empty) {
        return true;
    }
    match (spec.renew_time.as_ref().and_then(to_utc), spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => now > renewed + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    }
}

/// Spec written on renewal or takeover. A takeover restarts the acquire
/// time and counts one more transition.
fn next_lease_spec(
    previous: Option<&LeaseSpec>,
    identity: &str,
    lease_duration: Duration,
    now: DateTime<Utc>,
    takeover: bool,
) -> Result<LeaseSpec, ControllerError> {
    let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
    let (acquired, transitions) = if takeover {
        (now, transitions.saturating_add(1))
    } else {
        let acquired = previous
            .and_then(|s| s.acquire_time.as_ref())
            .and_then(to_utc)
            .unwrap_or(now);
        (acquired, transitions)
    };

    Ok(LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(i32::try_from(lease_duration.as_secs()).unwrap_or(i32::MAX)),
        acquire_time: Some(to_micro_time(acquired)?),
        renew_time: Some(to_micro_time(now)?),
        lease_transitions: Some(transitions),
        ..Default::default()
    })
}

impl LeaseLock {
    /// Acquires, takes over or renews the lease.
    ///
    /// `Ok(false)` means another holder owns a lease that has not expired.
    async fn try_acquire_or_renew(&self) -> Result<bool, ControllerError> {
        let now = Utc::now();
        let Some(existing) = self.api.get_opt(&self.name).await? else {
            let spec = next_lease_spec(None, &self.identity, self.lease_duration, now, false)?;
            self.write(None, spec).await?;
            info!(identity = %self.identity, "Created new lease");
            return Ok(true);
        };

        let previous = existing.spec.as_ref();
        match lease_action(previous, &self.identity, now) {
            LeaseAction::Wait => Ok(false),
            LeaseAction::Renew => {
                let spec = next_lease_spec(previous, &self.identity, self.lease_duration, now, false)?;
                self.write(Some(&existing), spec).await?;
                debug!(identity = %self.identity, "Lease renewed");
                Ok(true)
            }
            LeaseAction::TakeOver => {
                let spec = next_lease_spec(previous, &self.identity, self.lease_duration, now, true)?;
                self.write(Some(&existing), spec).await?;
                info!(
                    identity = %self.identity,
                    previous = ?previous.and_then(|s| s.holder_identity.as_deref()),
                    "Took over expired lease"
                );
                Ok(true)
            }
        }
    }

    /// Creates the lease, or replaces `existing` with the resourceVersion
    /// that was read.
    async fn write(&self, existing: Option<&Lease>, spec: LeaseSpec) -> Result<(), ControllerError> {
        let mut lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(spec),
        };

        let Some(existing) = existing else {
            self.api.create(&PostParams::default(), &lease).await?;
            return Ok(());
        };

        let resource_version = existing.metadata.resource_version.clone().ok_or_else(|| {
            ControllerError::LeaderElection(format!("lease {} has no resourceVersion", self.name))
        })?;
        lease.metadata.resource_version = Some(resource_version);
        self.api.replace(&self.name, &PostParams::default(), &lease).await?;
        Ok(())
    }

    /// Renews the lease until another holder takes it or renewal keeps
    /// failing for longer than the lease duration.
    async fn renewal_loop(self: Arc<Self>, lost: CancellationToken) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease taken by another instance");
                    break;
                }
                Err(e) if last_renewed.elapsed() < self.lease_duration => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease expired during renewal failures");
                    break;
                }
            }
        }
        warn!(identity = %self.identity, "Leadership lost");
        lost.cancel();
    }
}

// Lease timestamps are converted through their RFC 3339 wire form.
fn to_utc(time: &MicroTime) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn to_micro_time(time: DateTime<Utc>) -> Result<MicroTime, ControllerError> {
    let wire = serde_json::Value::String(time.to_rfc3339_opts(SecondsFormat::Micros, true));
    serde_json::from_value(wire)
        .map_err(|e| ControllerError::LeaderElection(format!("invalid lease timestamp: {e}")))
}
