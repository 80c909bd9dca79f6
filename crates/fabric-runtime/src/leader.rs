//! Lease-based leader election
//!
//! One `coordination.k8s.io/v1` `Lease` per controller. The holder renews it
//! every `renew_period`; anyone may take it over once `renewTime` is older than
//! `leaseDurationSeconds`. Every write is conditional on the observed
//! `resourceVersion`, so two candidates never both win.

use crate::error::RuntimeError;
use chrono::{DateTime, SecondsFormat, Utc};
use fabric_client::{ObjectClient, ObjectKey};
use k8s_openapi::api::coordination::v1::Lease;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default lease duration
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
/// Default renew period
pub const DEFAULT_RENEW_PERIOD: Duration = Duration::from_secs(5);

fn micro_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug)]
struct Observed {
    resource_version: Option<String>,
    holder: Option<String>,
    renew_time: Option<DateTime<Utc>>,
    duration: Duration,
    transitions: i64,
}

impl Observed {
    fn of(lease: &Lease) -> Result<Self, RuntimeError> {
        let value = serde_json::to_value(lease).map_err(fabric_client::ClientError::from)?;
        let str_at = |path: &str| value.pointer(path).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            resource_version: str_at("/metadata/resourceVersion"),
            holder: str_at("/spec/holderIdentity").filter(|h| !h.is_empty()),
            renew_time: str_at("/spec/renewTime")
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
            duration: value
                .pointer("/spec/leaseDurationSeconds")
                .and_then(Value::as_u64)
                .map_or(DEFAULT_LEASE_DURATION, Duration::from_secs),
            transitions: value
                .pointer("/spec/leaseTransitions")
                .and_then(Value::as_i64)
                .unwrap_or_default(),
        })
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        let Some(renewed) = self.renew_time else {
            return true;
        };
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| renewed.checked_add_signed(d))
            .is_some_and(|deadline| deadline < now)
    }
}

/// Candidate for one lease
pub struct LeaderElector {
    client: Arc<dyn ObjectClient<Lease>>,
    key: ObjectKey,
    identity: String,
    lease_duration: Duration,
    renew_period: Duration,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("key", &self.key)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Candidate `identity` for the lease `namespace/name`
    pub fn new(
        client: Arc<dyn ObjectClient<Lease>>,
        namespace: &str,
        name: &str,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            client,
            key: ObjectKey::namespaced(namespace, name),
            identity: identity.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_period: DEFAULT_RENEW_PERIOD,
        }
    }

    /// Lease duration and renew period; the period should be well below the duration
    #[must_use]
    pub fn timing(mut self, lease_duration: Duration, renew_period: Duration) -> Self {
        self.lease_duration = lease_duration;
        self.renew_period = renew_period;
        self
    }

    /// Identity written to `holderIdentity`
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// One election round. Returns whether this candidate holds the lease.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, RuntimeError> {
        let now = Utc::now();
        let Some(lease) = self.client.get(&self.key).await? else {
            let lease: Lease = serde_json::from_value(json!({
                "apiVersion": "coordination.k8s.io/v1",
                "kind": "Lease",
                "metadata": {
                    "name": self.key.name,
                    "namespace": self.key.namespace,
                },
                "spec": {
                    "holderIdentity": self.identity,
                    "leaseDurationSeconds": self.lease_duration.as_secs(),
                    "acquireTime": micro_time(now),
                    "renewTime": micro_time(now),
                    "leaseTransitions": 0,
                }
            }))
            .map_err(fabric_client::ClientError::from)?;
            return match self.client.create(&lease, false).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_already_exists() => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let observed = Observed::of(&lease)?;
        let spec = if observed.holder.as_deref() == Some(self.identity.as_str()) {
            json!({ "renewTime": micro_time(now) })
        } else if observed.holder.is_none() || observed.expired(now) {
            info!(lease = %self.key, previous = ?observed.holder, identity = %self.identity, "Taking over lease");
            json!({
                "holderIdentity": self.identity,
                "leaseDurationSeconds": self.lease_duration.as_secs(),
                "acquireTime": micro_time(now),
                "renewTime": micro_time(now),
                "leaseTransitions": observed.transitions + 1,
            })
        } else {
            debug!(lease = %self.key, holder = ?observed.holder, "Lease held by another candidate");
            return Ok(false);
        };

        let patch = json!({
            "metadata": { "resourceVersion": observed.resource_version },
            "spec": spec,
        });
        match self.client.patch(&self.key, &patch).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Give the lease up if held, so a successor need not wait for expiry.
    pub async fn release(&self) -> Result<(), RuntimeError> {
        let Some(lease) = self.client.get(&self.key).await? else {
            return Ok(());
        };
        let observed = Observed::of(&lease)?;
        if observed.holder.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        let patch = json!({
            "metadata": { "resourceVersion": observed.resource_version },
            "spec": { "holderIdentity": null, "renewTime": null },
        });
        match self.client.patch(&self.key, &patch).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Campaign until elected, cancel `leading`, then keep renewing until
    /// `cancel` fires.
    ///
    /// Failing to renew for a full lease duration is an error: the caller
    /// must stop its workers.
    pub async fn run(self, leading: CancellationToken, cancel: CancellationToken) -> Result<(), RuntimeError> {
        info!(lease = %self.key, identity = %self.identity, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(lease = %self.key, error = %e, "Leader election round failed"),
            }
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.renew_period) => {}
            }
        }
        info!(lease = %self.key, identity = %self.identity, "Acquired leadership");
        leading.cancel();

        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    if let Err(e) = self.release().await {
                        warn!(lease = %self.key, error = %e, "Failed to release lease");
                    }
                    return Ok(());
                }
                () = tokio::time::sleep(self.renew_period) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    return Err(RuntimeError::LeaderElection(format!("lease {} lost", self.key)));
                }
                Err(e) => warn!(lease = %self.key, error = %e, "Failed to renew lease"),
            }
            if last_renewed.elapsed() > self.lease_duration {
                return Err(RuntimeError::LeaderElection(format!(
                    "lease {} not renewed within {:?}",
                    self.key, self.lease_duration
                )));
            }
        }
    }
}
