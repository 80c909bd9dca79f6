//! IP reconciliation
//!
//! `IP` objects share the public IP allocator with `PublicIP` and direct
//! `VirtualIP`s. NAT gateways and load balancers get their addresses through
//! owned `IP`s, and the cross-cluster proxy pins `IP`s in the backing cluster
//! through the broker owners annotation.

use super::addresses::ClaimOutcome;
use super::{AllocKey, Reconciler, allocated_condition, patch_status_if_changed, reasons, resources, uid_of};
use crate::error::ControllerError;
use crds::{
    FABRIC_FINALIZER, IP, IpFamily, LABEL_IP, LABEL_IP_FAMILY, REASON_ALLOCATED, REASON_INVALID, broker_owners,
    ip_label_value, set_condition,
};
use fabric_client::{FabricEvent, ObjectClient, ObjectKey};
use fabric_runtime::{Action, Cleanup, Managed, requeue};
use ipam::AddressRequest;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Allocation request of an `IP`
pub fn address_request(obj: &IP) -> AddressRequest {
    match obj.spec.ip {
        Some(ip) => AddressRequest::literal([ip]),
        None => AddressRequest::dynamic([obj.spec.ip_family.into()]),
    }
}

/// Labels an allocated `IP` carries for lookups by address
pub fn ip_labels(family: IpFamily, ip: &IpAddr) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_IP_FAMILY.to_string(), family.to_string()),
        (LABEL_IP.to_string(), ip_label_value(ip)),
    ])
}

fn has_labels(obj: &IP, wanted: &BTreeMap<String, String>) -> bool {
    let labels = obj.metadata.labels.as_ref();
    wanted
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// Number of broker owners still pinning `obj`; `None` when it is not brokered.
fn pinned_by(obj: &IP) -> Result<Option<usize>, ControllerError> {
    match broker_owners(obj.metadata.annotations.as_ref()) {
        None => Ok(None),
        Some(Ok(owners)) => Ok(Some(owners.len())),
        Some(Err(e)) => Err(ControllerError::BrokerReference(format!(
            "{}: {e}",
            ObjectKey::of(obj)
        ))),
    }
}

impl Reconciler {
    /// Reconcile one live `IP` carrying the finalizer
    #[instrument(skip(self, obj), fields(ip = %ObjectKey::of(&obj)))]
    pub async fn reconcile_ip(&self, obj: IP) -> Result<Action, ControllerError> {
        let client = self.clients.ips.as_ref();
        let key = ObjectKey::of(&obj);

        if pinned_by(&obj)? == Some(0) {
            info!("No broker owner left, deleting");
            client.delete_if_exists(&key).await?;
            return Ok(Action::await_change());
        }

        if let Some(ip) = obj.spec.ip
            && IpFamily::of(&ip) != obj.spec.ip_family
        {
            let note = format!("{ip} is not an {} address", obj.spec.ip_family);
            let event = FabricEvent::warning(reasons::INVALID_SPEC, "Allocate", note);
            self.report_not_allocated(client, &obj, obj.status.as_ref(), REASON_INVALID, event)
                .await?;
            return Ok(Action::await_change());
        }

        let alloc_key = AllocKey::new(resources::IPS, &key);
        let uid = uid_of(&obj)?;
        let ip = match self
            .claim_addresses(&alloc_key, &uid, &address_request(&obj))
            .await?
        {
            ClaimOutcome::Allocated(ips) => match ips.first() {
                Some(ip) => *ip,
                None => return Ok(Action::await_change()),
            },
            outcome => {
                if let Some((reason, event)) = outcome.failure(reasons::FAILED_ALLOCATING_PUBLIC_IP) {
                    self.report_not_allocated(client, &obj, obj.status.as_ref(), reason, event)
                        .await?;
                }
                return Ok(Action::await_change());
            }
        };

        let labels = ip_labels(obj.spec.ip_family, &ip);
        if obj.spec.ip.is_none() || !has_labels(&obj, &labels) {
            info!(ip = %ip, "Allocated IP");
            let patch = json!({
                "metadata": {
                    "resourceVersion": obj.metadata.resource_version,
                    "labels": labels,
                },
                "spec": { "ip": ip },
            });
            client.patch(&key, &patch).await?;
            return Ok(requeue());
        }

        let mut status = obj.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            allocated_condition(true, REASON_ALLOCATED, "", obj.metadata.generation),
        );
        if !patch_status_if_changed(client, &obj, obj.status.as_ref(), &status).await? {
            debug!("IP up to date");
        }
        Ok(Action::await_change())
    }
}

/// [`Managed`] handle for `IP`
#[derive(Debug, Clone)]
pub struct IPs(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl Managed for IPs {
    type Resource = IP;
    type Error = ControllerError;

    fn client(&self) -> &dyn ObjectClient<IP> {
        self.0.clients.ips.as_ref()
    }

    fn finalizer(&self) -> &str {
        FABRIC_FINALIZER
    }

    async fn gone(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        self.0
            .release_addresses_of_key(&AllocKey::new(resources::IPS, key))
            .await
    }

    async fn cleanup(&self, obj: &IP) -> Result<Cleanup, ControllerError> {
        match pinned_by(obj) {
            Ok(Some(owners)) if owners > 0 => {
                debug!(ip = %ObjectKey::of(obj), owners, "Still pinned by broker owners");
                return Ok(Cleanup::Blocked);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Unreadable broker owners, keeping IP");
                return Ok(Cleanup::Blocked);
            }
        }
        let key = AllocKey::new(resources::IPS, &ObjectKey::of(obj));
        self.0.release_addresses(&key, &uid_of(obj)?).await?;
        Ok(Cleanup::Finished)
    }

    async fn apply(&self, obj: IP) -> Result<Action, ControllerError> {
        self.0.reconcile_ip(obj).await
    }
}
