//! PublicIP reconciliation
//!
//! A dynamic request is allocated, written back into `spec.ips`, and then
//! confirmed on the next pass through the literal branch, which is also the
//! path taken by user-provided addresses and by rehydrated objects.

use super::addresses::ClaimOutcome;
use super::{AllocKey, Reconciler, allocated_condition, patch_status_if_changed, reasons, resources, uid_of};
use crate::error::ControllerError;
use crds::{FABRIC_FINALIZER, PublicIP, PublicIPSpec, REASON_ALLOCATED, REASON_INVALID, set_condition};
use fabric_client::{FabricEvent, ObjectClient, ObjectKey};
use fabric_runtime::{Action, Cleanup, Managed, requeue};
use ipam::AddressRequest;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Allocation request of a `PublicIP`
pub fn address_request(spec: &PublicIPSpec) -> AddressRequest {
    if spec.ips.is_empty() {
        AddressRequest::dynamic(spec.ip_families.iter().map(|&family| family.into()))
    } else {
        AddressRequest::literal(spec.ips.iter().copied())
    }
}

impl Reconciler {
    /// Reconcile one live `PublicIP` carrying the finalizer
    #[instrument(skip(self, obj), fields(public_ip = %ObjectKey::of(&obj)))]
    pub async fn reconcile_public_ip(&self, obj: PublicIP) -> Result<Action, ControllerError> {
        let client = self.clients.public_ips.as_ref();
        let key = ObjectKey::of(&obj);
        let alloc_key = AllocKey::new(resources::PUBLIC_IPS, &key);
        let uid = uid_of(&obj)?;

        let request = address_request(&obj.spec);
        if request.families.is_empty() {
            let event = FabricEvent::warning(reasons::INVALID_SPEC, "Allocate", "neither ipFamilies nor ips requested");
            self.report_not_allocated(client, &obj, obj.status.as_ref(), REASON_INVALID, event)
                .await?;
            return Ok(Action::await_change());
        }

        let ips = match self.claim_addresses(&alloc_key, &uid, &request).await? {
            ClaimOutcome::Allocated(ips) => ips,
            outcome => {
                if let Some((reason, event)) = outcome.failure(reasons::FAILED_ALLOCATING_PUBLIC_IP) {
                    self.report_not_allocated(client, &obj, obj.status.as_ref(), reason, event)
                        .await?;
                }
                return Ok(Action::await_change());
            }
        };

        if obj.spec.ips.is_empty() {
            info!(ips = ?ips, "Allocated public IPs");
            let patch = json!({
                "metadata": { "resourceVersion": obj.metadata.resource_version },
                "spec": { "ips": ips },
            });
            client.patch(&key, &patch).await?;
            return Ok(requeue());
        }

        let mut status = obj.status.clone().unwrap_or_default();
        status.ips = ips;
        set_condition(
            &mut status.conditions,
            allocated_condition(true, REASON_ALLOCATED, "", obj.metadata.generation),
        );
        if !patch_status_if_changed(client, &obj, obj.status.as_ref(), &status).await? {
            debug!("PublicIP up to date");
        }
        Ok(Action::await_change())
    }
}

/// [`Managed`] handle for `PublicIP`
#[derive(Debug, Clone)]
pub struct PublicIPs(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl Managed for PublicIPs {
    type Resource = PublicIP;
    type Error = ControllerError;

    fn client(&self) -> &dyn ObjectClient<PublicIP> {
        self.0.clients.public_ips.as_ref()
    }

    fn finalizer(&self) -> &str {
        FABRIC_FINALIZER
    }

    async fn gone(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        self.0
            .release_addresses_of_key(&AllocKey::new(resources::PUBLIC_IPS, key))
            .await
    }

    async fn cleanup(&self, obj: &PublicIP) -> Result<Cleanup, ControllerError> {
        let key = AllocKey::new(resources::PUBLIC_IPS, &ObjectKey::of(obj));
        self.0.release_addresses(&key, &uid_of(obj)?).await?;
        Ok(Cleanup::Finished)
    }

    async fn apply(&self, obj: PublicIP) -> Result<Action, ControllerError> {
        self.0.reconcile_public_ip(obj).await
    }
}
