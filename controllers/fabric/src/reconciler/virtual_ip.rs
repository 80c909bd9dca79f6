//! VirtualIP reconciliation
//!
//! A `VirtualIP` annotated with a broker controller reference is proxied: the
//! address is allocated by an `IP` in the backing cluster, which this cluster
//! pins with a broker owner reference for as long as the local object lives.
//! Without the annotation the address comes from the local allocator.

use super::addresses::ClaimOutcome;
use super::{AllocKey, Reconciler, allocated_condition, patch_status_if_changed, reasons, resources, uid_of};
use crate::error::ControllerError;
use crds::{
    ANNOTATION_BROKER_OWNERS, BrokerControllerReference, BrokerOwnerReference, CONDITION_ALLOCATED,
    FABRIC_FINALIZER, IP, IPSpec, IPType, REASON_ALLOCATED, REASON_INVALID, REASON_PENDING, VirtualIP,
    VirtualIPStatus, broker_controller, broker_owners, encode_broker_owners, is_condition_true,
    remove_broker_owner, set_condition, upsert_broker_owner,
};
use fabric_client::{FabricEvent, ObjectClient, ObjectKey};
use fabric_runtime::{Action, Cleanup, Managed};
use ipam::AddressRequest;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Allocation request of a direct `VirtualIP`
pub fn address_request(obj: &VirtualIP) -> AddressRequest {
    match obj.spec.ip {
        Some(ip) => AddressRequest::literal([ip]),
        None => AddressRequest::dynamic([obj.spec.ip_family.into()]),
    }
}

/// Broker controller reference of `obj`, if it is proxied
pub fn broker_reference(obj: &VirtualIP) -> Option<Result<BrokerControllerReference, ControllerError>> {
    broker_controller(obj.metadata.annotations.as_ref()).map(|parsed| {
        parsed.map_err(|e| ControllerError::BrokerReference(format!("{}: {e}", ObjectKey::of(obj))))
    })
}

fn read_owners(remote: &IP) -> Result<Vec<BrokerOwnerReference>, ControllerError> {
    match broker_owners(remote.metadata.annotations.as_ref()) {
        None => Ok(Vec::new()),
        Some(parsed) => {
            parsed.map_err(|e| ControllerError::BrokerReference(format!("{}: {e}", ObjectKey::of(remote))))
        }
    }
}

fn owners_patch(remote: &IP, owners: &[BrokerOwnerReference]) -> Result<serde_json::Value, ControllerError> {
    Ok(json!({
        "metadata": {
            "resourceVersion": remote.metadata.resource_version,
            "annotations": { ANNOTATION_BROKER_OWNERS: encode_broker_owners(owners)? },
        },
    }))
}

impl Reconciler {
    fn broker_owner(&self, obj: &VirtualIP, uid: &str) -> BrokerOwnerReference {
        BrokerOwnerReference {
            cluster_name: self.cluster_name.clone(),
            kind: VirtualIP::kind(&()).to_string(),
            api_version: VirtualIP::api_version(&()).to_string(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name: obj.metadata.name.clone().unwrap_or_default(),
            uid: uid.to_string(),
            controller: true,
        }
    }

    /// Reconcile one live `VirtualIP` carrying the finalizer
    #[instrument(skip(self, obj), fields(virtual_ip = %ObjectKey::of(&obj)))]
    pub async fn reconcile_virtual_ip(&self, obj: VirtualIP) -> Result<Action, ControllerError> {
        let client = self.clients.virtual_ips.as_ref();
        match broker_reference(&obj) {
            None => self.reconcile_direct_virtual_ip(obj).await,
            Some(Ok(reference)) => match self.backing_ips.clone() {
                Some(backing) => self.reconcile_proxied_virtual_ip(obj, reference, backing.as_ref()).await,
                None => {
                    let event = FabricEvent::warning(
                        reasons::INVALID_SPEC,
                        "Proxy",
                        "broker controller set but no backing cluster configured",
                    );
                    self.report_not_allocated(client, &obj, obj.status.as_ref(), REASON_INVALID, event)
                        .await?;
                    Ok(Action::await_change())
                }
            },
            Some(Err(e)) => {
                let event = FabricEvent::warning(reasons::INVALID_SPEC, "Proxy", e.to_string());
                self.report_not_allocated(client, &obj, obj.status.as_ref(), REASON_INVALID, event)
                    .await?;
                Ok(Action::await_change())
            }
        }
    }

    async fn reconcile_direct_virtual_ip(&self, obj: VirtualIP) -> Result<Action, ControllerError> {
        let client = self.clients.virtual_ips.as_ref();
        let alloc_key = AllocKey::new(resources::VIRTUAL_IPS, &ObjectKey::of(&obj));
        let uid = uid_of(&obj)?;
        let ip = match self
            .claim_addresses(&alloc_key, &uid, &address_request(&obj))
            .await?
        {
            ClaimOutcome::Allocated(ips) => ips.first().copied(),
            outcome => {
                if let Some((reason, event)) = outcome.failure(reasons::FAILED_ALLOCATING_PUBLIC_IP) {
                    self.report_not_allocated(client, &obj, obj.status.as_ref(), reason, event)
                        .await?;
                }
                return Ok(Action::await_change());
            }
        };

        let mut status = obj.status.clone().unwrap_or_default();
        status.ip = ip;
        set_condition(
            &mut status.conditions,
            allocated_condition(true, REASON_ALLOCATED, "", obj.metadata.generation),
        );
        if patch_status_if_changed(client, &obj, obj.status.as_ref(), &status).await? {
            info!(ip = ?ip, "Virtual IP allocated");
        }
        Ok(Action::await_change())
    }

    async fn reconcile_proxied_virtual_ip(
        &self,
        obj: VirtualIP,
        reference: BrokerControllerReference,
        backing: &dyn ObjectClient<IP>,
    ) -> Result<Action, ControllerError> {
        let remote_key = ObjectKey::namespaced(&reference.namespace, &reference.name);
        let owner = self.broker_owner(&obj, &uid_of(&obj)?);

        let remote = match backing.get(&remote_key).await? {
            Some(remote) => {
                let mut owners = read_owners(&remote)?;
                if upsert_broker_owner(&mut owners, owner) {
                    debug!(remote = %remote_key, "Pinning backing IP");
                    backing.patch(&remote_key, &owners_patch(&remote, &owners)?).await?
                } else {
                    remote
                }
            }
            None => {
                let remote = IP {
                    metadata: ObjectMeta {
                        name: Some(reference.name.clone()),
                        namespace: Some(reference.namespace.clone()),
                        annotations: Some(BTreeMap::from([(
                            ANNOTATION_BROKER_OWNERS.to_string(),
                            encode_broker_owners(&[owner])?,
                        )])),
                        ..Default::default()
                    },
                    spec: IPSpec {
                        type_: IPType::Public,
                        ip_family: obj.spec.ip_family,
                        ip: obj.spec.ip,
                        claim_ref: None,
                    },
                    status: None,
                };
                info!(remote = %remote_key, "Creating backing IP");
                backing.create(&remote, false).await?
            }
        };

        let allocated = remote
            .status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_ALLOCATED));
        let mut status = obj.status.clone().unwrap_or_default();
        match remote.spec.ip.filter(|_| allocated) {
            Some(ip) => {
                status.ip = Some(ip);
                set_condition(
                    &mut status.conditions,
                    allocated_condition(true, REASON_ALLOCATED, "", obj.metadata.generation),
                );
            }
            None => {
                status.ip = None;
                set_condition(
                    &mut status.conditions,
                    allocated_condition(
                        false,
                        REASON_PENDING,
                        format!("waiting for {remote_key} in the backing cluster"),
                        obj.metadata.generation,
                    ),
                );
            }
        }
        patch_status_if_changed(
            self.clients.virtual_ips.as_ref(),
            &obj,
            obj.status.as_ref(),
            &status,
        )
        .await?;
        Ok(Action::await_change())
    }

    /// Drop this cluster's pin from the backing `IP`, tolerating its absence.
    async fn unpin_backing_ip(
        &self,
        obj: &VirtualIP,
        reference: &BrokerControllerReference,
        backing: &dyn ObjectClient<IP>,
    ) -> Result<(), ControllerError> {
        let remote_key = ObjectKey::namespaced(&reference.namespace, &reference.name);
        let Some(remote) = backing.get(&remote_key).await? else {
            return Ok(());
        };
        let mut owners = read_owners(&remote)?;
        if !remove_broker_owner(&mut owners, &self.cluster_name, &uid_of(obj)?) {
            return Ok(());
        }
        match backing.patch(&remote_key, &owners_patch(&remote, &owners)?).await {
            Ok(_) => {
                info!(remote = %remote_key, remaining = owners.len(), "Unpinned backing IP");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether a `VirtualIP` status still waits for an address
pub fn is_pending(status: Option<&VirtualIPStatus>) -> bool {
    !status.is_some_and(|s| is_condition_true(&s.conditions, CONDITION_ALLOCATED))
}

/// [`Managed`] handle for `VirtualIP`
#[derive(Debug, Clone)]
pub struct VirtualIPs(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl Managed for VirtualIPs {
    type Resource = VirtualIP;
    type Error = ControllerError;

    fn client(&self) -> &dyn ObjectClient<VirtualIP> {
        self.0.clients.virtual_ips.as_ref()
    }

    fn finalizer(&self) -> &str {
        FABRIC_FINALIZER
    }

    async fn gone(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        self.0
            .release_addresses_of_key(&AllocKey::new(resources::VIRTUAL_IPS, key))
            .await
    }

    async fn cleanup(&self, obj: &VirtualIP) -> Result<Cleanup, ControllerError> {
        if let (Some(Ok(reference)), Some(backing)) = (broker_reference(obj), self.0.backing_ips.as_ref()) {
            self.0
                .unpin_backing_ip(obj, &reference, backing.as_ref())
                .await?;
        }
        let key = AllocKey::new(resources::VIRTUAL_IPS, &ObjectKey::of(obj));
        self.0.release_addresses(&key, &uid_of(obj)?).await?;
        Ok(Cleanup::Finished)
    }

    async fn apply(&self, obj: VirtualIP) -> Result<Action, ControllerError> {
        self.0.reconcile_virtual_ip(obj).await
    }
}
