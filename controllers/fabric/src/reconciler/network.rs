//! Network reconciliation: VNI allocation and peering status

use super::addresses::{ClaimOutcome, network_id_name};
use super::{AllocKey, Reconciler, allocated_condition, patch_status_if_changed, reasons, resources, uid_of};
use crate::error::ControllerError;
use crds::{
    FABRIC_FINALIZER, Network, NetworkPeering, NetworkPeeringStatus, PeeringState, REASON_ALLOCATED,
    set_condition,
};
use fabric_client::{ObjectClient, ObjectKey};
use fabric_runtime::{Action, Cleanup, Managed, requeue};
use ipnet::IpNet;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// VNIs named by the peerings of `network`, as index values
pub fn peering_ids(network: &Network) -> Vec<String> {
    network.spec.peerings.iter().map(|p| p.id.clone()).collect()
}

impl Reconciler {
    /// Reconcile one live `Network` carrying the finalizer
    #[instrument(skip(self, obj), fields(network = %ObjectKey::of(&obj)))]
    pub async fn reconcile_network(&self, obj: Network) -> Result<Action, ControllerError> {
        let client = self.clients.networks.as_ref();
        let key = ObjectKey::of(&obj);
        self.indexes.peerings.insert(key.clone(), peering_ids(&obj));

        let alloc_key = AllocKey::new(resources::NETWORKS, &key);
        let uid = uid_of(&obj)?;
        let vni = match self.claim_vni(&alloc_key, &uid, obj.spec.vni).await? {
            ClaimOutcome::Allocated(vni) => vni,
            outcome => {
                if let Some((reason, event)) = outcome.failure(reasons::FAILED_ALLOCATING_VNI) {
                    self.report_not_allocated(client, &obj, obj.status.as_ref(), reason, event)
                        .await?;
                }
                return Ok(Action::await_change());
            }
        };

        if obj.spec.vni.is_none() {
            info!(vni, "Allocated VNI");
            let patch = json!({
                "metadata": { "resourceVersion": obj.metadata.resource_version },
                "spec": { "vni": vni },
            });
            client.patch(&key, &patch).await?;
            return Ok(requeue());
        }

        let mut peerings = Vec::with_capacity(obj.spec.peerings.len());
        for peering in &obj.spec.peerings {
            peerings.push(NetworkPeeringStatus {
                name: peering.name.clone(),
                state: self.peering_state(&obj, vni, peering).await?,
            });
        }

        let mut status = obj.status.clone().unwrap_or_default();
        status.vni = Some(vni);
        status.peerings = peerings;
        set_condition(
            &mut status.conditions,
            allocated_condition(true, REASON_ALLOCATED, "", obj.metadata.generation),
        );
        if !patch_status_if_changed(client, &obj, obj.status.as_ref(), &status).await? {
            debug!("Network up to date");
        }
        Ok(Action::await_change())
    }

    async fn peering_state(
        &self,
        obj: &Network,
        vni: i32,
        peering: &NetworkPeering,
    ) -> Result<PeeringState, ControllerError> {
        let Ok(peer_vni) = peering.id.parse::<i32>() else {
            debug!(peering = %peering.name, id = %peering.id, "Unparsable peering id");
            return Ok(PeeringState::Error);
        };
        if peering.prefixes.iter().any(|p| p.parse::<IpNet>().is_err()) {
            debug!(peering = %peering.name, "Unparsable peering prefix");
            return Ok(PeeringState::Error);
        }

        let Some(record) = self
            .clients
            .network_ids
            .get(&ObjectKey::cluster(network_id_name(peer_vni)))
            .await?
        else {
            return Ok(PeeringState::Pending);
        };
        let claim = &record.spec.claim_ref;
        let peer_key = AllocKey::of_claim(claim).object_key();
        let Some(peer) = self.clients.networks.get(&peer_key).await? else {
            return Ok(PeeringState::Pending);
        };
        if peer.metadata.uid.as_deref() != Some(claim.uid.as_str()) {
            return Ok(PeeringState::Pending);
        }

        let ours = vni.to_string();
        let reciprocal = peer.spec.peerings.iter().any(|p| p.id == ours);
        debug!(peering = %peering.name, peer = %peer_key, network = %ObjectKey::of(obj), reciprocal, "Resolved peering");
        Ok(if reciprocal {
            PeeringState::Ready
        } else {
            PeeringState::Pending
        })
    }
}

/// [`Managed`] handle for `Network`
#[derive(Debug, Clone)]
pub struct Networks(pub Arc<Reconciler>);

#[async_trait::async_trait]
impl Managed for Networks {
    type Resource = Network;
    type Error = ControllerError;

    fn client(&self) -> &dyn ObjectClient<Network> {
        self.0.clients.networks.as_ref()
    }

    fn finalizer(&self) -> &str {
        FABRIC_FINALIZER
    }

    async fn gone(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        self.0.indexes.peerings.remove(key);
        self.0
            .release_vni_of_key(&AllocKey::new(resources::NETWORKS, key))
            .await
    }

    async fn cleanup(&self, obj: &Network) -> Result<Cleanup, ControllerError> {
        let key = ObjectKey::of(obj);
        self.0.indexes.peerings.remove(&key);
        self.0
            .release_vni(&AllocKey::new(resources::NETWORKS, &key), &uid_of(obj)?)
            .await?;
        Ok(Cleanup::Finished)
    }

    async fn apply(&self, obj: Network) -> Result<Action, ControllerError> {
        self.0.reconcile_network(obj).await
    }
}
