//! `IP` objects owned by NAT gateways and load balancers
//!
//! Each named address of an owner is backed by an `IP` called
//! `<owner>-<ipName>`, labelled with the owner's name and controlled by it.

use super::{Reconciler, controller_reference, is_controlled_by, uid_of};
use crate::error::ControllerError;
use crds::{CONDITION_ALLOCATED, ClaimRef, FABRIC_GROUP, IP, IPSpec, IPType, IpFamily, LABEL_IP_OWNER, is_condition_true};
use fabric_client::{FabricResource, ObjectKey};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Name of the `IP` backing address `ip_name` of `owner`
pub fn owned_ip_name(owner: &str, ip_name: &str) -> String {
    format!("{owner}-{ip_name}")
}

/// Label selecting the `IP`s of `owner`
pub fn owner_labels(owner: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_IP_OWNER.to_string(), owner.to_string())])
}

/// One address an owner wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedIP {
    /// Name of the address within the owner
    pub name: String,
    /// Family to allocate
    pub family: IpFamily,
    /// Literal address, if any
    pub ip: Option<IpAddr>,
}

/// Address of a [`WantedIP`] once its `IP` is allocated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedIP {
    /// Name of the address within the owner
    pub name: String,
    /// Allocated address; `None` while pending
    pub ip: Option<IpAddr>,
}

fn allocated_ip(ip: &IP) -> Option<IpAddr> {
    let allocated = ip
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_ALLOCATED));
    ip.spec.ip.filter(|_| allocated)
}

impl Reconciler {
    /// Make the owned `IP`s of `owner` match `wanted` and report their addresses
    /// in the order of `wanted`.
    ///
    /// Stale `IP`s, and `IP`s whose literal address no longer matches, are
    /// deleted. A name still taken by another or a terminating `IP` is
    /// reported as pending.
    pub async fn sync_owned_ips<K: FabricResource>(
        &self,
        owner: &K,
        wanted: &[WantedIP],
    ) -> Result<Vec<OwnedIP>, ControllerError> {
        let client = self.clients.ips.as_ref();
        let owner_key = ObjectKey::of(owner);
        let owner_uid = uid_of(owner)?;
        let owner_ref = controller_reference(owner)
            .ok_or_else(|| ControllerError::InvalidConfig(format!("{owner_key} cannot own objects")))?;

        let mut existing: BTreeMap<String, IP> = client
            .list(owner_key.namespace.as_deref(), &owner_labels(&owner_key.name))
            .await?
            .into_iter()
            .filter(|ip| is_controlled_by(ip, &owner_uid))
            .map(|ip| (ip.metadata.name.clone().unwrap_or_default(), ip))
            .collect();

        let mut owned = Vec::with_capacity(wanted.len());
        for want in wanted {
            let name = owned_ip_name(&owner_key.name, &want.name);
            let current = match existing.remove(&name) {
                Some(ip)
                    if ip.spec.ip_family != want.family
                        || want.ip.is_some_and(|literal| ip.spec.ip != Some(literal)) =>
                {
                    info!(ip = %name, "Replacing owned IP with changed spec");
                    client.delete_if_exists(&ObjectKey::of(&ip)).await?;
                    None
                }
                other => other,
            };
            let ip = match current {
                Some(ip) => allocated_ip(&ip),
                None => {
                    let obj = IP {
                        metadata: ObjectMeta {
                            name: Some(name.clone()),
                            namespace: owner_key.namespace.clone(),
                            labels: Some(owner_labels(&owner_key.name)),
                            owner_references: Some(vec![owner_ref.clone()]),
                            ..Default::default()
                        },
                        spec: IPSpec {
                            type_: IPType::Public,
                            ip_family: want.family,
                            ip: want.ip,
                            claim_ref: Some(ClaimRef {
                                group: FABRIC_GROUP.to_string(),
                                resource: K::plural(&()).to_string(),
                                namespace: owner_key.namespace.clone(),
                                name: owner_key.name.clone(),
                                uid: owner_uid.clone(),
                            }),
                        },
                        status: None,
                    };
                    match client.create(&obj, false).await {
                        Ok(_) => info!(ip = %name, owner = %owner_key, "Created owned IP"),
                        Err(e) if e.is_already_exists() => {
                            warn!(ip = %name, owner = %owner_key, "IP name still taken, waiting");
                        }
                        Err(e) => return Err(e.into()),
                    }
                    None
                }
            };
            owned.push(OwnedIP {
                name: want.name.clone(),
                ip,
            });
        }

        for (name, stale) in existing {
            debug!(ip = %name, owner = %owner_key, "Deleting stale owned IP");
            client.delete_if_exists(&ObjectKey::of(&stale)).await?;
        }
        Ok(owned)
    }
}
