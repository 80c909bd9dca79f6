//! Durable allocation records
//!
//! Every address handed out by the public IP allocator is backed by a
//! cluster-scoped `IPAddress` named after the address, and every VNI by a
//! `NetworkID` named after its decimal value. The record is written before
//! the claimer's spec or status, and the in-memory reservation is released
//! again when that write fails. A record already held by another claimer
//! wins: its owner's reservation is restored and ours is dropped.

use super::{AllocKey, Reconciler, reasons};
use crate::error::ControllerError;
use crds::{
    ClaimRef, IPAddress, IPAddressSpec, LABEL_CLAIM_UID, NetworkID, NetworkIDSpec, REASON_ALREADY_TAKEN,
    REASON_INVALID, REASON_PENDING, REASON_UNSUPPORTED_FAMILY, ip_label_value,
};
use fabric_client::{FabricEvent, ObjectClient, ObjectKey};
use ipam::{AddressRequest, AllocationError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Result of claiming addresses or a VNI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome<T> {
    /// Reserved and recorded
    Allocated(T),
    /// No capacity left; wait for a release
    Pending,
    /// A literal value is held by someone else
    Conflict(String),
    /// No pool serves the requested family
    UnsupportedFamily(String),
    /// The request cannot be served as written
    Invalid(String),
}

impl<T> ClaimOutcome<T> {
    /// Condition reason and event for an outcome other than `Allocated`.
    ///
    /// `pending_reason` is the event reason published while waiting for capacity.
    pub fn failure(&self, pending_reason: &str) -> Option<(&'static str, FabricEvent)> {
        match self {
            ClaimOutcome::Allocated(_) => None,
            ClaimOutcome::Pending => Some((
                REASON_PENDING,
                FabricEvent::normal(pending_reason, ACTION, "no space left, waiting for a release"),
            )),
            ClaimOutcome::Conflict(msg) => Some((
                REASON_ALREADY_TAKEN,
                FabricEvent::warning(reasons::ALLOCATION_CONFLICT, ACTION, msg.clone()),
            )),
            ClaimOutcome::UnsupportedFamily(msg) => Some((
                REASON_UNSUPPORTED_FAMILY,
                FabricEvent::warning(reasons::UNSUPPORTED_FAMILY, ACTION, msg.clone()),
            )),
            ClaimOutcome::Invalid(msg) => Some((
                REASON_INVALID,
                FabricEvent::warning(reasons::INVALID_SPEC, ACTION, msg.clone()),
            )),
        }
    }

    fn from_error(err: AllocationError) -> Self {
        match err {
            AllocationError::NoSpaceLeft => ClaimOutcome::Pending,
            AllocationError::AlreadyTaken(what) => ClaimOutcome::Conflict(format!("{what} is already taken")),
            AllocationError::CannotHandleIPFamily(family) => {
                ClaimOutcome::UnsupportedFamily(format!("no pool serves {family:?}"))
            }
            AllocationError::OutOfRange(what) => {
                ClaimOutcome::Invalid(format!("{what} is outside of the allocatable range"))
            }
            AllocationError::InvalidRequest(msg) => ClaimOutcome::Invalid(msg),
        }
    }
}

const ACTION: &str = "Allocate";

fn claim_labels(uid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_CLAIM_UID.to_string(), uid.to_string())])
}

/// Name of the `IPAddress` record of `ip`
pub fn ip_address_name(ip: &IpAddr) -> String {
    ip_label_value(ip)
}

/// Name of the `NetworkID` record of `vni`
pub fn network_id_name(vni: i32) -> String {
    vni.to_string()
}

enum Recorded {
    Ours,
    Theirs(ClaimRef),
}

impl Reconciler {
    /// Reserve addresses for `key` and make sure each one has its record.
    pub async fn claim_addresses(
        &self,
        key: &AllocKey,
        uid: &str,
        request: &AddressRequest,
    ) -> Result<ClaimOutcome<Vec<IpAddr>>, ControllerError> {
        let ips = match self.ip_allocator.allocate(key, uid, request) {
            Ok(ips) => ips,
            Err(err) => {
                debug!(key = %key, error = %err, "Public IP allocation failed");
                return Ok(ClaimOutcome::from_error(err));
            }
        };

        let mut recorded = Vec::with_capacity(ips.len());
        for ip in &ips {
            match self.record_address(key, uid, *ip).await {
                Ok(Recorded::Ours) => recorded.push(*ip),
                Ok(Recorded::Theirs(claim)) => {
                    warn!(key = %key, ip = %ip, holder = %claim.name, "Address recorded for another claimer");
                    self.ip_allocator.release(key);
                    if let Err(e) = self.ip_allocator.restore(&AllocKey::of_claim(&claim), &claim.uid, *ip) {
                        debug!(ip = %ip, error = %e, "Could not restore reservation of record holder");
                    }
                    self.discard_records(&recorded).await?;
                    return Ok(ClaimOutcome::Conflict(format!("{ip} is already taken")));
                }
                Err(e) => {
                    self.ip_allocator.release(key);
                    if let Err(cleanup) = self.discard_records(&recorded).await {
                        warn!(key = %key, error = %cleanup, "Could not delete records of abandoned claim");
                    }
                    return Err(e);
                }
            }
        }
        Ok(ClaimOutcome::Allocated(ips))
    }

    /// Delete the records of an abandoned claim. The allocation no longer
    /// holds `ips`, so their records would otherwise block other claimers.
    async fn discard_records(&self, ips: &[IpAddr]) -> Result<(), ControllerError> {
        let client = self.clients.ip_addresses.as_ref();
        for ip in ips {
            if client.delete_if_exists(&ObjectKey::cluster(ip_address_name(ip))).await? {
                debug!(ip = %ip, "Deleted record of abandoned claim");
            }
        }
        Ok(())
    }

    async fn record_address(&self, key: &AllocKey, uid: &str, ip: IpAddr) -> Result<Recorded, ControllerError> {
        let client = self.clients.ip_addresses.as_ref();
        let record_key = ObjectKey::cluster(ip_address_name(&ip));
        if let Some(existing) = client.get(&record_key).await? {
            return Ok(holder(&existing.spec.claim_ref, uid));
        }
        let record = IPAddress {
            metadata: ObjectMeta {
                name: Some(record_key.name.clone()),
                labels: Some(claim_labels(uid)),
                ..Default::default()
            },
            spec: IPAddressSpec {
                ip,
                claim_ref: key.claim_ref(uid),
            },
        };
        match client.create(&record, false).await {
            Ok(_) => {
                debug!(key = %key, ip = %ip, "Recorded address");
                Ok(Recorded::Ours)
            }
            Err(e) if e.is_already_exists() => match client.get(&record_key).await? {
                Some(existing) => Ok(holder(&existing.spec.claim_ref, uid)),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Release the addresses of `key` held for `uid` and delete their records.
    pub async fn release_addresses(&self, key: &AllocKey, uid: &str) -> Result<(), ControllerError> {
        if let Some(allocation) = self.ip_allocator.release_if_uid(key, uid) {
            info!(key = %key, ips = ?allocation.ips, "Released public IPs");
        }
        delete_records(self.clients.ip_addresses.as_ref(), uid).await
    }

    /// Release whatever `key` holds, for claimers that vanished without cleanup.
    pub async fn release_addresses_of_key(&self, key: &AllocKey) -> Result<(), ControllerError> {
        if let Some(allocation) = self.ip_allocator.release(key) {
            info!(key = %key, ips = ?allocation.ips, "Released public IPs of deleted claimer");
        }
        let client = self.clients.ip_addresses.as_ref();
        for record in client.list_all().await? {
            if key.matches(&record.spec.claim_ref) {
                client.delete_if_exists(&ObjectKey::of(&record)).await?;
            }
        }
        Ok(())
    }

    /// Reserve a VNI for `key` and make sure it has its record.
    pub async fn claim_vni(
        &self,
        key: &AllocKey,
        uid: &str,
        requested: Option<i32>,
    ) -> Result<ClaimOutcome<i32>, ControllerError> {
        let vni = match self.vni_allocator.allocate(key, uid, requested) {
            Ok(vni) => vni,
            Err(err) => {
                debug!(key = %key, error = %err, "VNI allocation failed");
                return Ok(ClaimOutcome::from_error(err));
            }
        };
        match self.record_vni(key, uid, vni).await {
            Ok(Recorded::Ours) => Ok(ClaimOutcome::Allocated(vni)),
            Ok(Recorded::Theirs(claim)) => {
                warn!(key = %key, vni, holder = %claim.name, "VNI recorded for another network");
                self.vni_allocator.release(key);
                if let Err(e) = self.vni_allocator.restore(&AllocKey::of_claim(&claim), &claim.uid, vni) {
                    debug!(vni, error = %e, "Could not restore reservation of record holder");
                }
                Ok(ClaimOutcome::Conflict(format!("VNI {vni} is already taken")))
            }
            Err(e) => {
                self.vni_allocator.release(key);
                Err(e)
            }
        }
    }

    async fn record_vni(&self, key: &AllocKey, uid: &str, vni: i32) -> Result<Recorded, ControllerError> {
        let client = self.clients.network_ids.as_ref();
        let record_key = ObjectKey::cluster(network_id_name(vni));
        if let Some(existing) = client.get(&record_key).await? {
            return Ok(holder(&existing.spec.claim_ref, uid));
        }
        let record = NetworkID {
            metadata: ObjectMeta {
                name: Some(record_key.name.clone()),
                labels: Some(claim_labels(uid)),
                ..Default::default()
            },
            spec: NetworkIDSpec {
                claim_ref: key.claim_ref(uid),
            },
        };
        match client.create(&record, false).await {
            Ok(_) => Ok(Recorded::Ours),
            Err(e) if e.is_already_exists() => match client.get(&record_key).await? {
                Some(existing) => Ok(holder(&existing.spec.claim_ref, uid)),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Release the VNI of `key` held for `uid` and delete its record.
    pub async fn release_vni(&self, key: &AllocKey, uid: &str) -> Result<(), ControllerError> {
        if let Some(vni) = self.vni_allocator.release_if_uid(key, uid) {
            info!(key = %key, vni, "Released VNI");
        }
        delete_records(self.clients.network_ids.as_ref(), uid).await
    }

    /// Release whatever VNI `key` holds, for networks that vanished without cleanup.
    pub async fn release_vni_of_key(&self, key: &AllocKey) -> Result<(), ControllerError> {
        if let Some(vni) = self.vni_allocator.release(key) {
            info!(key = %key, vni, "Released VNI of deleted network");
        }
        let client = self.clients.network_ids.as_ref();
        for record in client.list_all().await? {
            if key.matches(&record.spec.claim_ref) {
                client.delete_if_exists(&ObjectKey::of(&record)).await?;
            }
        }
        Ok(())
    }
}

fn holder(claim: &ClaimRef, uid: &str) -> Recorded {
    if claim.uid == uid {
        Recorded::Ours
    } else {
        Recorded::Theirs(claim.clone())
    }
}

async fn delete_records<K>(client: &dyn ObjectClient<K>, uid: &str) -> Result<(), ControllerError>
where
    K: fabric_client::FabricResource,
{
    for record in client.list(None, &claim_labels(uid)).await? {
        let key = ObjectKey::of(&record);
        if client.delete_if_exists(&key).await? {
            debug!(record = %key, "Deleted allocation record");
        }
    }
    Ok(())
}
