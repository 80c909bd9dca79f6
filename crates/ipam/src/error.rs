//! IPAM errors

use crate::ipset::IpFamily;
use std::net::IpAddr;
use thiserror::Error;

/// Errors returned by the public IP and VNI allocators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// No capacity left for the request
    #[error("no space left")]
    NoSpaceLeft,

    /// A literal address or VNI is held by another claimer
    #[error("{0} is already taken")]
    AlreadyTaken(String),

    /// The requested family is not served by any configured pool
    #[error("cannot handle ip family {0}")]
    CannotHandleIPFamily(IpFamily),

    /// A literal address or VNI lies outside the configured pool or range
    #[error("{0} is outside of the allocatable range")]
    OutOfRange(String),

    /// The request itself is malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Allocator configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// VNI bounds are not `0 < min <= max <= MAX_VNI`
    #[error("invalid vni range [{min}, {max}]")]
    InvalidVNIRange { min: i32, max: i32 },
}

/// Errors of the key-slots container.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeySlotsError {
    /// Key is not part of the container
    #[error("unknown key")]
    UnknownKey,

    /// Slot index beyond the per-key capacity
    #[error("slot {slot} out of range (slots per key: {slots_per_key})")]
    SlotOutOfRange { slot: u32, slots_per_key: u32 },

    /// Slot is already set
    #[error("slot {0} is already in use")]
    SlotInUse(u32),

    /// Slot is not set
    #[error("slot {0} is not in use")]
    SlotNotInUse(u32),
}

/// Errors of the NAT port-slot allocator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NatError {
    /// Ports per network interface does not divide the ephemeral port space
    #[error("ports per network interface {0} must be greater than 1 and divide 64512")]
    InvalidPortsPerNetworkInterface(i32),

    /// Port range does not map onto a slot
    #[error("port range [{port}, {end_port}] does not map to a slot")]
    InvalidPortRange { port: i32, end_port: i32 },

    /// IP is not one of the gateway IPs
    #[error("ip {0} is not managed by this allocation")]
    UnknownIP(IpAddr),

    /// Port range is already assigned
    #[error("port range [{port}, {end_port}] on {ip} is already in use")]
    InUse { ip: IpAddr, port: i32, end_port: i32 },
}
