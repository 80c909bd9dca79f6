//! NAT port-slot allocator
//!
//! The ephemeral port space `[1024, 65535]` of every gateway IP is cut into
//! `64512 / P` slots of `P` consecutive ports. Slot `s` maps to
//! `(1024 + s * P, 1024 + s * P + P - 1)`.

use crate::error::{KeySlotsError, NatError};
use crate::keyslots::KeySlots;
use std::net::IpAddr;

/// First ephemeral port
pub const MIN_EPHEMERAL_PORT: i32 = 1024;
/// Last ephemeral port
pub const MAX_EPHEMERAL_PORT: i32 = 65535;
/// Size of the ephemeral port space
pub const NO_OF_EPHEMERAL_PORTS: i32 = MAX_EPHEMERAL_PORT - MIN_EPHEMERAL_PORT + 1;

/// Validate a ports-per-network-interface setting and return the slots per IP.
///
/// `P` must divide 64512 and be at least 2, since a single-port slot can never
/// satisfy `port < endPort`.
pub fn slots_per_ip(ports_per_network_interface: i32) -> Result<u32, NatError> {
    let p = ports_per_network_interface;
    if p < 2 || NO_OF_EPHEMERAL_PORTS % p != 0 {
        return Err(NatError::InvalidPortsPerNetworkInterface(p));
    }
    Ok((NO_OF_EPHEMERAL_PORTS / p) as u32)
}

/// Slot index of `[port, end_port]`, if the range is a valid slot for `P`.
pub fn slot_for_ports(ports_per_network_interface: i32, port: i32, end_port: i32) -> Option<u32> {
    let p = ports_per_network_interface;
    let slots = slots_per_ip(p).ok()?;
    if !(MIN_EPHEMERAL_PORT <= port && port < end_port && end_port <= MAX_EPHEMERAL_PORT) {
        return None;
    }
    if end_port - port + 1 != p {
        return None;
    }
    let offset = port - MIN_EPHEMERAL_PORT;
    if offset % p != 0 {
        return None;
    }
    let slot = (offset / p) as u32;
    (slot < slots).then_some(slot)
}

/// Port range `(port, end_port)` of `slot` for `P`.
pub fn ports_for_slot(ports_per_network_interface: i32, slot: u32) -> (i32, i32) {
    let port = MIN_EPHEMERAL_PORT + slot as i32 * ports_per_network_interface;
    (port, port + ports_per_network_interface - 1)
}

/// A `(ip, port, end_port)` triple handed to one network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatAllocation {
    /// Gateway IP
    pub ip: IpAddr,
    /// First port
    pub port: i32,
    /// Last port (inclusive)
    pub end_port: i32,
}

/// Port-slot allocator over the IPs of one NAT gateway.
///
/// Built fresh for every table rebuild, so it carries no lock.
#[derive(Debug, Clone)]
pub struct AllocationManager {
    ports_per_network_interface: i32,
    slots: KeySlots<IpAddr>,
}

impl AllocationManager {
    /// Allocator over `ips` with `P` ports per interface
    pub fn new(
        ports_per_network_interface: i32,
        ips: impl IntoIterator<Item = IpAddr>,
    ) -> Result<Self, NatError> {
        let slots = slots_per_ip(ports_per_network_interface)?;
        Ok(Self {
            ports_per_network_interface,
            slots: KeySlots::new(ips, slots),
        })
    }

    /// Configured `P`
    pub fn ports_per_network_interface(&self) -> i32 {
        self.ports_per_network_interface
    }

    /// `64512 / P`
    pub fn slots_per_ip(&self) -> u32 {
        self.slots.slots_per_key()
    }

    /// Whether `ip` is one of the gateway IPs
    pub fn has_ip(&self, ip: &IpAddr) -> bool {
        self.slots.contains_key(ip)
    }

    /// Reserve an existing `[port, end_port]` range on `ip`.
    pub fn use_ports(&mut self, ip: IpAddr, port: i32, end_port: i32) -> Result<(), NatError> {
        let slot = slot_for_ports(self.ports_per_network_interface, port, end_port)
            .ok_or(NatError::InvalidPortRange { port, end_port })?;
        self.slots.use_slot(&ip, slot).map_err(|err| match err {
            KeySlotsError::UnknownKey => NatError::UnknownIP(ip),
            _ => NatError::InUse { ip, port, end_port },
        })
    }

    /// Reserve the next free range.
    pub fn use_next_free(&mut self) -> Option<NatAllocation> {
        let (ip, slot) = self.slots.use_next_free()?;
        let (port, end_port) = ports_for_slot(self.ports_per_network_interface, slot);
        Some(NatAllocation { ip, port, end_port })
    }

    /// Total number of slots
    pub fn total(&self) -> u64 {
        self.slots.total()
    }

    /// Used slots
    pub fn used(&self) -> u64 {
        self.slots.used()
    }
}
