//! Fabric IPAM
//!
//! Allocation core of the fabric control plane. Everything in this crate is
//! in-memory and CPU-bound: callers persist allocations through the API server
//! and rehydrate the allocators on startup.
//!
//! - [`IPSet`]: immutable IPv4/IPv6 address sets with deterministic prefix carving
//! - [`KeySlots`]: fixed `keys x slots` bitset matrix
//! - [`PublicIPAllocator`]: public address allocator over configured prefix pools
//! - [`VNIAllocator`]: virtual network identifier allocator over `[min, max]`
//! - [`AllocationManager`]: NAT `(ip, port, endPort)` allocator on top of [`KeySlots`]

pub mod error;
pub mod ipset;
pub mod keyslots;
pub mod nat;
pub mod public_ip;
pub mod released;
pub mod vni;

pub use error::{AllocationError, ConfigError, KeySlotsError, NatError};
pub use ipset::{IPRange, IPSet, IPSetBuilder, IpFamily};
pub use keyslots::KeySlots;
pub use nat::{
    AllocationManager, NatAllocation, MAX_EPHEMERAL_PORT, MIN_EPHEMERAL_PORT,
    NO_OF_EPHEMERAL_PORTS,
};
pub use public_ip::{AddressRequest, Allocation, PublicIPAllocator};
pub use released::{ReleasedReceiver, ReleasedSender};
pub use vni::{VNIAllocator, MAX_VNI};
