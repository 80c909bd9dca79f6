//! Fabric CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the fabric control plane
//! (`fabric.microscaler.io`) and the metalnet dataplane mirror
//! (`metalnet.microscaler.io`).

pub mod broker;
pub mod common;
pub mod instance;
pub mod ip;
pub mod load_balancer;
pub mod metalnet;
pub mod nat;
pub mod network;
pub mod network_interface;
pub mod network_policy;
pub mod node;
pub mod public_ip;
pub mod references;
pub mod virtual_ip;

pub use broker::*;
pub use common::*;
pub use instance::*;
pub use ip::*;
pub use load_balancer::*;
pub use nat::*;
pub use network::*;
pub use network_interface::*;
pub use network_policy::*;
pub use node::*;
pub use public_ip::*;
pub use references::*;
pub use virtual_ip::*;
