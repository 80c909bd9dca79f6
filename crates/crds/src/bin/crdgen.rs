//! Print every fabric CRD as a multi-document YAML stream.

use crds::{
    DaemonSet, IP, IPAddress, Instance, LoadBalancer, LoadBalancerRouting, NATGateway,
    NATGatewayAutoscaler, NATTable, Network, NetworkID, NetworkInterface, NetworkPolicy,
    NetworkPolicyRule, Node, PublicIP, VirtualIP, metalnet,
};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        PublicIP::crd(),
        IP::crd(),
        IPAddress::crd(),
        VirtualIP::crd(),
        Network::crd(),
        NetworkID::crd(),
        NATGateway::crd(),
        NATTable::crd(),
        NATGatewayAutoscaler::crd(),
        LoadBalancer::crd(),
        LoadBalancerRouting::crd(),
        DaemonSet::crd(),
        Instance::crd(),
        Node::crd(),
        NetworkInterface::crd(),
        NetworkPolicy::crd(),
        NetworkPolicyRule::crd(),
        metalnet::NetworkInterface::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
