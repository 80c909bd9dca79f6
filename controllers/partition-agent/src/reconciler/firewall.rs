//! Network policy rules as dataplane firewall entries
//!
//! Every peer CIDR of a rule becomes an `Accept` entry and each of its
//! exceptions a `Deny` entry, once per listed port. Entries keep the
//! identifier of a matching entry already in the mirror so that rewriting
//! an unchanged policy does not churn the dataplane.

use crds::metalnet::{FirewallRule, FirewallRuleAction, FirewallRuleDirection, PortMatch, ProtocolFilter};
use crds::{IPBlock, IpFamily, NetworkPolicyPort, NetworkPolicyRule, Rule};
use ipnet::IpNet;
use tracing::warn;

/// Peer prefixes of a rule without ip blocks
const ANY: [&str; 2] = ["0.0.0.0/0", "::/0"];

fn protocol_filters(ports: &[NetworkPolicyPort]) -> Vec<Option<ProtocolFilter>> {
    if ports.is_empty() {
        return vec![None];
    }
    ports
        .iter()
        .map(|port| {
            Some(ProtocolFilter {
                protocol: port.protocol.unwrap_or_default(),
                port_match: port.port.map(|first| PortMatch {
                    dst_port: first,
                    end_dst_port: port.end_port.unwrap_or(first),
                }),
            })
        })
        .collect()
}

fn entry(
    direction: FirewallRuleDirection,
    action: FirewallRuleAction,
    priority: Option<i32>,
    prefix: IpNet,
    filter: Option<ProtocolFilter>,
) -> FirewallRule {
    let (source_prefix, destination_prefix) = match direction {
        FirewallRuleDirection::Ingress => (Some(prefix.to_string()), None),
        FirewallRuleDirection::Egress => (None, Some(prefix.to_string())),
    };
    FirewallRule {
        firewall_rule_id: String::new(),
        direction,
        action,
        priority,
        ip_family: IpFamily::of(&prefix.addr()),
        source_prefix,
        destination_prefix,
        protocol_match: filter,
    }
}

fn parse(cidr: &str, policy: &str) -> Option<IpNet> {
    match cidr.parse() {
        Ok(prefix) => Some(prefix),
        Err(_) => {
            warn!(policy, cidr, "Skipping unparsable prefix");
            None
        }
    }
}

fn expand_rule(
    out: &mut Vec<FirewallRule>,
    policy: &str,
    direction: FirewallRuleDirection,
    priority: Option<i32>,
    rule: &Rule,
) {
    let any: Vec<IPBlock> = ANY
        .iter()
        .map(|cidr| IPBlock {
            cidr: (*cidr).to_string(),
            except: Vec::new(),
        })
        .collect();
    let blocks = if rule.ip_blocks.is_empty() { &any } else { &rule.ip_blocks };

    for filter in protocol_filters(&rule.network_policy_ports) {
        for block in blocks {
            let Some(prefix) = parse(&block.cidr, policy) else {
                continue;
            };
            out.push(entry(direction, FirewallRuleAction::Accept, priority, prefix, filter.clone()));
            for except in block.except.iter().filter_map(|e| parse(e, policy)) {
                out.push(entry(direction, FirewallRuleAction::Deny, priority, except, filter.clone()));
            }
        }
    }
}

/// Firewall entries of `rule`, without identifiers
pub fn expand(rule: &NetworkPolicyRule) -> Vec<FirewallRule> {
    let policy = rule.metadata.name.as_deref().unwrap_or_default();
    let mut entries = Vec::new();
    for ingress in &rule.spec.ingress_rules {
        expand_rule(&mut entries, policy, FirewallRuleDirection::Ingress, rule.spec.priority, ingress);
    }
    for egress in &rule.spec.egress_rules {
        expand_rule(&mut entries, policy, FirewallRuleDirection::Egress, rule.spec.priority, egress);
    }
    entries
}

/// Give each of `desired` the identifier of a matching `existing` entry, or
/// a fresh UUID.
pub fn assign_ids(existing: &[FirewallRule], mut desired: Vec<FirewallRule>) -> Vec<FirewallRule> {
    let mut unused: Vec<&FirewallRule> = existing.iter().collect();
    for entry in &mut desired {
        entry.firewall_rule_id = match unused.iter().position(|old| old.same_match(entry)) {
            Some(i) => unused.swap_remove(i).firewall_rule_id.clone(),
            None => uuid::Uuid::new_v4().to_string(),
        };
    }
    desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{LocalObjectReference, NetworkPolicyRuleSpec, Protocol};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn policy_rule(ingress: Vec<Rule>, egress: Vec<Rule>) -> NetworkPolicyRule {
        NetworkPolicyRule {
            metadata: ObjectMeta {
                name: Some("allow".to_string()),
                ..Default::default()
            },
            spec: NetworkPolicyRuleSpec {
                network_ref: LocalObjectReference::new("net"),
                priority: Some(100),
                targets: Vec::new(),
                ingress_rules: ingress,
                egress_rules: egress,
            },
        }
    }

    fn block(cidr: &str, except: &[&str]) -> IPBlock {
        IPBlock {
            cidr: cidr.to_string(),
            except: except.iter().map(|e| e.to_string()).collect(),
        }
    }

    fn port(protocol: Protocol, port: i32, end_port: Option<i32>) -> NetworkPolicyPort {
        NetworkPolicyPort {
            protocol: Some(protocol),
            port: Some(port),
            end_port,
        }
    }

    #[test]
    fn test_cidr_with_exceptions_per_port() {
        let rule = policy_rule(
            vec![Rule {
                ip_blocks: vec![block("10.0.0.0/8", &["10.1.0.0/16"])],
                network_policy_ports: vec![port(Protocol::Tcp, 443, None), port(Protocol::Udp, 5000, Some(5010))],
            }],
            Vec::new(),
        );

        let entries = expand(&rule);

        assert_eq!(entries.len(), 4);
        let summary: Vec<_> = entries
            .iter()
            .map(|e| {
                let filter = e.protocol_match.as_ref().unwrap();
                let ports = filter.port_match.as_ref().unwrap();
                (
                    e.action,
                    e.source_prefix.clone().unwrap(),
                    filter.protocol,
                    ports.dst_port,
                    ports.end_dst_port,
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                (FirewallRuleAction::Accept, "10.0.0.0/8".to_string(), Protocol::Tcp, 443, 443),
                (FirewallRuleAction::Deny, "10.1.0.0/16".to_string(), Protocol::Tcp, 443, 443),
                (FirewallRuleAction::Accept, "10.0.0.0/8".to_string(), Protocol::Udp, 5000, 5010),
                (FirewallRuleAction::Deny, "10.1.0.0/16".to_string(), Protocol::Udp, 5000, 5010),
            ]
        );
        assert!(entries.iter().all(|e| e.priority == Some(100)));
        assert!(entries.iter().all(|e| e.direction == FirewallRuleDirection::Ingress));
    }

    #[test]
    fn test_egress_uses_destination_prefix() {
        let rule = policy_rule(
            Vec::new(),
            vec![Rule {
                ip_blocks: vec![block("2001:db8::/32", &[])],
                network_policy_ports: Vec::new(),
            }],
        );

        let entries = expand(&rule);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, FirewallRuleDirection::Egress);
        assert_eq!(entries[0].destination_prefix.as_deref(), Some("2001:db8::/32"));
        assert_eq!(entries[0].source_prefix, None);
        assert_eq!(entries[0].ip_family, IpFamily::IPv6);
        assert_eq!(entries[0].protocol_match, None);
    }

    #[test]
    fn test_rule_without_blocks_matches_everything() {
        let rule = policy_rule(
            vec![Rule {
                ip_blocks: Vec::new(),
                network_policy_ports: vec![port(Protocol::Tcp, 22, None)],
            }],
            Vec::new(),
        );

        let prefixes: Vec<_> = expand(&rule).into_iter().filter_map(|e| e.source_prefix).collect();

        assert_eq!(prefixes, vec!["0.0.0.0/0", "::/0"]);
    }

    #[test]
    fn test_identifiers_are_reused_for_matching_entries() {
        let rule = policy_rule(
            vec![Rule {
                ip_blocks: vec![block("10.0.0.0/8", &[]), block("192.168.0.0/16", &[])],
                network_policy_ports: Vec::new(),
            }],
            Vec::new(),
        );
        let first = assign_ids(&[], expand(&rule));
        assert_ne!(first[0].firewall_rule_id, first[1].firewall_rule_id);

        let again = assign_ids(&first, expand(&rule));
        assert_eq!(again, first);

        // Dropping one block keeps the identifier of the other
        let narrowed = policy_rule(
            vec![Rule {
                ip_blocks: vec![block("192.168.0.0/16", &[])],
                network_policy_ports: Vec::new(),
            }],
            Vec::new(),
        );
        let after = assign_ids(&first, expand(&narrowed));
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].firewall_rule_id, first[1].firewall_rule_id);
    }
}
