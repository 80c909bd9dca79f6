//! Label and node selector matching

use crds::{LabelSelector, LabelSelectorOperator, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm};
use std::collections::BTreeMap;

fn requirement_matches(
    key: &str,
    operator: LabelSelectorOperator,
    values: &[String],
    labels: &BTreeMap<String, String>,
) -> bool {
    let value = labels.get(key);
    match operator {
        LabelSelectorOperator::In => value.is_some_and(|v| values.contains(v)),
        LabelSelectorOperator::NotIn => value.is_none_or(|v| !values.contains(v)),
        LabelSelectorOperator::Exists => value.is_some(),
        LabelSelectorOperator::DoesNotExist => value.is_none(),
    }
}

/// Whether `labels` satisfies `selector`; an empty selector matches everything.
pub fn matches_label_selector(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    selector
        .match_labels
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
        && selector
            .match_expressions
            .iter()
            .all(|r| requirement_matches(&r.key, r.operator, &r.values, labels))
}

/// Whether `labels` satisfies an optional selector; `None` matches everything.
pub fn matches_optional_selector(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> bool {
    selector.is_none_or(|s| matches_label_selector(s, labels))
}

fn node_requirement_matches(req: &NodeSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    requirement_matches(&req.key, req.operator, &req.values, labels)
}

/// Whether `labels` satisfies every requirement of `term`.
///
/// A term without requirements matches nothing, as in Kubernetes.
pub fn matches_node_selector_term(term: &NodeSelectorTerm, labels: &BTreeMap<String, String>) -> bool {
    !term.match_expressions.is_empty()
        && term
            .match_expressions
            .iter()
            .all(|r| node_requirement_matches(r, labels))
}

/// Whether `labels` satisfies any term of `selector`
pub fn matches_node_selector(selector: &NodeSelector, labels: &BTreeMap<String, String>) -> bool {
    selector
        .node_selector_terms
        .iter()
        .any(|t| matches_node_selector_term(t, labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_label_selector() {
        let selector = LabelSelector {
            match_labels: labels(&[("app", "web")]),
            match_expressions: vec![
                LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: LabelSelectorOperator::In,
                    values: vec!["front".to_string(), "edge".to_string()],
                },
                LabelSelectorRequirement {
                    key: "legacy".to_string(),
                    operator: LabelSelectorOperator::DoesNotExist,
                    values: vec![],
                },
            ],
        };
        assert!(matches_label_selector(&selector, &labels(&[("app", "web"), ("tier", "edge")])));
        assert!(!matches_label_selector(&selector, &labels(&[("app", "web"), ("tier", "db")])));
        assert!(!matches_label_selector(
            &selector,
            &labels(&[("app", "web"), ("tier", "edge"), ("legacy", "1")])
        ));
        assert!(matches_label_selector(&LabelSelector::default(), &labels(&[])));
        assert!(matches_optional_selector(None, &labels(&[])));
    }

    #[test]
    fn test_node_selector() {
        let selector = NodeSelector {
            node_selector_terms: vec![
                NodeSelectorTerm { match_expressions: vec![] },
                NodeSelectorTerm {
                    match_expressions: vec![NodeSelectorRequirement {
                        key: "zone".to_string(),
                        operator: LabelSelectorOperator::NotIn,
                        values: vec!["z1".to_string()],
                    }],
                },
            ],
        };
        assert!(matches_node_selector(&selector, &labels(&[("zone", "z2")])));
        assert!(matches_node_selector(&selector, &labels(&[])));
        assert!(!matches_node_selector(&selector, &labels(&[("zone", "z1")])));
    }
}
