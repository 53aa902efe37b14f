//! Node filters for capacity planning.
//!
//! Reduce a node list to the nodes a workload's pods could land on. The
//! filters mirror the scheduler's hard constraints: explicit node name,
//! taints and tolerations, and required node affinity. Soft (preferred)
//! scheduling constraints are ignored on purpose.

use k8s_openapi::api::core::v1::{Node, NodeSelectorRequirement, NodeSelectorTerm, Taint, Toleration};
use kube::ResourceExt;

use crate::api::TargetedWorkload;
use crate::error::{Error, Result};

const TAINT_NO_SCHEDULE: &str = "NoSchedule";
const TAINT_NO_EXECUTE: &str = "NoExecute";

/// Drops nodes marked unschedulable.
pub fn schedulable(nodes: Vec<Node>) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(|node| {
            !node
                .spec
                .as_ref()
                .and_then(|spec| spec.unschedulable)
                .unwrap_or(false)
        })
        .collect()
}

/// If the pod template pins a node, only that node remains.
pub fn node_name(target: &TargetedWorkload, nodes: Vec<Node>) -> Vec<Node> {
    let Some(pinned) = target.pod_spec.node_name.as_deref() else {
        return nodes;
    };
    nodes
        .into_iter()
        .filter(|node| node.name_any() == pinned)
        .take(1)
        .collect()
}

/// Keeps nodes whose NoSchedule/NoExecute taints are all tolerated.
pub fn taint_toleration(target: &TargetedWorkload, nodes: Vec<Node>) -> Vec<Node> {
    let no_tolerations: Vec<Toleration> = Vec::new();
    let tolerations = target.pod_spec.tolerations.as_ref().unwrap_or(&no_tolerations);
    nodes
        .into_iter()
        .filter(|node| {
            let taints = node.spec.as_ref().and_then(|spec| spec.taints.as_ref());
            taints.into_iter().flatten().all(|taint| {
                if taint.effect != TAINT_NO_SCHEDULE && taint.effect != TAINT_NO_EXECUTE {
                    return true;
                }
                tolerations.iter().any(|toleration| tolerates(toleration, taint))
            })
        })
        .collect()
}

fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    let effect = toleration.effect.as_deref().unwrap_or_default();
    if !effect.is_empty() && effect != taint.effect {
        return false;
    }
    let key = toleration.key.as_deref().unwrap_or_default();
    if !key.is_empty() && key != taint.key {
        return false;
    }
    let value = toleration.value.as_deref().unwrap_or_default();
    match toleration.operator.as_deref().unwrap_or_default() {
        "" | "Equal" => value == taint.value.as_deref().unwrap_or_default(),
        "Exists" => value.is_empty(),
        _ => false,
    }
}

/// Keeps nodes matching the pod's node selector and required node affinity.
pub fn node_affinity(target: &TargetedWorkload, nodes: Vec<Node>) -> Result<Vec<Node>> {
    let selector = target.pod_spec.node_selector.as_ref();
    let required = target
        .pod_spec
        .affinity
        .as_ref()
        .and_then(|affinity| affinity.node_affinity.as_ref())
        .and_then(|node_affinity| {
            node_affinity
                .required_during_scheduling_ignored_during_execution
                .as_ref()
        });

    let mut matched = Vec::new();
    for node in nodes {
        if let Some(selector) = selector {
            let labels = node.labels();
            if !selector
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
            {
                continue;
            }
        }
        if let Some(required) = required {
            let mut any_term = false;
            for term in &required.node_selector_terms {
                if matches_term(term, &node)? {
                    any_term = true;
                    break;
                }
            }
            if !any_term {
                continue;
            }
        }
        matched.push(node);
    }
    Ok(matched)
}

/// Terms are ORed; requirements within a term are ANDed. An empty term
/// matches nothing.
fn matches_term(term: &NodeSelectorTerm, node: &Node) -> Result<bool> {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    if expressions.is_empty() && fields.is_empty() {
        return Ok(false);
    }
    for requirement in expressions {
        if !matches_expression(requirement, node)? {
            return Ok(false);
        }
    }
    for requirement in fields {
        if !matches_field(requirement, node)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_expression(requirement: &NodeSelectorRequirement, node: &Node) -> Result<bool> {
    let labels = node.labels();
    let current = labels.get(&requirement.key);
    let values = requirement.values.as_deref().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => Ok(current.is_some_and(|value| values.iter().any(|v| v == value))),
        "NotIn" => Ok(!current.is_some_and(|value| values.iter().any(|v| v == value))),
        "Exists" => Ok(current.is_some()),
        "DoesNotExist" => Ok(current.is_none()),
        "Gt" | "Lt" => {
            let Some(current) = current else {
                return Ok(false);
            };
            if values.len() != 1 {
                return Err(Error::NodeSelectorError(format!(
                    "operator {} requires exactly one value for key {}",
                    requirement.operator, requirement.key
                )));
            }
            let lhs: i64 = current.parse().map_err(|_| {
                Error::NodeSelectorError(format!("label {} is not an integer", requirement.key))
            })?;
            let rhs: i64 = values[0].parse().map_err(|_| {
                Error::NodeSelectorError(format!("value for {} is not an integer", requirement.key))
            })?;
            Ok(if requirement.operator == "Gt" {
                lhs > rhs
            } else {
                lhs < rhs
            })
        }
        other => Err(Error::NodeSelectorError(format!(
            "unsupported operator {other}"
        ))),
    }
}

/// Only `metadata.name` is addressable through match fields.
fn matches_field(requirement: &NodeSelectorRequirement, node: &Node) -> Result<bool> {
    if requirement.key != "metadata.name" {
        return Err(Error::NodeSelectorError(format!(
            "unsupported field selector key {}",
            requirement.key
        )));
    }
    let name = node.name_any();
    let values = requirement.values.as_deref().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => Ok(values.iter().any(|value| *value == name)),
        "NotIn" => Ok(!values.iter().any(|value| *value == name)),
        other => Err(Error::NodeSelectorError(format!(
            "unsupported field selector operator {other}"
        ))),
    }
}

/// Runs all pod-dependent filters: node name first as it is the sharpest,
/// taints next as they rule out whole node classes, affinity last as it is
/// the most expensive check.
pub fn evaluate(target: &TargetedWorkload, nodes: Vec<Node>) -> Result<Vec<Node>> {
    let nodes = node_name(target, nodes);
    let nodes = taint_toleration(target, nodes);
    node_affinity(target, nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Affinity, NodeAffinity, NodeSelector, NodeSpec, PodSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use std::collections::BTreeMap;

    use crate::api::WorkloadKind;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Node::default()
        }
    }

    fn labeled_node(name: &str, labels: &[(&str, &str)]) -> Node {
        let mut node = node(name);
        node.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        node
    }

    fn tainted_node(name: &str, key: &str, value: &str, effect: &str) -> Node {
        let mut node = node(name);
        node.spec = Some(NodeSpec {
            taints: Some(vec![Taint {
                key: key.to_string(),
                value: Some(value.to_string()),
                effect: effect.to_string(),
                ..Taint::default()
            }]),
            ..NodeSpec::default()
        });
        node
    }

    fn target_with_pod_spec(pod_spec: PodSpec) -> TargetedWorkload {
        TargetedWorkload {
            kind: WorkloadKind::Deployment,
            meta: ObjectMeta {
                name: Some("backend".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            pod_spec,
            selector: LabelSelector::default(),
            replicas: Some(1),
        }
    }

    fn names(nodes: &[Node]) -> Vec<String> {
        nodes.iter().map(|n| n.name_any()).collect()
    }

    #[test]
    fn schedulable_removes_cordoned_nodes() {
        let mut cordoned = node("cordoned");
        cordoned.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..NodeSpec::default()
        });
        let kept = schedulable(vec![node("ready"), cordoned]);
        assert_eq!(names(&kept), vec!["ready"]);
    }

    #[test]
    fn node_name_passes_through_without_pinning() {
        let target = target_with_pod_spec(PodSpec::default());
        let kept = node_name(&target, vec![node("a"), node("b")]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn node_name_keeps_only_the_pinned_node() {
        let target = target_with_pod_spec(PodSpec {
            node_name: Some("b".to_string()),
            ..PodSpec::default()
        });
        let kept = node_name(&target, vec![node("a"), node("b"), node("c")]);
        assert_eq!(names(&kept), vec!["b"]);

        let none = node_name(&target, vec![node("a"), node("c")]);
        assert!(none.is_empty());
    }

    #[test]
    fn taint_toleration_keeps_untainted_nodes() {
        let target = target_with_pod_spec(PodSpec::default());
        let kept = taint_toleration(&target, vec![node("plain")]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn taint_toleration_removes_untolerated_nodes() {
        let target = target_with_pod_spec(PodSpec::default());
        let kept = taint_toleration(
            &target,
            vec![
                tainted_node("control-plane", "node-role", "master", "NoSchedule"),
                node("worker"),
            ],
        );
        assert_eq!(names(&kept), vec!["worker"]);
    }

    #[test]
    fn taint_toleration_honors_matching_tolerations() {
        let target = target_with_pod_spec(PodSpec {
            tolerations: Some(vec![Toleration {
                key: Some("node-role".to_string()),
                operator: Some("Equal".to_string()),
                value: Some("master".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Toleration::default()
            }]),
            ..PodSpec::default()
        });
        let kept = taint_toleration(
            &target,
            vec![tainted_node("control-plane", "node-role", "master", "NoSchedule")],
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn taint_toleration_ignores_prefer_no_schedule() {
        let target = target_with_pod_spec(PodSpec::default());
        let kept = taint_toleration(
            &target,
            vec![tainted_node("soft", "zone", "edge", "PreferNoSchedule")],
        );
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn wildcard_toleration_tolerates_everything() {
        let target = target_with_pod_spec(PodSpec {
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Toleration::default()
            }]),
            ..PodSpec::default()
        });
        let kept = taint_toleration(
            &target,
            vec![tainted_node("any", "whatever", "x", "NoExecute")],
        );
        assert_eq!(kept.len(), 1);
    }

    fn affinity_on(key: &str, operator: &str, values: &[&str]) -> Affinity {
        Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: key.to_string(),
                            operator: operator.to_string(),
                            values: Some(values.iter().map(|v| v.to_string()).collect()),
                        }]),
                        ..NodeSelectorTerm::default()
                    }],
                }),
                ..NodeAffinity::default()
            }),
            ..Affinity::default()
        }
    }

    #[test]
    fn node_affinity_keeps_everything_without_affinity() {
        let target = target_with_pod_spec(PodSpec::default());
        let kept = node_affinity(&target, vec![node("a"), node("b")]).unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn node_affinity_filters_on_required_expressions() {
        let target = target_with_pod_spec(PodSpec {
            affinity: Some(affinity_on("zone", "In", &["a"])),
            ..PodSpec::default()
        });
        let kept = node_affinity(
            &target,
            vec![
                labeled_node("in-zone", &[("zone", "a")]),
                labeled_node("out-of-zone", &[("zone", "b")]),
                node("unlabeled"),
            ],
        )
        .unwrap();
        assert_eq!(names(&kept), vec!["in-zone"]);
    }

    #[test]
    fn node_affinity_not_in_matches_missing_labels() {
        let target = target_with_pod_spec(PodSpec {
            affinity: Some(affinity_on("zone", "NotIn", &["a"])),
            ..PodSpec::default()
        });
        let kept = node_affinity(
            &target,
            vec![labeled_node("in-zone", &[("zone", "a")]), node("unlabeled")],
        )
        .unwrap();
        assert_eq!(names(&kept), vec!["unlabeled"]);
    }

    #[test]
    fn node_affinity_supports_gt_and_rejects_bad_values() {
        let target = target_with_pod_spec(PodSpec {
            affinity: Some(affinity_on("cpus", "Gt", &["8"])),
            ..PodSpec::default()
        });
        let kept = node_affinity(
            &target,
            vec![
                labeled_node("big", &[("cpus", "16")]),
                labeled_node("small", &[("cpus", "4")]),
            ],
        )
        .unwrap();
        assert_eq!(names(&kept), vec!["big"]);

        let err = node_affinity(&target, vec![labeled_node("weird", &[("cpus", "many")])]);
        assert!(err.is_err());
    }

    #[test]
    fn node_affinity_honors_plain_node_selector() {
        let mut selector = BTreeMap::new();
        selector.insert("disk".to_string(), "ssd".to_string());
        let target = target_with_pod_spec(PodSpec {
            node_selector: Some(selector),
            ..PodSpec::default()
        });
        let kept = node_affinity(
            &target,
            vec![labeled_node("ssd", &[("disk", "ssd")]), node("spinning")],
        )
        .unwrap();
        assert_eq!(names(&kept), vec!["ssd"]);
    }

    #[test]
    fn evaluate_composes_all_filters() {
        let target = target_with_pod_spec(PodSpec {
            affinity: Some(affinity_on("zone", "In", &["a"])),
            ..PodSpec::default()
        });
        let mut cordoned = labeled_node("cordoned", &[("zone", "a")]);
        cordoned.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..NodeSpec::default()
        });
        let nodes = schedulable(vec![
            labeled_node("good", &[("zone", "a")]),
            tainted_node("tainted", "dedicated", "db", "NoSchedule"),
            labeled_node("wrong-zone", &[("zone", "b")]),
            cordoned,
        ]);
        let kept = evaluate(&target, nodes).unwrap();
        assert_eq!(names(&kept), vec!["good"]);
    }
}
