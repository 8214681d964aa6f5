//! Conversion from k8s-openapi objects into the remediate model

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as meta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use remediate_types::{
    BudgetPolicy, DisruptionBudget, IntOrPercent, LabelSelector, NodeCondition, NodeRef,
    PodPhase, PodRef, Readiness, SelectorOperator, SelectorRequirement, WorkloadRef,
};

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Convert a k8s Pod to PodRef
pub fn pod_to_ref(pod: Pod) -> PodRef {
    let metadata = pod.metadata;
    let mut info = PodRef::new(
        metadata.namespace.unwrap_or_default(),
        metadata.name.unwrap_or_default(),
    );

    info.labels = metadata.labels.unwrap_or_default();
    info.created_at = metadata.creation_timestamp.map(|t| t.0);
    info.terminating = metadata.deletion_timestamp.is_some();
    info.mirror = metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));

    // Prefer the controlling owner; fall back to the first reference
    if let Some(owners) = metadata.owner_references {
        info.owner = owners
            .iter()
            .find(|o| o.controller == Some(true))
            .or_else(|| owners.first())
            .map(|o| WorkloadRef::new(&o.kind, &o.name));
    }

    if let Some(spec) = pod.spec {
        info.node = spec.node_name;
    }

    if let Some(status) = pod.status {
        info.phase = status
            .phase
            .as_deref()
            .map(PodPhase::from)
            .unwrap_or(PodPhase::Unknown);

        info.readiness = Readiness::from_condition_status(
            status
                .conditions
                .as_ref()
                .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
                .map(|c| c.status.as_str()),
        );

        info.restart_count = status
            .container_statuses
            .as_ref()
            .map(|cs| cs.iter().map(|c| c.restart_count).sum())
            .unwrap_or(0);
    }

    info
}

/// Convert a k8s Node to NodeRef (pods are attached later, from the pod view)
pub fn node_to_ref(node: Node) -> NodeRef {
    let mut info = NodeRef::new(node.metadata.name.unwrap_or_default());

    if let Some(spec) = node.spec {
        info.unschedulable = spec.unschedulable.unwrap_or(false);
    }

    let ready = node
        .status
        .and_then(|s| s.conditions)
        .and_then(|conds| conds.into_iter().find(|c| c.type_ == "Ready"));

    if let Some(ready) = ready {
        info.condition = NodeCondition::from_condition_status(Some(&ready.status));
        info.condition_since = ready.last_transition_time.map(|t| t.0);
    }

    info
}

/// Convert a policy/v1 PodDisruptionBudget to DisruptionBudget
pub fn budget_to_model(pdb: PodDisruptionBudget) -> DisruptionBudget {
    let mut budget = DisruptionBudget::new(
        pdb.metadata.namespace.unwrap_or_default(),
        pdb.metadata.name.unwrap_or_default(),
    );

    if let Some(spec) = pdb.spec {
        budget.selector = spec.selector.map(selector_to_model);

        // maxUnavailable wins when both are set, matching the disruption controller
        budget.policy = match (spec.max_unavailable, spec.min_available) {
            (Some(max), _) => int_or_string(&max).map(BudgetPolicy::MaxUnavailable),
            (None, Some(min)) => int_or_string(&min).map(BudgetPolicy::MinAvailable),
            (None, None) => None,
        };
    }

    if let Some(status) = pdb.status {
        budget.current_healthy = status.current_healthy;
        budget.expected_pods = status.expected_pods;
        budget.reported_expected = status.expected_pods;
    }

    budget
}

fn selector_to_model(selector: meta::LabelSelector) -> LabelSelector {
    LabelSelector {
        match_labels: selector.match_labels.unwrap_or_default(),
        match_expressions: selector
            .match_expressions
            .unwrap_or_default()
            .into_iter()
            .filter_map(|req| {
                let Some(operator) = SelectorOperator::parse(&req.operator) else {
                    tracing::warn!(operator = %req.operator, key = %req.key, "Ignoring unknown selector operator");
                    return None;
                };
                Some(SelectorRequirement {
                    key: req.key,
                    operator,
                    values: req.values.unwrap_or_default(),
                })
            })
            .collect(),
    }
}

fn int_or_string(value: &IntOrString) -> Option<IntOrPercent> {
    match value {
        IntOrString::Int(i) => Some(IntOrPercent::Int(*i)),
        IntOrString::String(s) => IntOrPercent::parse(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerStatus, NodeSpec, NodeStatus, PodCondition, PodSpec, PodStatus,
    };
    use k8s_openapi::api::policy::v1::{PodDisruptionBudgetSpec, PodDisruptionBudgetStatus};
    use std::collections::BTreeMap;

    #[test]
    fn test_pod_to_ref() {
        let pod = Pod {
            metadata: meta::ObjectMeta {
                name: Some("web-1".to_string()),
                namespace: Some("prod".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                owner_references: Some(vec![meta::OwnerReference {
                    kind: "ReplicaSet".to_string(),
                    name: "web-abc".to_string(),
                    controller: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("n1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![
                    ContainerStatus {
                        restart_count: 2,
                        ..Default::default()
                    },
                    ContainerStatus {
                        restart_count: 1,
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
        };

        let info = pod_to_ref(pod);
        assert_eq!(info.namespace, "prod");
        assert_eq!(info.node.as_deref(), Some("n1"));
        assert_eq!(info.owner, Some(WorkloadRef::new("ReplicaSet", "web-abc")));
        assert_eq!(info.readiness, Readiness::Ready);
        assert_eq!(info.restart_count, 3);
        assert!(info.is_healthy());
        assert!(!info.mirror);
    }

    #[test]
    fn test_node_to_ref() {
        let node = Node {
            metadata: meta::ObjectMeta {
                name: Some("n1".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                conditions: Some(vec![k8s_openapi::api::core::v1::NodeCondition {
                    type_: "Ready".to_string(),
                    status: "Unknown".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };

        let info = node_to_ref(node);
        assert_eq!(info.name, "n1");
        assert!(info.unschedulable);
        assert_eq!(info.condition, NodeCondition::Unknown);
    }

    #[test]
    fn test_budget_to_model_percent() {
        let pdb = PodDisruptionBudget {
            metadata: meta::ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                min_available: Some(IntOrString::String("50%".to_string())),
                selector: Some(meta::LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "app".to_string(),
                        "web".to_string(),
                    )])),
                    match_expressions: Some(vec![meta::LabelSelectorRequirement {
                        key: "tier".to_string(),
                        operator: "Bogus".to_string(),
                        values: None,
                    }]),
                }),
                ..Default::default()
            }),
            status: None,
        };

        let budget = budget_to_model(pdb);
        assert_eq!(
            budget.policy,
            Some(BudgetPolicy::MinAvailable(IntOrPercent::Percent(50)))
        );
        let selector = budget.selector.expect("selector");
        assert_eq!(selector.match_labels.len(), 1);
        assert!(selector.match_expressions.is_empty());
    }

    #[test]
    fn test_budget_to_model_keeps_reported_expected() {
        let pdb = PodDisruptionBudget {
            metadata: meta::ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                max_unavailable: Some(IntOrString::Int(1)),
                min_available: Some(IntOrString::Int(2)),
                ..Default::default()
            }),
            status: Some(PodDisruptionBudgetStatus {
                current_healthy: 2,
                expected_pods: 3,
                ..Default::default()
            }),
        };

        let budget = budget_to_model(pdb);
        assert_eq!(
            budget.policy,
            Some(BudgetPolicy::MaxUnavailable(IntOrPercent::Int(1)))
        );
        assert_eq!(budget.reported_expected, 3);
        assert_eq!(budget.current_healthy, 2);
    }
}
