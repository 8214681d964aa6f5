use std::collections::BTreeMap;

use remediate_types::{DisruptionBudget, DisruptionGroup, NodeRef, ObjectKey, PodRef};

use crate::PlanError;

/// Point-in-time consistent view of pods, nodes and budgets
///
/// Maps are ordered so every consumer iterates in the same order.
#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub pods: BTreeMap<ObjectKey, PodRef>,
    pub nodes: BTreeMap<String, NodeRef>,
    pub budgets: BTreeMap<ObjectKey, DisruptionBudget>,
}

impl ClusterSnapshot {
    pub fn pod(&self, key: &ObjectKey) -> Option<&PodRef> {
        self.pods.get(key)
    }

    pub fn node(&self, name: &str) -> Option<&NodeRef> {
        self.nodes.get(name)
    }

    /// Pods whose spec places them on `node`
    pub fn pods_on_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a PodRef> + 'a {
        self.pods
            .values()
            .filter(move |p| p.node.as_deref() == Some(node))
    }

    /// Budgets covering `pod`, in key order
    pub fn budgets_for<'a>(
        &'a self,
        pod: &'a PodRef,
    ) -> impl Iterator<Item = &'a DisruptionBudget> + 'a {
        self.budgets.values().filter(move |b| b.governs(pod))
    }

    /// The group that serialises evictions of `pod`
    pub fn group_of(&self, pod: &PodRef) -> DisruptionGroup {
        self.budgets_for(pod)
            .next()
            .map(|b| DisruptionGroup::Budget(b.key()))
            .unwrap_or(DisruptionGroup::Unbudgeted)
    }

    /// Resolve a pod by name, deriving its namespace from the view
    pub fn resolve_pod(&self, name: &str, namespace: Option<&str>) -> Result<&PodRef, PlanError> {
        if let Some(ns) = namespace {
            return self
                .pods
                .get(&ObjectKey::new(ns, name))
                .ok_or_else(|| PlanError::PodNotFound(format!("{}/{}", ns, name)));
        }

        let matches: Vec<&PodRef> = self.pods.values().filter(|p| p.name == name).collect();
        match matches.as_slice() {
            [] => Err(PlanError::PodNotFound(name.to_string())),
            [pod] => Ok(pod),
            many => Err(PlanError::AmbiguousPod {
                name: name.to_string(),
                namespaces: many.iter().map(|p| p.namespace.clone()).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(pods: &[(&str, &str, Option<&str>)]) -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::default();
        snapshot.nodes.insert("n1".to_string(), NodeRef::new("n1"));
        for (ns, name, node) in pods {
            let mut pod = PodRef::new(*ns, *name);
            pod.node = node.map(str::to_string);
            snapshot.pods.insert(pod.key(), pod);
        }
        snapshot
    }

    #[test]
    fn test_resolve_pod_derives_namespace() {
        let snapshot = snapshot_with(&[("prod", "web-1", Some("n1")), ("prod", "db-0", None)]);
        let pod = snapshot.resolve_pod("web-1", None).expect("resolved");
        assert_eq!(pod.namespace, "prod");
    }

    #[test]
    fn test_resolve_pod_ambiguous() {
        let snapshot = snapshot_with(&[("prod", "web-1", None), ("staging", "web-1", None)]);
        let err = snapshot.resolve_pod("web-1", None).unwrap_err();
        assert_eq!(
            err,
            PlanError::AmbiguousPod {
                name: "web-1".to_string(),
                namespaces: vec!["prod".to_string(), "staging".to_string()],
            }
        );
        assert!(snapshot.resolve_pod("web-1", Some("staging")).is_ok());
        assert!(snapshot.resolve_pod("nope", None).is_err());
    }

    #[test]
    fn test_pods_on_node() {
        let snapshot = snapshot_with(&[
            ("prod", "a", Some("n1")),
            ("prod", "b", Some("n9")),
            ("prod", "c", None),
        ]);
        let names: Vec<_> = snapshot.pods_on_node("n1").map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
        assert_eq!(snapshot.pods_on_node("n9").count(), 1);
    }
}
