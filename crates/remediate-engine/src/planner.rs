//! Eviction planning
//!
//! Turns a remediation request into an ordered, deterministic list of evictions.
//! Candidates are grouped by governing budget, sorted least healthy first, and
//! the groups are interleaved round-robin so no group monopolises the front of
//! the plan.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use remediate_types::{
    DisruptionGroup, EvictionPlanEntry, EvictionReason, NodeCondition, ObjectKey, PodRef,
    RemediationRequest,
};

use crate::{ClusterSnapshot, PlanError};

/// Why a pod on a drained node was left out of the plan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    DaemonSet,
    MirrorPod,
    Completed,
    AlreadyTerminating,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DaemonSet => "managed by a DaemonSet",
            Self::MirrorPod => "static mirror pod",
            Self::Completed => "already completed",
            Self::AlreadyTerminating => "already terminating",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvictionPlan {
    pub entries: Vec<EvictionPlanEntry>,
    pub skipped: Vec<(ObjectKey, SkipReason)>,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Health class, least healthy first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Health {
    NodeDown,
    PodNotReady,
    Healthy,
}

impl Health {
    fn of(pod: &PodRef, snapshot: &ClusterSnapshot) -> Self {
        let node_down = pod
            .node
            .as_deref()
            .and_then(|n| snapshot.node(n))
            .is_some_and(|n| n.condition != NodeCondition::Ready);

        if node_down {
            Self::NodeDown
        } else if !pod.is_healthy() {
            Self::PodNotReady
        } else {
            Self::Healthy
        }
    }

    fn priority(&self) -> u8 {
        match self {
            Self::NodeDown => 3,
            Self::PodNotReady => 2,
            Self::Healthy => 1,
        }
    }
}

/// Build the plan for `request` against `snapshot`
pub fn plan(
    snapshot: &ClusterSnapshot,
    request: &RemediationRequest,
) -> Result<EvictionPlan, PlanError> {
    let mut skipped = Vec::new();

    let (candidates, reason) = match request {
        RemediationRequest::DrainNode { node, reason } => {
            if snapshot.node(node).is_none() {
                return Err(PlanError::NodeNotFound(node.clone()));
            }

            let candidates = snapshot
                .pods_on_node(node)
                .filter(|pod| match drain_skip_reason(pod) {
                    Some(skip) => {
                        debug!(pod = %pod.key(), reason = skip.as_str(), "Not draining pod");
                        skipped.push((pod.key(), skip));
                        false
                    }
                    None => true,
                })
                .cloned()
                .collect::<Vec<_>>();
            (candidates, reason)
        }

        RemediationRequest::EvictPods { pods, reason } => {
            let unique: BTreeSet<&ObjectKey> = pods.iter().collect();
            let mut candidates = Vec::with_capacity(unique.len());
            for key in unique {
                match snapshot.pod(key) {
                    Some(pod) if pod.is_going_away() => {
                        skipped.push((key.clone(), SkipReason::AlreadyTerminating));
                    }
                    Some(pod) => candidates.push(pod.clone()),
                    // Unknown to the view; the API decides (usually 404)
                    None => candidates.push(PodRef::new(&key.namespace, &key.name)),
                }
            }
            (candidates, reason)
        }
    };

    let mut groups: BTreeMap<DisruptionGroup, Vec<(Health, PodRef)>> = BTreeMap::new();
    for pod in candidates {
        let health = Health::of(&pod, snapshot);
        groups
            .entry(snapshot.group_of(&pod))
            .or_default()
            .push((health, pod));
    }

    let mut lanes: Vec<VecDeque<EvictionPlanEntry>> = groups
        .into_iter()
        .map(|(group, mut pods)| {
            pods.sort_by(|(ha, a), (hb, b)| {
                ha.cmp(hb)
                    .then_with(|| Reverse(a.restart_count).cmp(&Reverse(b.restart_count)))
                    .then_with(|| age_order(a).cmp(&age_order(b)))
                    .then_with(|| a.key().cmp(&b.key()))
            });
            pods.into_iter()
                .map(|(health, pod)| EvictionPlanEntry {
                    pod,
                    reason: reason.clone(),
                    priority: health.priority(),
                    group: group.clone(),
                })
                .collect()
        })
        .collect();

    // Groups whose worst pod is least healthy go first in every round
    lanes.sort_by_key(|lane| lane.front().map(|e| Reverse(e.priority)));

    let mut entries = Vec::new();
    while lanes.iter().any(|l| !l.is_empty()) {
        for lane in lanes.iter_mut() {
            if let Some(entry) = lane.pop_front() {
                entries.push(entry);
            }
        }
    }

    Ok(EvictionPlan { entries, skipped })
}

/// kubectl drain semantics for pods we leave alone
fn drain_skip_reason(pod: &PodRef) -> Option<SkipReason> {
    if pod.phase.is_terminal() {
        Some(SkipReason::Completed)
    } else if pod.is_going_away() {
        Some(SkipReason::AlreadyTerminating)
    } else if pod.is_daemon_set() {
        Some(SkipReason::DaemonSet)
    } else if pod.mirror {
        Some(SkipReason::MirrorPod)
    } else {
        None
    }
}

/// Oldest first; pods without a creation time sort last
fn age_order(pod: &PodRef) -> (bool, Option<chrono::DateTime<chrono::Utc>>) {
    (pod.created_at.is_none(), pod.created_at)
}

/// Convenience for the executor and dry runs
pub fn reason_for(request: &RemediationRequest) -> &EvictionReason {
    match request {
        RemediationRequest::DrainNode { reason, .. } => reason,
        RemediationRequest::EvictPods { reason, .. } => reason,
    }
}
