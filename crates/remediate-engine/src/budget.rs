//! Disruption budget tracking
//!
//! Allowed disruptions are derived from the live pod set on every call and never
//! cached: each eviction changes the healthy count.

use remediate_types::{DisruptionBudget, PodRef, UNBOUNDED_DISRUPTIONS};

use crate::ClusterSnapshot;

/// Evaluation of one budget against a pod set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BudgetStatus {
    /// Governed pods that still count, including ones being evicted, never
    /// below the server-reported expected count
    pub expected: i32,
    pub current_healthy: i32,
    pub desired_healthy: i32,
    pub allowed: i32,
}

/// Evaluate `budget` against `pods` (pods it does not govern are ignored)
pub fn evaluate<'a, I>(budget: &DisruptionBudget, pods: I) -> BudgetStatus
where
    I: IntoIterator<Item = &'a PodRef>,
{
    let mut expected = 0;
    let mut current_healthy = 0;

    for pod in pods.into_iter().filter(|p| budget.governs(p)) {
        if pod.phase.is_terminal() {
            continue;
        }
        expected += 1;
        if pod.is_healthy() {
            current_healthy += 1;
        }
    }
    // A deleted replica leaves the live set before its replacement joins it
    let expected = expected.max(budget.reported_expected);

    let desired_healthy = budget
        .policy
        .map(|p| p.desired_healthy(expected))
        .unwrap_or(0);

    BudgetStatus {
        expected,
        current_healthy,
        desired_healthy,
        allowed: (current_healthy - desired_healthy).max(0),
    }
}

/// Additional evictions allowed for `pod` right now
///
/// The minimum over every budget governing it, or [`UNBOUNDED_DISRUPTIONS`]
/// when none does.
pub fn allowed_disruptions(snapshot: &ClusterSnapshot, pod: &PodRef) -> i32 {
    snapshot
        .budgets_for(pod)
        .map(|b| evaluate(b, snapshot.pods.values()).allowed)
        .min()
        .unwrap_or(UNBOUNDED_DISRUPTIONS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remediate_types::{
        BudgetPolicy, DisruptionGroup, IntOrPercent, LabelSelector, ObjectKey, PodPhase,
        Readiness,
    };

    fn web_pod(name: &str, healthy: bool) -> PodRef {
        let mut pod = PodRef::new("prod", name);
        pod.labels.insert("app".to_string(), "web".to_string());
        pod.phase = PodPhase::Running;
        pod.readiness = if healthy {
            Readiness::Ready
        } else {
            Readiness::NotReady
        };
        pod
    }

    fn web_budget(name: &str, policy: BudgetPolicy) -> DisruptionBudget {
        let mut budget = DisruptionBudget::new("prod", name);
        budget.selector = Some(LabelSelector::with_labels([("app", "web")]));
        budget.policy = Some(policy);
        budget
    }

    fn snapshot(pods: Vec<PodRef>, budgets: Vec<DisruptionBudget>) -> ClusterSnapshot {
        ClusterSnapshot {
            pods: pods.into_iter().map(|p| (p.key(), p)).collect(),
            nodes: Default::default(),
            budgets: budgets.into_iter().map(|b| (b.key(), b)).collect(),
        }
    }

    #[test]
    fn test_min_available() {
        let budget = web_budget("web", BudgetPolicy::MinAvailable(IntOrPercent::Int(2)));
        let pods = [web_pod("a", true), web_pod("b", true), web_pod("c", true)];

        let status = evaluate(&budget, &pods);
        assert_eq!(status.expected, 3);
        assert_eq!(status.current_healthy, 3);
        assert_eq!(status.allowed, 1);
    }

    #[test]
    fn test_unhealthy_pods_floor_at_zero() {
        let budget = web_budget("web", BudgetPolicy::MinAvailable(IntOrPercent::Int(3)));
        let pods = [web_pod("a", true), web_pod("b", false), web_pod("c", false)];
        assert_eq!(evaluate(&budget, &pods).allowed, 0);
    }

    #[test]
    fn test_max_unavailable_percent() {
        // 25% of 4 rounds up to 1 unavailable -> 3 desired healthy
        let budget = web_budget("web", BudgetPolicy::MaxUnavailable(IntOrPercent::Percent(25)));
        let pods = [
            web_pod("a", true),
            web_pod("b", true),
            web_pod("c", true),
            web_pod("d", true),
        ];
        let status = evaluate(&budget, &pods);
        assert_eq!(status.desired_healthy, 3);
        assert_eq!(status.allowed, 1);
    }

    #[test]
    fn test_pending_deletion_still_expected_but_not_healthy() {
        let budget = web_budget("web", BudgetPolicy::MaxUnavailable(IntOrPercent::Int(1)));
        let mut evicted = web_pod("a", true);
        evicted.pending_deletion = true;
        let pods = [evicted, web_pod("b", true), web_pod("c", true)];

        let status = evaluate(&budget, &pods);
        assert_eq!(status.expected, 3);
        assert_eq!(status.current_healthy, 2);
        assert_eq!(status.allowed, 0);
    }

    #[test]
    fn test_reported_expected_covers_deleted_replica() {
        let mut budget = web_budget("web", BudgetPolicy::MaxUnavailable(IntOrPercent::Int(1)));
        budget.reported_expected = 3;
        // a was evicted and is gone; its replacement does not exist yet
        let pods = [web_pod("b", true), web_pod("c", true)];

        let status = evaluate(&budget, &pods);
        assert_eq!(status.expected, 3);
        assert_eq!(status.current_healthy, 2);
        assert_eq!(status.desired_healthy, 2);
        assert_eq!(status.allowed, 0);
    }

    #[test]
    fn test_live_count_above_reported_expected() {
        let mut budget = web_budget("web", BudgetPolicy::MinAvailable(IntOrPercent::Percent(50)));
        budget.reported_expected = 2;
        let pods = [
            web_pod("a", true),
            web_pod("b", true),
            web_pod("c", true),
            web_pod("d", true),
        ];

        let status = evaluate(&budget, &pods);
        assert_eq!(status.expected, 4);
        assert_eq!(status.allowed, 2);
    }

    #[test]
    fn test_unbudgeted_pod_is_unbounded() {
        let snap = snapshot(vec![web_pod("a", true)], vec![]);
        let pod = snap.pods.values().next().expect("pod");
        assert_eq!(allowed_disruptions(&snap, pod), UNBOUNDED_DISRUPTIONS);
    }

    #[test]
    fn test_most_restrictive_budget_wins() {
        let loose = web_budget("a-loose", BudgetPolicy::MaxUnavailable(IntOrPercent::Int(2)));
        let strict = web_budget("b-strict", BudgetPolicy::MinAvailable(IntOrPercent::Int(3)));
        let snap = snapshot(
            vec![web_pod("a", true), web_pod("b", true), web_pod("c", true)],
            vec![loose, strict],
        );

        let pod = snap.pod(&ObjectKey::new("prod", "a")).expect("pod");
        assert_eq!(allowed_disruptions(&snap, pod), 0);
        assert_eq!(
            snap.group_of(pod),
            DisruptionGroup::Budget(ObjectKey::new("prod", "a-loose"))
        );
        let loose = &snap.budgets[&ObjectKey::new("prod", "a-loose")];
        assert_eq!(evaluate(loose, snap.pods.values()).allowed, 2);
    }
}
