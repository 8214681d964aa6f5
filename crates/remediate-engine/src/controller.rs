//! Long-running remediation loop
//!
//! Periodically inspects the observer's view, turns unhealthy nodes and pods
//! into remediation requests and runs them through the planner and executor.
//! Node changes published by the observer trigger an early scan.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use remediate_k8s::ClusterApi;
use remediate_types::{
    EvictionReason, NodeCondition, PodPhase, Readiness, RemediationRequest, ResourceKind,
};

use crate::config::ControllerConfig;
use crate::executor::{EvictionExecutor, ExecutionReport};
use crate::observer::{ClusterObserver, StateChange};
use crate::{ClusterSnapshot, planner};

/// Find what needs remediating in `snapshot`
///
/// `draining` tracks nodes already drained during their current NotReady
/// episode; a node leaves it once it reports Ready again or disappears.
pub fn detect_remediations(
    snapshot: &ClusterSnapshot,
    now: DateTime<Utc>,
    config: &ControllerConfig,
    draining: &mut HashSet<String>,
) -> Vec<RemediationRequest> {
    let mut requests = Vec::new();
    let grace = chrono::Duration::from_std(config.node_not_ready_grace())
        .unwrap_or(chrono::Duration::MAX);

    draining.retain(|name| {
        snapshot
            .node(name)
            .is_some_and(|n| n.condition != NodeCondition::Ready)
    });

    for node in snapshot.nodes.values() {
        if node.condition == NodeCondition::Ready || draining.contains(&node.name) {
            continue;
        }
        let overdue = node
            .condition_since
            .is_some_and(|since| now.signed_duration_since(since) >= grace);
        if overdue {
            info!(node = %node.name, condition = node.condition.as_str(), "Node not ready past grace period");
            draining.insert(node.name.clone());
            requests.push(RemediationRequest::DrainNode {
                node: node.name.clone(),
                reason: EvictionReason::NodeNotReady {
                    node: node.name.clone(),
                },
            });
        }
    }

    let unhealthy: Vec<_> = snapshot
        .pods
        .values()
        .filter(|pod| {
            let on_ready_node = pod
                .node
                .as_deref()
                .and_then(|n| snapshot.node(n))
                .is_some_and(|n| n.condition == NodeCondition::Ready);
            let crash_looping = pod.readiness == Readiness::NotReady
                && pod.restart_count >= config.unhealthy_restart_threshold;

            on_ready_node
                && !pod.is_going_away()
                && !pod.is_daemon_set()
                && !pod.mirror
                && (pod.phase == PodPhase::Failed || crash_looping)
        })
        .map(|pod| pod.key())
        .collect();

    if !unhealthy.is_empty() {
        debug!(pods = unhealthy.len(), "Found unhealthy pods");
        requests.push(RemediationRequest::EvictPods {
            pods: unhealthy,
            reason: EvictionReason::PodUnhealthy,
        });
    }

    requests
}

pub struct RemediationController {
    api: Arc<dyn ClusterApi>,
    observer: ClusterObserver,
    executor: EvictionExecutor,
    config: ControllerConfig,
    draining: HashSet<String>,
}

impl RemediationController {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        observer: ClusterObserver,
        executor: EvictionExecutor,
        config: ControllerConfig,
    ) -> Self {
        Self {
            api,
            observer,
            executor,
            config,
            draining: HashSet::new(),
        }
    }

    /// Scan until `cancel` fires; returns every outcome recorded along the way
    pub async fn run(mut self, cancel: CancellationToken) -> ExecutionReport {
        let mut events = self.observer.subscribe();
        let mut ticker = tokio::time::interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = ExecutionReport::default();

        info!(
            interval_secs = self.config.scan_interval_secs,
            grace_secs = self.config.node_not_ready_grace_secs,
            "Remediation controller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                changed = next_node_change(&mut events) => {
                    if !changed {
                        break;
                    }
                }
            }

            let report = self.reconcile(Utc::now(), &cancel).await;
            total.outcomes.extend(report.outcomes);
        }

        info!("Remediation controller stopped");
        total
    }

    /// One scan: detect, cordon, plan and execute
    pub async fn reconcile(&mut self, now: DateTime<Utc>, cancel: &CancellationToken) -> ExecutionReport {
        let snapshot = self.observer.snapshot();
        let requests = detect_remediations(&snapshot, now, &self.config, &mut self.draining);
        let mut report = ExecutionReport::default();

        for request in requests {
            if cancel.is_cancelled() {
                break;
            }

            if let RemediationRequest::DrainNode { node, .. } = &request {
                let unschedulable = snapshot.node(node).is_some_and(|n| n.unschedulable);
                if self.config.cordon && !unschedulable {
                    match self.api.cordon(node).await {
                        Ok(()) => info!(%node, "Cordoned node"),
                        Err(e) => warn!(%node, error = %e, "Failed to cordon node"),
                    }
                }
            }

            // Plan against the freshest view; earlier requests changed it
            let plan = match planner::plan(&self.observer.snapshot(), &request) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(error = %e, "Cannot plan remediation");
                    continue;
                }
            };
            if plan.is_empty() {
                continue;
            }

            let outcome = self.executor.execute(&plan, cancel).await;
            report.outcomes.extend(outcome.outcomes);
        }

        report
    }
}

/// Resolves to `true` on the next node change, `false` once the observer is gone
async fn next_node_change(events: &mut broadcast::Receiver<StateChange>) -> bool {
    loop {
        match events.recv().await {
            Ok(StateChange::Applied { kind, .. }) | Ok(StateChange::Deleted { kind, .. })
                if kind == ResourceKind::Node =>
            {
                return true;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Controller lagged behind state changes");
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fake::{FakeCluster, ready_pod};
    use chrono::TimeZone;
    use remediate_k8s::ObjectList;
    use remediate_types::{ClusterObject, EvictionResult, NodeRef, ObjectKey, PodRef, WorkloadRef};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn node(name: &str, condition: NodeCondition, since: i64) -> NodeRef {
        let mut node = NodeRef::new(name);
        node.condition = condition;
        node.condition_since = Some(t(since));
        node
    }

    fn snapshot(nodes: Vec<NodeRef>, pods: Vec<PodRef>) -> ClusterSnapshot {
        ClusterSnapshot {
            pods: pods.into_iter().map(|p| (p.key(), p)).collect(),
            nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
            budgets: Default::default(),
        }
    }

    #[test]
    fn test_node_drained_once_per_episode() {
        let config = ControllerConfig::default();
        let mut draining = HashSet::new();
        let snap = snapshot(vec![node("n1", NodeCondition::NotReady, 0)], vec![]);

        // Inside the grace period
        assert!(detect_remediations(&snap, t(299), &config, &mut draining).is_empty());

        let requests = detect_remediations(&snap, t(300), &config, &mut draining);
        assert_eq!(
            requests,
            vec![RemediationRequest::DrainNode {
                node: "n1".into(),
                reason: EvictionReason::NodeNotReady { node: "n1".into() },
            }]
        );
        assert!(detect_remediations(&snap, t(600), &config, &mut draining).is_empty());

        // Recovery ends the episode
        let ready = snapshot(vec![node("n1", NodeCondition::Ready, 700)], vec![]);
        assert!(detect_remediations(&ready, t(701), &config, &mut draining).is_empty());
        assert!(draining.is_empty());

        let again = snapshot(vec![node("n1", NodeCondition::Unknown, 800)], vec![]);
        assert_eq!(
            detect_remediations(&again, t(1100), &config, &mut draining).len(),
            1
        );
    }

    #[test]
    fn test_unhealthy_pods_on_ready_nodes() {
        let config = ControllerConfig::default();
        let mut crashing = ready_pod("prod", "crashing", "n1");
        crashing.readiness = Readiness::NotReady;
        crashing.restart_count = 7;
        let mut starting = ready_pod("prod", "starting", "n1");
        starting.readiness = Readiness::NotReady;
        starting.restart_count = 1;
        let mut failed = ready_pod("prod", "failed", "n1");
        failed.phase = PodPhase::Failed;
        let mut agent = ready_pod("kube-system", "agent", "n1");
        agent.phase = PodPhase::Failed;
        agent.owner = Some(WorkloadRef::new("DaemonSet", "agent"));
        let mut stranded = ready_pod("prod", "stranded", "n2");
        stranded.readiness = Readiness::NotReady;
        stranded.restart_count = 50;

        let snap = snapshot(
            vec![
                node("n1", NodeCondition::Ready, 0),
                node("n2", NodeCondition::NotReady, 10),
            ],
            vec![crashing, starting, failed, agent, stranded],
        );
        let requests = detect_remediations(&snap, t(20), &config, &mut HashSet::new());

        assert_eq!(
            requests,
            vec![RemediationRequest::EvictPods {
                pods: vec![
                    ObjectKey::new("prod", "crashing"),
                    ObjectKey::new("prod", "failed"),
                ],
                reason: EvictionReason::PodUnhealthy,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_cordons_and_drains() {
        let fake = Arc::new(FakeCluster::new());
        let mut down = NodeRef::new("n1");
        down.condition = NodeCondition::NotReady;
        down.condition_since = Some(t(0));
        fake.push_list(
            ResourceKind::Node,
            ObjectList {
                resource_version: "1".into(),
                items: vec![ClusterObject::Node(down)],
            },
        );
        fake.push_list(
            ResourceKind::Pod,
            ObjectList {
                resource_version: "1".into(),
                items: vec![
                    ClusterObject::Pod(ready_pod("prod", "a", "n1")),
                    ClusterObject::Pod(ready_pod("prod", "b", "n1")),
                ],
            },
        );

        let config = EngineConfig {
            rate: crate::config::RateConfig {
                evictions_per_second: 0.0,
                burst: 1,
            },
            ..EngineConfig::default()
        };
        let observer = ClusterObserver::new(fake.clone(), config.observer.clone());
        observer.sync().await.expect("sync");

        let executor = EvictionExecutor::new(fake.clone(), observer.store().clone(), &config);
        let mut controller =
            RemediationController::new(fake.clone(), observer, executor, config.controller);

        let cancel = CancellationToken::new();
        let report = controller.reconcile(t(301), &cancel).await;

        assert_eq!(fake.cordoned(), vec!["n1".to_string()]);
        assert_eq!(report.summary().evicted, 2);
        assert!(
            report
                .final_outcomes()
                .iter()
                .all(|o| o.result == EvictionResult::Evicted)
        );

        // Same episode: nothing more to do
        let report = controller.reconcile(t(400), &cancel).await;
        assert!(report.outcomes.is_empty());
        assert_eq!(fake.evictions().len(), 2);
    }
}
