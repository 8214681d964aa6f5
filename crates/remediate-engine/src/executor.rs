//! Eviction execution
//!
//! Entries of one budget group form a lane that a single worker processes in
//! planned order, so the budget re-check right before each eviction never races
//! another eviction of the same group. Lanes of different groups run in
//! parallel up to `max_concurrency`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use remediate_k8s::{ApiError, ClusterApi, ErrorClass};
use remediate_types::{
    DisruptionGroup, EvictionOutcome, EvictionPlanEntry, EvictionResult, ObjectKey,
};

use crate::backoff::{Backoff, RetryDelays};
use crate::breaker::Throttle;
use crate::budget;
use crate::config::{EngineConfig, ExecutorConfig};
use crate::observer::ClusterStore;
use crate::planner::EvictionPlan;

/// Every outcome recorded during one execution, in the order they happened
#[derive(Clone, Debug, Default)]
pub struct ExecutionReport {
    pub outcomes: Vec<EvictionOutcome>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub evicted: usize,
    pub denied_api: usize,
    pub abandoned: usize,
    /// Budget denials that were requeued
    pub budget_denials: usize,
    pub retries: usize,
}

impl ExecutionReport {
    /// The terminal outcome of each pod, in the order pods were first seen
    pub fn final_outcomes(&self) -> Vec<&EvictionOutcome> {
        let mut order: Vec<ObjectKey> = Vec::new();
        let mut last: HashMap<ObjectKey, &EvictionOutcome> = HashMap::new();

        for outcome in self.outcomes.iter().filter(|o| o.result.is_final()) {
            let key = outcome.pod.key();
            if last.insert(key.clone(), outcome).is_none() {
                order.push(key);
            }
        }
        order.iter().filter_map(|k| last.get(k).copied()).collect()
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for outcome in &self.outcomes {
            match outcome.result {
                EvictionResult::DeniedBudget => summary.budget_denials += 1,
                EvictionResult::Retrying(_) => summary.retries += 1,
                _ => {}
            }
        }
        for outcome in self.final_outcomes() {
            match outcome.result {
                EvictionResult::Evicted => summary.evicted += 1,
                EvictionResult::DeniedApi(_) => summary.denied_api += 1,
                EvictionResult::Abandoned(_) => summary.abandoned += 1,
                _ => {}
            }
        }
        summary
    }

    /// Some pod did not end up evicted
    pub fn has_failures(&self) -> bool {
        let summary = self.summary();
        summary.denied_api > 0 || summary.abandoned > 0
    }
}

/// A plan entry with its retry bookkeeping
struct Queued {
    entry: EvictionPlanEntry,
    attempts: u32,
    budget_denials: u32,
    delays: RetryDelays,
}

impl Queued {
    fn key(&self) -> ObjectKey {
        self.entry.pod.key()
    }
}

/// What the lane does with an entry after an attempt
enum Next {
    Done,
    /// Budget exhausted; let the rest of the lane go first
    RequeueBack(Duration),
    /// Failed call; retry this entry before anything else in the lane
    RetryFront(Duration),
}

struct Recorder {
    outcomes: Mutex<Vec<EvictionOutcome>>,
    progress: Option<mpsc::UnboundedSender<EvictionOutcome>>,
}

impl Recorder {
    fn record(&self, item: &Queued, result: EvictionResult) {
        let outcome = EvictionOutcome::new(item.entry.pod.clone(), result, item.attempts);
        if let Some(tx) = &self.progress {
            let _ = tx.send(outcome.clone());
        }
        self.outcomes.lock().push(outcome);
    }
}

pub struct EvictionExecutor {
    api: Arc<dyn ClusterApi>,
    store: ClusterStore,
    throttle: Arc<Throttle>,
    config: ExecutorConfig,
    backoff: Backoff,
    progress: Option<mpsc::UnboundedSender<EvictionOutcome>>,
}

impl EvictionExecutor {
    pub fn new(api: Arc<dyn ClusterApi>, store: ClusterStore, config: &EngineConfig) -> Self {
        let throttle = Arc::new(Throttle::new(config.breaker.clone(), &config.rate));
        let executor = config.executor.clone();
        Self {
            api,
            store,
            throttle,
            backoff: Backoff::new(executor.backoff_base(), executor.backoff_max()),
            config: executor,
            progress: None,
        }
    }

    /// Share a throttle so breaker state carries across executions
    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Stream every outcome as it is recorded
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<EvictionOutcome>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn with_max_concurrency(mut self, workers: usize) -> Self {
        self.config.max_concurrency = workers;
        self
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    /// Execute every entry of `plan` once to a final outcome
    ///
    /// After `cancel` fires, in-flight calls get the shutdown grace period and
    /// every entry still queued is reported as abandoned.
    pub async fn execute(&self, plan: &EvictionPlan, cancel: &CancellationToken) -> ExecutionReport {
        let lanes = lanes(plan, &self.backoff);
        let recorder = Recorder {
            outcomes: Mutex::new(Vec::new()),
            progress: self.progress.clone(),
        };
        // Fatal API errors stop this run without cancelling the caller
        let run = cancel.child_token();

        info!(
            entries = plan.len(),
            lanes = lanes.len(),
            workers = self.config.max_concurrency,
            "Executing eviction plan"
        );

        let (run_ref, rec) = (&run, &recorder);
        stream::iter(lanes)
            .for_each_concurrent(self.config.max_concurrency.max(1), move |lane| {
                self.run_lane(lane, run_ref, rec)
            })
            .await;

        ExecutionReport {
            outcomes: recorder.outcomes.into_inner(),
        }
    }

    async fn run_lane(&self, mut lane: VecDeque<Queued>, cancel: &CancellationToken, rec: &Recorder) {
        while let Some(mut item) = lane.pop_front() {
            if cancel.is_cancelled() {
                rec.record(&item, EvictionResult::Abandoned("cancelled before eviction".into()));
                for rest in lane.drain(..) {
                    rec.record(&rest, EvictionResult::Abandoned("cancelled before eviction".into()));
                }
                return;
            }

            let delay = match self.attempt(&mut item, cancel, rec).await {
                Next::Done => continue,
                Next::RequeueBack(delay) => {
                    lane.push_back(item);
                    delay
                }
                Next::RetryFront(delay) => {
                    lane.push_front(item);
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, item: &mut Queued, cancel: &CancellationToken, rec: &Recorder) -> Next {
        let key = item.key();

        if let Some(next) = self.check_budget(item, rec) {
            return next;
        }

        let Some(permit) = self.throttle.acquire(cancel).await else {
            rec.record(item, EvictionResult::Abandoned("cancelled before eviction".into()));
            return Next::Done;
        };

        // The budget may have moved while we waited for the throttle
        if let Some(next) = self.check_budget(item, rec) {
            permit.neutral();
            return next;
        }

        item.attempts += 1;
        debug!(pod = %key, attempt = item.attempts, trial = permit.is_trial(), "Evicting pod");

        let Some(result) = self.evict_within_grace(&key, cancel).await else {
            permit.neutral();
            warn!(pod = %key, "Eviction still in flight at end of shutdown grace period");
            rec.record(item, EvictionResult::Abandoned("shutdown grace period expired".into()));
            return Next::Done;
        };

        match result {
            Ok(()) => {
                permit.success();
                self.store.mark_pending_deletion(&key);
                info!(pod = %key, reason = %item.entry.reason, "Evicted pod");
                rec.record(item, EvictionResult::Evicted);
                Next::Done
            }
            Err(err) => match err.class() {
                ErrorClass::Transient => {
                    permit.failure();
                    self.retry(item, err, rec)
                }
                ErrorClass::Throttled => {
                    permit.neutral();
                    self.retry(item, err, rec)
                }
                ErrorClass::Permanent | ErrorClass::Expired => {
                    permit.neutral();
                    warn!(pod = %key, error = %err, "Eviction rejected");
                    rec.record(item, EvictionResult::DeniedApi(err.to_string()));
                    Next::Done
                }
                ErrorClass::Fatal => {
                    permit.neutral();
                    error!(pod = %key, error = %err, "Fatal API error, stopping evictions");
                    rec.record(item, EvictionResult::Abandoned(err.to_string()));
                    cancel.cancel();
                    Next::Done
                }
            },
        }
    }

    /// Re-check the budget against the freshest view
    ///
    /// Returns `None` when the eviction may go ahead.
    fn check_budget(&self, item: &mut Queued, rec: &Recorder) -> Option<Next> {
        let key = item.key();
        let snapshot = self.store.snapshot();
        let pod = snapshot.pod(&key).unwrap_or(&item.entry.pod);

        if pod.is_going_away() {
            rec.record(item, EvictionResult::DeniedApi("pod is already terminating".into()));
            return Some(Next::Done);
        }

        let allowed = budget::allowed_disruptions(&snapshot, pod);
        if allowed > 0 {
            return None;
        }

        item.budget_denials += 1;
        if item.budget_denials > self.config.max_budget_retries {
            warn!(
                pod = %key,
                group = %item.entry.group,
                denials = item.budget_denials,
                "Disruption budget never allowed eviction, giving up"
            );
            rec.record(
                item,
                EvictionResult::Abandoned("disruption budget allows no evictions".into()),
            );
            return Some(Next::Done);
        }

        debug!(pod = %key, group = %item.entry.group, "Disruption budget exhausted, requeueing");
        rec.record(item, EvictionResult::DeniedBudget);
        Some(Next::RequeueBack(self.config.budget_requeue_delay()))
    }

    fn retry(&self, item: &mut Queued, err: ApiError, rec: &Recorder) -> Next {
        let key = item.key();
        if item.attempts >= self.config.max_attempts {
            warn!(pod = %key, attempts = item.attempts, error = %err, "Giving up on eviction");
            rec.record(
                item,
                EvictionResult::Abandoned(format!(
                    "gave up after {} attempts: {}",
                    item.attempts, err
                )),
            );
            return Next::Done;
        }

        let delay = item.delays.delay_at_least(err.retry_after());
        debug!(
            pod = %key,
            attempt = item.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Eviction failed, retrying"
        );
        rec.record(item, EvictionResult::Retrying(err.to_string()));
        Next::RetryFront(delay)
    }

    async fn evict_within_grace(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Option<Result<(), ApiError>> {
        let grace = self.config.shutdown_grace();
        tokio::select! {
            result = self.api.evict(key) => Some(result),
            _ = async {
                cancel.cancelled().await;
                tokio::time::sleep(grace).await;
            } => None,
        }
    }
}

/// Split a plan into lanes: one per budget, one per unbudgeted pod
fn lanes(plan: &EvictionPlan, backoff: &Backoff) -> Vec<VecDeque<Queued>> {
    let mut lanes: Vec<VecDeque<Queued>> = Vec::new();
    let mut by_group: HashMap<&DisruptionGroup, usize> = HashMap::new();

    for entry in &plan.entries {
        let queued = Queued {
            entry: entry.clone(),
            attempts: 0,
            budget_denials: 0,
            delays: backoff.delays(),
        };
        match &entry.group {
            DisruptionGroup::Budget(_) => {
                let idx = *by_group.entry(&entry.group).or_insert_with(|| {
                    lanes.push(VecDeque::new());
                    lanes.len() - 1
                });
                lanes[idx].push_back(queued);
            }
            DisruptionGroup::Unbudgeted => lanes.push(VecDeque::from([queued])),
        }
    }
    lanes
}
