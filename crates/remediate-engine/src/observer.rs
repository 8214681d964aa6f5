//! Cluster state observer
//!
//! Keeps an in-memory view of pods, nodes and disruption budgets. Each kind runs a
//! list-then-watch cycle; whenever a watch stream terminates for any reason the
//! kind is relisted in full and the stored objects are replaced, never merged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use remediate_k8s::{ApiError, ClusterApi, ErrorClass, WatchEvent};
use remediate_types::{ClusterObject, DisruptionBudget, NodeRef, ObjectKey, PodRef, ResourceKind};

use crate::budget;
use crate::config::ObserverConfig;
use crate::{ClusterSnapshot, ObserverError};

/// Change notifications emitted to subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateChange {
    Applied { kind: ResourceKind, key: ObjectKey },
    Deleted { kind: ResourceKind, key: ObjectKey },
    Resynced { kind: ResourceKind, objects: usize },
}

#[derive(Default)]
struct StoreInner {
    pods: BTreeMap<ObjectKey, PodRef>,
    nodes: BTreeMap<String, NodeRef>,
    budgets: BTreeMap<ObjectKey, DisruptionBudget>,

    /// Pods we evicted whose deletion the watch has not delivered yet
    pending_deletion: HashSet<ObjectKey>,
}

impl StoreInner {
    fn apply(&mut self, object: ClusterObject) {
        match object {
            ClusterObject::Pod(pod) => {
                self.pods.insert(pod.key(), pod);
            }
            ClusterObject::Node(mut node) => {
                node.pods.clear();
                self.nodes.insert(node.name.clone(), node);
            }
            ClusterObject::Budget(budget) => {
                self.budgets.insert(budget.key(), budget);
            }
        }
    }
}

/// Thread-safe object store behind a single reader/writer lock
#[derive(Clone, Default)]
pub struct ClusterStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a single object
    pub fn apply(&self, object: ClusterObject) {
        self.inner.write().apply(object);
    }

    pub fn delete(&self, object: &ClusterObject) {
        let mut inner = self.inner.write();
        match object {
            ClusterObject::Pod(pod) => {
                let key = pod.key();
                inner.pods.remove(&key);
                inner.pending_deletion.remove(&key);
            }
            ClusterObject::Node(node) => {
                inner.nodes.remove(&node.name);
            }
            ClusterObject::Budget(budget) => {
                inner.budgets.remove(&budget.key());
            }
        }
    }

    /// Replace every object of `kind` with the result of a full list
    pub fn replace(&self, kind: ResourceKind, objects: Vec<ClusterObject>) {
        let mut inner = self.inner.write();
        match kind {
            ResourceKind::Pod => inner.pods.clear(),
            ResourceKind::Node => inner.nodes.clear(),
            ResourceKind::DisruptionBudget => inner.budgets.clear(),
        }

        for object in objects.into_iter().filter(|o| o.kind() == kind) {
            inner.apply(object);
        }

        // A full list already shows evicted pods as terminating, and a pod
        // listed under a marked name may be its replacement
        if kind == ResourceKind::Pod {
            inner.pending_deletion.clear();
        }
    }

    /// Optimistically flag a pod as going away ahead of the watch
    pub fn mark_pending_deletion(&self, key: &ObjectKey) {
        self.inner.write().pending_deletion.insert(key.clone());
    }

    pub fn len(&self, kind: ResourceKind) -> usize {
        let inner = self.inner.read();
        match kind {
            ResourceKind::Pod => inner.pods.len(),
            ResourceKind::Node => inner.nodes.len(),
            ResourceKind::DisruptionBudget => inner.budgets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        ResourceKind::ALL.iter().all(|k| self.len(*k) == 0)
    }

    /// Consistent copy of the view with node membership and budget health derived
    pub fn snapshot(&self) -> ClusterSnapshot {
        let inner = self.inner.read();

        let mut pods = inner.pods.clone();
        for key in &inner.pending_deletion {
            if let Some(pod) = pods.get_mut(key) {
                pod.pending_deletion = true;
            }
        }

        let mut nodes = inner.nodes.clone();
        for pod in pods.values() {
            if let Some(node) = pod.node.as_ref().and_then(|n| nodes.get_mut(n)) {
                node.pods.insert(pod.key());
            }
        }

        let mut budgets = inner.budgets.clone();
        for budget in budgets.values_mut() {
            let status = budget::evaluate(budget, pods.values());
            budget.current_healthy = status.current_healthy;
            budget.expected_pods = status.expected;
        }

        ClusterSnapshot {
            pods,
            nodes,
            budgets,
        }
    }
}

/// Where a kind's list/watch cycle currently is
enum WatchPhase {
    Relist,
    Watch {
        resource_version: String,
        resync_at: Instant,
    },
    RetryAfter(Duration),
}

/// Maintains the cluster view and publishes state changes
#[derive(Clone)]
pub struct ClusterObserver {
    api: Arc<dyn ClusterApi>,
    store: ClusterStore,
    config: ObserverConfig,
    events: broadcast::Sender<StateChange>,

    /// Versions returned by the initial list, consumed by `start`
    initial_versions: Arc<Mutex<HashMap<ResourceKind, String>>>,
}

impl ClusterObserver {
    pub fn new(api: Arc<dyn ClusterApi>, config: ObserverConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            api,
            store: ClusterStore::new(),
            config,
            events,
            initial_versions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// List every kind once. Failures here are fatal to startup.
    pub async fn sync(&self) -> Result<(), ObserverError> {
        for kind in ResourceKind::ALL {
            let list = self
                .api
                .list(kind)
                .await
                .map_err(|source| ObserverError::InitialSync { kind, source })?;

            let count = list.items.len();
            self.store.replace(kind, list.items);
            self.initial_versions
                .lock()
                .insert(kind, list.resource_version);
            info!(%kind, objects = count, "Initial list complete");
            let _ = self.events.send(StateChange::Resynced {
                kind,
                objects: count,
            });
        }
        Ok(())
    }

    /// Spawn the long-lived watch task covering every kind
    pub fn start(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let observer = self.clone();
        tokio::spawn(async move {
            let loops = ResourceKind::ALL.map(|kind| {
                let initial = observer.initial_versions.lock().remove(&kind);
                observer.run_kind(kind, initial, cancel.clone())
            });
            futures::future::join_all(loops).await;
            debug!("Observer stopped");
        })
    }

    async fn run_kind(
        &self,
        kind: ResourceKind,
        initial_version: Option<String>,
        cancel: CancellationToken,
    ) {
        let mut phase = match initial_version {
            Some(resource_version) => WatchPhase::Watch {
                resource_version,
                resync_at: Instant::now() + self.config.resync_interval(),
            },
            None => WatchPhase::Relist,
        };

        loop {
            phase = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.step(kind, phase) => next,
            };
        }
    }

    /// Advance one kind's cycle by a single transition
    async fn step(&self, kind: ResourceKind, phase: WatchPhase) -> WatchPhase {
        match phase {
            WatchPhase::Relist => self.relist(kind).await,
            WatchPhase::RetryAfter(delay) => {
                tokio::time::sleep(delay).await;
                WatchPhase::Relist
            }
            WatchPhase::Watch {
                resource_version,
                resync_at,
            } => self.watch(kind, &resource_version, resync_at).await,
        }
    }

    async fn relist(&self, kind: ResourceKind) -> WatchPhase {
        match self.api.list(kind).await {
            Ok(list) => {
                let count = list.items.len();
                self.store.replace(kind, list.items);
                info!(%kind, objects = count, "Resynced");
                let _ = self.events.send(StateChange::Resynced {
                    kind,
                    objects: count,
                });
                WatchPhase::Watch {
                    resource_version: list.resource_version,
                    resync_at: Instant::now() + self.config.resync_interval(),
                }
            }
            Err(e) => {
                warn!(%kind, error = %e, "List failed, retrying");
                WatchPhase::RetryAfter(self.config.retry_delay())
            }
        }
    }

    async fn watch(&self, kind: ResourceKind, resource_version: &str, resync_at: Instant) -> WatchPhase {
        let mut stream = match self
            .api
            .watch(kind, resource_version, self.config.watch_timeout())
            .await
        {
            Ok(stream) => stream,
            Err(e) => return self.on_watch_error(kind, e),
        };

        debug!(%kind, resource_version, "Watching");
        let resync = tokio::time::sleep_until(resync_at);
        tokio::pin!(resync);

        loop {
            tokio::select! {
                _ = &mut resync => {
                    debug!(%kind, "Periodic resync");
                    return WatchPhase::Relist;
                }

                event = stream.next() => {
                    match event {
                        Some(Ok(WatchEvent::Applied(object))) => {
                            let key = object.key();
                            self.store.apply(object);
                            let _ = self.events.send(StateChange::Applied { kind, key });
                        }
                        Some(Ok(WatchEvent::Deleted(object))) => {
                            let key = object.key();
                            self.store.delete(&object);
                            let _ = self.events.send(StateChange::Deleted { kind, key });
                        }
                        Some(Err(e)) => return self.on_watch_error(kind, e),
                        None => {
                            debug!(%kind, "Watch stream closed");
                            return WatchPhase::Relist;
                        }
                    }
                }
            }
        }
    }

    fn on_watch_error(&self, kind: ResourceKind, error: ApiError) -> WatchPhase {
        match error.class() {
            ErrorClass::Expired => {
                info!(%kind, "Resource version expired, relisting");
                WatchPhase::Relist
            }
            _ => {
                warn!(%kind, error = %error, "Watch failed, relisting after delay");
                WatchPhase::RetryAfter(self.config.retry_delay())
            }
        }
    }
}
