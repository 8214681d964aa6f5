//! In-memory cluster used by engine tests

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::time::Instant;

use remediate_k8s::{ApiError, ClusterApi, ObjectList, WatchEvent, WatchStream};
use remediate_types::{ObjectKey, PodPhase, PodRef, Readiness, ResourceKind};

type WatchScript = (Vec<Result<WatchEvent, ApiError>>, bool);

#[derive(Default)]
struct FakeState {
    lists: HashMap<ResourceKind, VecDeque<Result<ObjectList, ApiError>>>,
    watches: HashMap<ResourceKind, VecDeque<WatchScript>>,
    evict_script: HashMap<ObjectKey, VecDeque<Result<(), ApiError>>>,
    default_evict: Option<ApiError>,
    evict_delay: Option<Duration>,
    evictions: Vec<(ObjectKey, Instant)>,
    list_calls: HashMap<ResourceKind, usize>,
    watch_versions: HashMap<ResourceKind, Vec<String>>,
    cordoned: Vec<String>,
}

/// Scripted [`ClusterApi`]: lists and watch streams are served in push order,
/// evictions succeed unless scripted otherwise
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, kind: ResourceKind, list: ObjectList) {
        self.state
            .lock()
            .lists
            .entry(kind)
            .or_default()
            .push_back(Ok(list));
    }

    pub fn fail_list(&self, kind: ResourceKind, error: ApiError) {
        self.state
            .lock()
            .lists
            .entry(kind)
            .or_default()
            .push_back(Err(error));
    }

    /// Queue a watch stream; `hold_open` keeps it pending after the events
    pub fn push_watch(
        &self,
        kind: ResourceKind,
        events: Vec<Result<WatchEvent, ApiError>>,
        hold_open: bool,
    ) {
        self.state
            .lock()
            .watches
            .entry(kind)
            .or_default()
            .push_back((events, hold_open));
    }

    pub fn script_evictions(&self, pod: &ObjectKey, responses: Vec<Result<(), ApiError>>) {
        self.state
            .lock()
            .evict_script
            .entry(pod.clone())
            .or_default()
            .extend(responses);
    }

    /// Response for every unscripted eviction
    pub fn fail_all_evictions(&self, error: ApiError) {
        self.state.lock().default_evict = Some(error);
    }

    /// Make every eviction call take `delay` before it answers
    pub fn delay_evictions(&self, delay: Duration) {
        self.state.lock().evict_delay = Some(delay);
    }

    pub fn evictions(&self) -> Vec<(ObjectKey, Instant)> {
        self.state.lock().evictions.clone()
    }

    pub fn list_calls(&self, kind: ResourceKind) -> usize {
        self.state.lock().list_calls.get(&kind).copied().unwrap_or(0)
    }

    pub fn watch_versions(&self, kind: ResourceKind) -> Vec<String> {
        self.state
            .lock()
            .watch_versions
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn cordoned(&self) -> Vec<String> {
        self.state.lock().cordoned.clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list(&self, kind: ResourceKind) -> Result<ObjectList, ApiError> {
        let mut state = self.state.lock();
        *state.list_calls.entry(kind).or_default() += 1;
        state
            .lists
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Ok(ObjectList {
                    resource_version: "0".to_string(),
                    items: Vec::new(),
                })
            })
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        resource_version: &str,
        _timeout: Duration,
    ) -> Result<WatchStream, ApiError> {
        let mut state = self.state.lock();
        state
            .watch_versions
            .entry(kind)
            .or_default()
            .push(resource_version.to_string());

        match state.watches.get_mut(&kind).and_then(VecDeque::pop_front) {
            Some((events, true)) => Ok(stream::iter(events).chain(stream::pending()).boxed()),
            Some((events, false)) => Ok(stream::iter(events).boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn evict(&self, pod: &ObjectKey) -> Result<(), ApiError> {
        let delay = {
            let mut state = self.state.lock();
            state.evictions.push((pod.clone(), Instant::now()));
            state.evict_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();

        if let Some(response) = state
            .evict_script
            .get_mut(pod)
            .and_then(VecDeque::pop_front)
        {
            return response;
        }
        match &state.default_evict {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn cordon(&self, node: &str) -> Result<(), ApiError> {
        self.state.lock().cordoned.push(node.to_string());
        Ok(())
    }

    async fn server_version(&self) -> Result<String, ApiError> {
        Ok("v1.31.0-fake".to_string())
    }
}

/// A running, ready pod scheduled on `node`
pub(crate) fn ready_pod(namespace: &str, name: &str, node: &str) -> PodRef {
    let mut pod = PodRef::new(namespace, name);
    pod.node = Some(node.to_string());
    pod.phase = PodPhase::Running;
    pod.readiness = Readiness::Ready;
    pod
}
