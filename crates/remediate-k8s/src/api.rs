use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use remediate_types::{ClusterObject, ObjectKey, ResourceKind};

use crate::ApiError;

/// Result of a full list: the objects plus the version to watch from
#[derive(Clone, Debug, Default)]
pub struct ObjectList {
    pub resource_version: String,
    pub items: Vec<ClusterObject>,
}

/// A change delivered by a watch stream
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// Added or modified
    Applied(ClusterObject),
    Deleted(ClusterObject),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ApiError>>;

/// Operations the controller consumes from the Kubernetes API
///
/// The watch stream ends (or yields [`ApiError::Gone`]) when the server closes it;
/// callers are expected to relist before watching again.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list(&self, kind: ResourceKind) -> Result<ObjectList, ApiError>;

    async fn watch(
        &self,
        kind: ResourceKind,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<WatchStream, ApiError>;

    /// POST to the pod's eviction subresource
    async fn evict(&self, pod: &ObjectKey) -> Result<(), ApiError>;

    /// Mark a node unschedulable
    async fn cordon(&self, node: &str) -> Result<(), ApiError>;

    /// Reachability check used at startup
    async fn server_version(&self) -> Result<String, ApiError>;
}
