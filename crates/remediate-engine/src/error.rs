use thiserror::Error;

use remediate_k8s::ApiError;
use remediate_types::ResourceKind;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("node '{0}' not found in cluster state")]
    NodeNotFound(String),

    #[error("pod '{0}' not found in cluster state")]
    PodNotFound(String),

    #[error("pod '{name}' exists in several namespaces ({}); pass a namespace", namespaces.join(", "))]
    AmbiguousPod {
        name: String,
        namespaces: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("initial list of {kind} failed: {source}")]
    InitialSync {
        kind: ResourceKind,
        #[source]
        source: ApiError,
    },
}

impl ObserverError {
    pub fn api_error(&self) -> &ApiError {
        match self {
            Self::InitialSync { source, .. } => source,
        }
    }
}
