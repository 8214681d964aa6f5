//! Kubernetes client for remediate
//!
//! This crate defines the [`ClusterApi`] seam the controller consumes (list, watch,
//! evict, cordon) and implements it on top of `kube`.

mod api;
mod client;
pub mod convert;
mod error;

pub use api::{ClusterApi, ObjectList, WatchEvent, WatchStream};
pub use client::KubeClient;
pub use error::{ApiError, ErrorClass};

// Re-export types that are used in our public API
pub use remediate_types::{ClusterObject, ObjectKey, ResourceKind};
