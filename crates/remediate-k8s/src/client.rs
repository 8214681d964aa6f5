use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, future};
use http::HeaderMap;
use http::header::RETRY_AFTER;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{EvictParams, ListParams, WatchParams};
use kube::client::Body;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;

use remediate_types::{ClusterObject, ObjectKey, ResourceKind};

use crate::convert::{budget_to_model, node_to_ref, pod_to_ref};
use crate::{ApiError, ClusterApi, ObjectList, WatchEvent, WatchStream};

/// Kubernetes client wrapper
///
/// Constructed once at startup and shared by reference with every component.
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Build a client from an explicit kubeconfig, a named context, or the
    /// in-cluster / default inference chain
    pub async fn connect(
        kubeconfig: Option<&Path>,
        context: Option<&str>,
    ) -> Result<Self, ApiError> {
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };

        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| ApiError::Unauthorized {
                    message: format!("failed to read kubeconfig {}: {}", path.display(), e),
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ApiError::Unauthorized {
                        message: e.to_string(),
                    })?
            }
            None if context.is_some() => kube::Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ApiError::Unauthorized {
                    message: e.to_string(),
                })?,
            None => kube::Config::infer()
                .await
                .map_err(|e| ApiError::Unauthorized {
                    message: e.to_string(),
                })?,
        };

        let client = kube::Client::try_from(config).map_err(|e| ApiError::Connect {
            message: e.to_string(),
        })?;

        Ok(Self::new(client))
    }

    async fn list_as<K, F>(&self, convert: F) -> Result<ObjectList, ApiError>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
        F: Fn(K) -> ClusterObject,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(ApiError::from_kube)?;

        Ok(ObjectList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items.into_iter().map(convert).collect(),
        })
    }

    async fn watch_as<K, F>(
        &self,
        resource_version: &str,
        timeout: Duration,
        convert: F,
    ) -> Result<WatchStream, ApiError>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
        <K as Resource>::DynamicType: Default,
        F: Fn(K) -> ClusterObject + Send + 'static,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let params = WatchParams::default().timeout(timeout.as_secs().min(u64::from(u32::MAX)) as u32);
        let stream = api
            .watch(&params, resource_version)
            .await
            .map_err(ApiError::from_kube)?;

        let events = stream.filter_map(move |event| {
            let mapped = match event {
                Ok(kube::api::WatchEvent::Added(obj)) | Ok(kube::api::WatchEvent::Modified(obj)) => {
                    Some(Ok(WatchEvent::Applied(convert(obj))))
                }
                Ok(kube::api::WatchEvent::Deleted(obj)) => {
                    Some(Ok(WatchEvent::Deleted(convert(obj))))
                }
                Ok(kube::api::WatchEvent::Bookmark(_)) => None,
                Ok(kube::api::WatchEvent::Error(resp)) => {
                    Some(Err(ApiError::from_status(resp.code, resp.message, None)))
                }
                Err(e) => Some(Err(ApiError::from_kube(e))),
            };
            future::ready(mapped)
        });

        Ok(events.boxed())
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn list(&self, kind: ResourceKind) -> Result<ObjectList, ApiError> {
        match kind {
            ResourceKind::Pod => self.list_as(|p: Pod| ClusterObject::Pod(pod_to_ref(p))).await,
            ResourceKind::Node => {
                self.list_as(|n: Node| ClusterObject::Node(node_to_ref(n)))
                    .await
            }
            ResourceKind::DisruptionBudget => {
                self.list_as(|b: PodDisruptionBudget| ClusterObject::Budget(budget_to_model(b)))
                    .await
            }
        }
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        resource_version: &str,
        timeout: Duration,
    ) -> Result<WatchStream, ApiError> {
        match kind {
            ResourceKind::Pod => {
                self.watch_as(resource_version, timeout, |p: Pod| {
                    ClusterObject::Pod(pod_to_ref(p))
                })
                .await
            }
            ResourceKind::Node => {
                self.watch_as(resource_version, timeout, |n: Node| {
                    ClusterObject::Node(node_to_ref(n))
                })
                .await
            }
            ResourceKind::DisruptionBudget => {
                self.watch_as(resource_version, timeout, |b: PodDisruptionBudget| {
                    ClusterObject::Budget(budget_to_model(b))
                })
                .await
            }
        }
    }

    async fn evict(&self, pod: &ObjectKey) -> Result<(), ApiError> {
        // Built by hand so the Retry-After header of a 429 is not lost
        let url = Pod::url_path(&(), Some(&pod.namespace));
        let request = kube::core::Request::new(url)
            .evict(&pod.name, &EvictParams::default())
            .map_err(|e| ApiError::Permanent {
                code: 0,
                message: e.to_string(),
            })?;

        let response = self
            .client
            .send(request.map(Body::from))
            .await
            .map_err(ApiError::from_kube)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = format!(
            "eviction of {} returned {}",
            pod,
            status.canonical_reason().unwrap_or("unexpected status")
        );
        Err(ApiError::from_status(
            status.as_u16(),
            message,
            parse_retry_after(response.headers()),
        ))
    }

    async fn cordon(&self, node: &str) -> Result<(), ApiError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes.cordon(node).await.map_err(ApiError::from_kube)?;
        Ok(())
    }

    async fn server_version(&self) -> Result<String, ApiError> {
        let info = self.client.apiserver_version().await.map_err(|e| match e {
            kube::Error::Api(resp) => ApiError::from_status(resp.code, resp.message, None),
            other => ApiError::Connect {
                message: other.to_string(),
            },
        })?;
        Ok(info.git_version)
    }
}

/// Parse a delta-seconds `Retry-After` value
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(5)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }
}
