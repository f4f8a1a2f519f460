//! Kubernetes-backed repository adapter
//!
//! Implements the repository port against the cluster API: pod listing by
//! label selector, pod metrics from `metrics.k8s.io`, the policy/v1 eviction
//! subresource, and a merge patch for the engine-managed annotation.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use controller_lib::models::{Pod, PodMetrics};
use controller_lib::quantity::parse_quantity;
use controller_lib::repository::{RepoError, Repository};
use k8s_openapi::api::core::v1::Pod as K8sPod;
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::{json, Value};
use tracing::warn;

pub struct KubeRepository {
    client: Client,
}

impl KubeRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<K8sPod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pod_metrics(&self, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");

        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

/// Map a cluster API failure onto the repository outcome taxonomy.
fn classify(error: kube::Error) -> RepoError {
    match error {
        kube::Error::Api(ref response) if response.code == 404 => RepoError::NotFound,
        kube::Error::Api(ref response) if response.code == 429 => RepoError::RateLimited,
        other => RepoError::Other(anyhow!(other)),
    }
}

fn to_domain_pod(pod: &K8sPod) -> Pod {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let created_at: DateTime<Utc> = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
        .unwrap_or(DateTime::UNIX_EPOCH);

    let mut memory_limit: Option<u64> = None;
    let containers = pod.spec.as_ref().map(|spec| &spec.containers);
    for container in containers.into_iter().flatten() {
        let Some(limit) = container
            .resources
            .as_ref()
            .and_then(|resources| resources.limits.as_ref())
            .and_then(|limits| limits.get("memory"))
        else {
            continue;
        };
        match parse_quantity(&limit.0) {
            Ok(bytes) => *memory_limit.get_or_insert(0) += bytes,
            Err(error) => warn!(
                namespace = namespace.as_str(),
                pod = name.as_str(),
                container = container.name.as_str(),
                limit = limit.0.as_str(),
                error = %error,
                "unparseable container memory limit, ignoring"
            ),
        }
    }

    Pod {
        name,
        namespace,
        annotations,
        memory_limit,
        created_at,
    }
}

/// Sum the per-container memory usage of a `metrics.k8s.io` pod object.
fn sum_memory_usage(data: &Value) -> Option<u64> {
    let containers = data.get("containers")?.as_array()?;
    let mut total: Option<u64> = None;

    for container in containers {
        let Some(memory) = container.pointer("/usage/memory").and_then(Value::as_str) else {
            continue;
        };
        match parse_quantity(memory) {
            Ok(bytes) => *total.get_or_insert(0) += bytes,
            Err(error) => warn!(
                memory,
                error = %error,
                "unparseable container memory usage, ignoring"
            ),
        }
    }

    total
}

#[async_trait]
impl Repository for KubeRepository {
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, RepoError> {
        let pods: Api<K8sPod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(classify)?;

        Ok(list.items.iter().map(to_domain_pod).collect())
    }

    async fn get_pod_metrics(&self, namespace: &str, name: &str) -> Result<PodMetrics, RepoError> {
        let object = self
            .pod_metrics(namespace)
            .get(name)
            .await
            .map_err(classify)?;

        Ok(PodMetrics {
            memory_usage: sum_memory_usage(&object.data),
        })
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), RepoError> {
        self.pods(namespace)
            .evict(name, &EvictParams::default())
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn set_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), RepoError> {
        // An empty value removes the annotation via merge-patch null.
        let annotation_value = if value.is_empty() {
            Value::Null
        } else {
            Value::String(value.to_string())
        };
        let patch = json!({
            "metadata": {
                "annotations": { key: annotation_value }
            }
        });

        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(classify)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    fn container_with_memory_limit(name: &str, limit: Option<&str>) -> Container {
        Container {
            name: name.to_string(),
            resources: limit.map(|limit| ResourceRequirements {
                limits: Some(BTreeMap::from([(
                    "memory".to_string(),
                    Quantity(limit.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_to_domain_pod_sums_container_limits() {
        let pod = K8sPod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(BTreeMap::from([(
                    "preoom.dev/memory-threshold".to_string(),
                    "80%".to_string(),
                )])),
                creation_timestamp: Some(Time(
                    Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
                )),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![
                    container_with_memory_limit("app", Some("512Mi")),
                    container_with_memory_limit("sidecar", Some("256Mi")),
                ],
                ..Default::default()
            }),
            ..Default::default()
        };

        let domain = to_domain_pod(&pod);
        assert_eq!(domain.name, "web-0");
        assert_eq!(domain.namespace, "default");
        assert_eq!(domain.memory_limit, Some(768 * 1024 * 1024));
        assert_eq!(
            domain.created_at,
            Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
        );
        assert!(domain.annotations.contains_key("preoom.dev/memory-threshold"));
    }

    #[test]
    fn test_to_domain_pod_without_limits() {
        let pod = K8sPod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container_with_memory_limit("app", None)],
                ..Default::default()
            }),
            ..Default::default()
        };

        let domain = to_domain_pod(&pod);
        assert_eq!(domain.memory_limit, None);
        assert_eq!(domain.created_at, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_partial_limits_still_sum() {
        let pod = K8sPod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![
                    container_with_memory_limit("app", Some("1Gi")),
                    container_with_memory_limit("sidecar", None),
                ],
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(to_domain_pod(&pod).memory_limit, Some(1 << 30));
    }

    #[test]
    fn test_sum_memory_usage() {
        let data = json!({
            "containers": [
                { "name": "app", "usage": { "cpu": "10m", "memory": "128Mi" } },
                { "name": "sidecar", "usage": { "cpu": "1m", "memory": "64Mi" } },
            ]
        });

        assert_eq!(sum_memory_usage(&data), Some(192 * 1024 * 1024));
    }

    #[test]
    fn test_sum_memory_usage_without_containers() {
        assert_eq!(sum_memory_usage(&json!({})), None);
        assert_eq!(sum_memory_usage(&json!({ "containers": [] })), None);
    }
}
