//! Repository port for cluster operations
//!
//! The reconciliation engine talks to the cluster exclusively through this
//! trait; the concrete adapter is selected once at boot.

use crate::models::{Pod, PodMetrics};
use async_trait::async_trait;

/// Outcome taxonomy for repository calls. The engine only ever distinguishes
/// these three cases; everything else is an opaque failure.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("not found")]
    NotFound,

    #[error("too many requests")]
    RateLimited,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Port interface for cluster operations.
#[async_trait]
pub trait Repository: Send + Sync {
    /// List pods matching a label selector across all namespaces.
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, RepoError>;

    /// Current aggregated memory usage for a pod.
    async fn get_pod_metrics(&self, namespace: &str, name: &str) -> Result<PodMetrics, RepoError>;

    /// Request a disruption-aware eviction of a pod.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), RepoError>;

    /// Merge-patch a single metadata annotation; an empty value removes it.
    async fn set_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), RepoError>;
}
