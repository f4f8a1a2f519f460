//! Core domain models for the controller

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A workload replica as seen by one reconcile pass.
#[derive(Debug, Clone)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
    /// Sum of all container memory limits; `None` when no container sets one.
    pub memory_limit: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Pod {
    /// De-duplication key used by the timer pool.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Point-in-time metrics for a pod.
#[derive(Debug, Clone)]
pub struct PodMetrics {
    /// Aggregated memory usage across containers, in bytes.
    pub memory_usage: Option<u64>,
}
