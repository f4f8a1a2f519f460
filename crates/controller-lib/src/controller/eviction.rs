//! Eviction facade
//!
//! Single entry point for all eviction actions: the threshold handler, the
//! missed-schedule path, and fired timers. Applies the minimum-age guard and
//! maps repository outcomes so that transient conditions never surface as
//! reconcile errors.

use super::{Controller, ProcessError};
use crate::repository::RepoError;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of an eviction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// The eviction request was accepted by the cluster.
    Evicted,
    /// The pod is younger than the configured minimum age.
    SkippedTooYoung,
    /// The pod no longer exists.
    AlreadyGone,
    /// The backend asked to back off; the next reconcile retries.
    RateLimited,
}

impl Controller {
    pub(crate) async fn evict(
        &self,
        namespace: &str,
        name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<EvictOutcome, ProcessError> {
        let min_age = self.config.min_pod_age_before_eviction;
        if !min_age.is_zero() {
            let age = Utc::now()
                .signed_duration_since(created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age < min_age {
                self.metrics
                    .inc_eviction_skipped_pod_too_young(namespace, name);
                warn!(
                    namespace,
                    pod = name,
                    age_secs = age.as_secs(),
                    min_age_secs = min_age.as_secs(),
                    "pod too young for eviction, skipping"
                );
                return Ok(EvictOutcome::SkippedTooYoung);
            }
        }

        match self.repo.evict_pod(namespace, name).await {
            Ok(()) => Ok(EvictOutcome::Evicted),
            Err(RepoError::NotFound) => {
                debug!(namespace, pod = name, "pod not found when evicting");
                Ok(EvictOutcome::AlreadyGone)
            }
            Err(RepoError::RateLimited) => {
                debug!(
                    namespace,
                    pod = name,
                    "too many requests when evicting, will retry later"
                );
                Ok(EvictOutcome::RateLimited)
            }
            Err(error) => Err(ProcessError::EvictPod(error)),
        }
    }
}
