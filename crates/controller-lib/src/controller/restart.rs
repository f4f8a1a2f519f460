//! Scheduled-restart handling
//!
//! The durable state of a pending restart is the restart-at annotation on the
//! pod itself; the engine only keeps a de-duplication timer per pod key. The
//! annotation survives controller restarts and disappears with the pod, so
//! each reconcile classifies it against the pod's creation time.

use super::eviction::EvictOutcome;
use super::{Controller, EVICTION_TIMEOUT};
use crate::cron;
use crate::models::Pod;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

/// Classification of an existing restart-at annotation.
enum RestartAt {
    /// In the future; re-arm the timer and leave the annotation alone.
    FreshFuture(DateTime<Utc>),
    /// In the past and the pod already existed then; evict immediately.
    Missed,
    /// In the past but the pod was created afterwards; recompute.
    Stale,
    /// Unparseable; recompute.
    Invalid,
}

fn classify_restart_at(raw: &str, created_at: DateTime<Utc>, now: DateTime<Utc>) -> RestartAt {
    let Ok(parsed) = DateTime::parse_from_rfc3339(raw) else {
        return RestartAt::Invalid;
    };
    let restart_at = parsed.with_timezone(&Utc);

    if restart_at > now {
        RestartAt::FreshFuture(restart_at)
    } else if created_at < restart_at {
        RestartAt::Missed
    } else {
        RestartAt::Stale
    }
}

impl Controller {
    /// Scheduled-restart policy for one pod carrying the schedule annotation.
    pub(crate) async fn process_scheduled_restart(&self, pod: &Pod) {
        let namespace = pod.namespace.as_str();
        let name = pod.name.as_str();

        if let Some(raw) = pod.annotations.get(&self.config.annotation_restart_at) {
            match classify_restart_at(raw, pod.created_at, Utc::now()) {
                RestartAt::FreshFuture(at) => {
                    debug!(
                        namespace,
                        pod = name,
                        restart_at = raw.as_str(),
                        "recovering scheduled eviction"
                    );
                    self.arm_eviction(pod, at);
                    return;
                }
                RestartAt::Missed => {
                    info!(
                        namespace,
                        pod = name,
                        restart_at = raw.as_str(),
                        pod_created_at = %pod.created_at,
                        "missed scheduled eviction, evicting now"
                    );
                    match self.evict(namespace, name, pod.created_at).await {
                        Ok(EvictOutcome::Evicted) => {
                            info!(namespace, pod = name, "pod evicted (missed schedule)");
                        }
                        Ok(_) => {}
                        Err(error) => {
                            error!(namespace, pod = name, error = %error, "missed eviction failed");
                        }
                    }
                    return;
                }
                RestartAt::Stale => {
                    warn!(
                        namespace,
                        pod = name,
                        restart_at = raw.as_str(),
                        pod_created_at = %pod.created_at,
                        "stale restart-at annotation, rescheduling"
                    );
                }
                RestartAt::Invalid => {
                    warn!(
                        namespace,
                        pod = name,
                        restart_at = raw.as_str(),
                        "invalid restart-at annotation, rescheduling"
                    );
                }
            }
        }

        let spec = pod
            .annotations
            .get(&self.config.annotation_restart_schedule)
            .map(String::as_str)
            .unwrap_or_default();
        let tz = pod
            .annotations
            .get(&self.config.annotation_tz)
            .map(String::as_str)
            .unwrap_or_default();

        let next_run = match cron::next_after(spec, tz, Utc::now()) {
            Ok(next) => next,
            Err(error) => {
                warn!(
                    namespace,
                    pod = name,
                    spec,
                    tz,
                    error = %error,
                    "invalid restart schedule"
                );
                return;
            }
        };

        let restart_at_value = next_run.to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Err(error) = self
            .repo
            .set_annotation(
                namespace,
                name,
                &self.config.annotation_restart_at,
                &restart_at_value,
            )
            .await
        {
            error!(namespace, pod = name, error = %error, "set restart-at annotation");
            return;
        }

        self.arm_eviction(pod, next_run);
    }

    /// Arm a de-duplicated eviction timer for the pod. A no-op when shutting
    /// down or when a timer for this pod is already pending.
    fn arm_eviction(&self, pod: &Pod, at: DateTime<Utc>) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };

        let key = pod.key();
        let namespace = pod.namespace.clone();
        let name = pod.name.clone();
        let created_at = pod.created_at;
        let callback_key = key.clone();

        let armed = self.timers.arm(&key, at, move || async move {
            controller
                .run_scheduled_eviction(callback_key, namespace, name, created_at)
                .await;
        });

        if armed {
            debug!(
                namespace = pod.namespace.as_str(),
                pod = pod.name.as_str(),
                at = %at,
                "scheduled eviction armed"
            );
        }
    }

    /// Timer callback. Runs outside the reconcile context with its own
    /// bounded timeout.
    async fn run_scheduled_eviction(
        &self,
        key: String,
        namespace: String,
        name: String,
        created_at: DateTime<Utc>,
    ) {
        if self.shutting_down.load(Ordering::Acquire) {
            self.timers.forget(&key);
            return;
        }

        info!(
            namespace = namespace.as_str(),
            pod = name.as_str(),
            "executing scheduled eviction"
        );

        match tokio::time::timeout(EVICTION_TIMEOUT, self.evict(&namespace, &name, created_at))
            .await
        {
            Ok(Ok(EvictOutcome::Evicted)) => {
                info!(
                    namespace = namespace.as_str(),
                    pod = name.as_str(),
                    "pod evicted by schedule"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                error!(
                    namespace = namespace.as_str(),
                    pod = name.as_str(),
                    error = %error,
                    "scheduled eviction failed"
                );
            }
            Err(_) => {
                error!(
                    namespace = namespace.as_str(),
                    pod = name.as_str(),
                    "scheduled eviction timed out"
                );
            }
        }

        self.timers.forget(&key);
    }
}
