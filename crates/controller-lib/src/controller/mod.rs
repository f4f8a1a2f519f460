//! Reconciliation engine
//!
//! Periodically lists opted-in pods and applies two independent eviction
//! policies per pod: a memory-usage threshold and a cron-driven scheduled
//! restart. All eviction actions funnel through a single facade that applies
//! the minimum-age guard and classifies repository outcomes.

mod eviction;
mod restart;


pub use eviction::EvictOutcome;

use crate::models::Pod;
use crate::observability::ControllerMetrics;
use crate::pinger::Pinger;
use crate::repository::{RepoError, Repository};
use crate::threshold::{self, ResolvedThreshold};
use crate::timers::TimerPool;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_POD_LABEL_SELECTOR: &str = "preoom.dev/enabled=true";
pub const DEFAULT_ANNOTATION_MEMORY_THRESHOLD: &str = "preoom.dev/memory-threshold";
pub const DEFAULT_ANNOTATION_RESTART_SCHEDULE: &str = "preoom.dev/restart-schedule";
pub const DEFAULT_ANNOTATION_TZ: &str = "preoom.dev/tz";
/// Engine-managed annotation carrying the next planned eviction time.
pub const ANNOTATION_RESTART_AT: &str = "preoom.dev/restart-at";

/// Fixed wait between two consecutive pods inside one reconcile pass.
const INTER_POD_PACING: Duration = Duration::from_secs(1);

/// Timeout for the asynchronous eviction issued by a fired timer.
pub(crate) const EVICTION_TIMEOUT: Duration = Duration::from_secs(90);

/// Controller configuration resolved at boot.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Reconcile period.
    pub interval: Duration,
    /// Label selector for opted-in pods.
    pub pod_label_selector: String,
    pub annotation_memory_threshold: String,
    pub annotation_restart_schedule: String,
    pub annotation_tz: String,
    pub annotation_restart_at: String,
    /// Upper bound of the uniform jitter added to each armed timer.
    pub restart_schedule_jitter_max: Duration,
    /// Minimum pod age before eviction is allowed; zero disables the guard.
    pub min_pod_age_before_eviction: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            pod_label_selector: DEFAULT_POD_LABEL_SELECTOR.to_string(),
            annotation_memory_threshold: DEFAULT_ANNOTATION_MEMORY_THRESHOLD.to_string(),
            annotation_restart_schedule: DEFAULT_ANNOTATION_RESTART_SCHEDULE.to_string(),
            annotation_tz: DEFAULT_ANNOTATION_TZ.to_string(),
            annotation_restart_at: ANNOTATION_RESTART_AT.to_string(),
            restart_schedule_jitter_max: Duration::from_secs(30),
            min_pod_age_before_eviction: Duration::from_secs(30 * 60),
        }
    }
}

/// Lifecycle state of the controller. Terminated is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Terminating = 3,
    Terminated = 4,
}

impl ControllerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

/// Error of one reconcile pass. Per-pod failures are logged and absorbed;
/// only a failed pod list surfaces here.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("list pods: {0}")]
    ListPods(#[source] RepoError),
}

/// Per-pod processing errors; logged by the reconcile loop, never fatal.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("get pod metrics: {0}")]
    GetPodMetrics(#[source] RepoError),

    #[error("evict pod: {0}")]
    EvictPod(#[source] RepoError),
}

#[derive(Debug, Error)]
pub enum PingError {
    #[error("controller is not ready")]
    NotReady,

    #[error("last reconcile was too long ago: {age_secs}s")]
    Stale { age_secs: u64 },
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("reconcile loop did not exit before the shutdown deadline")]
    LoopDeadline,

    #[error("pending evictions did not drain before the shutdown deadline")]
    DrainDeadline,
}

/// The reconciliation engine.
///
/// Created behind an [`Arc`]; timer callbacks hold a handle back to the
/// controller through `weak_self`.
pub struct Controller {
    weak_self: Weak<Controller>,
    repo: Arc<dyn Repository>,
    config: ControllerConfig,
    timers: TimerPool,
    metrics: ControllerMetrics,
    state: AtomicU8,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    ready_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    last_reconcile_end: RwLock<Option<Instant>>,
}

impl Controller {
    pub fn new(repo: Arc<dyn Repository>, config: ControllerConfig) -> Arc<Self> {
        let timers = TimerPool::new(config.restart_schedule_jitter_max);

        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            repo,
            timers,
            metrics: ControllerMetrics::new(),
            state: AtomicU8::new(ControllerState::Idle as u8),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            ready_tx: watch::channel(false).0,
            done_tx: watch::channel(false).0,
            last_reconcile_end: RwLock::new(None),
            config,
        })
    }

    /// Spawn the reconcile loop onto the current runtime. A no-op when the
    /// controller was already started or is shutting down.
    pub fn start(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            info!("controller is shutting down, skipping start");
            return;
        }
        if self
            .state
            .compare_exchange(
                ControllerState::Idle as u8,
                ControllerState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!("controller already started, skipping start");
            return;
        }

        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(controller.run());
    }

    async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            label_selector = self.config.pod_label_selector.as_str(),
            "starting reconcile loop"
        );

        // Stamp before signalling Ready so the liveness probe has a baseline.
        self.stamp_reconcile_end();
        self.set_state(ControllerState::Running);
        self.ready_tx.send_replace(true);

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so the first pass
        // runs now and the second waits a full interval.
        ticker.tick().await;

        loop {
            if let Err(error) = self.reconcile_once().await {
                error!(error = %error, "reconcile error");
            }
            self.stamp_reconcile_end();

            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => {
                    info!("terminating reconcile loop");
                    break;
                }
            }
        }

        self.done_tx.send_replace(true);
    }

    /// One iteration of the reconciliation loop.
    pub(crate) async fn reconcile_once(&self) -> Result<(), ReconcileError> {
        let pods = self
            .repo
            .list_pods(&self.config.pod_label_selector)
            .await
            .map_err(ReconcileError::ListPods)?;

        debug!(count = pods.len(), "starting to process pods");

        let mut evicted = 0usize;
        for (index, pod) in pods.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("cancellation observed, stopping reconcile pass");
                return Ok(());
            }
            if index > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(INTER_POD_PACING) => {}
                    _ = self.cancel.cancelled() => {
                        info!("cancellation observed, stopping reconcile pass");
                        return Ok(());
                    }
                }
            }

            self.reconcile_pod(pod, &mut evicted).await;
        }

        info!(count = pods.len(), evicted, "reconcile pass complete");

        Ok(())
    }

    /// Process one pod: schedule-based first, then memory threshold. The
    /// scheduled path only ever arms a future timer; the threshold path may
    /// evict now.
    async fn reconcile_pod(&self, pod: &Pod, evicted: &mut usize) {
        if pod
            .annotations
            .contains_key(&self.config.annotation_restart_schedule)
        {
            self.process_scheduled_restart(pod).await;
        }

        if pod
            .annotations
            .contains_key(&self.config.annotation_memory_threshold)
        {
            match self.process_memory_threshold(pod).await {
                Ok(true) => *evicted += 1,
                Ok(false) => {}
                Err(error) => {
                    error!(
                        namespace = pod.namespace.as_str(),
                        pod = pod.name.as_str(),
                        error = %error,
                        "process pod error"
                    );
                }
            }
        }
    }

    /// Memory-threshold policy for one pod. Returns whether the pod was
    /// evicted.
    async fn process_memory_threshold(&self, pod: &Pod) -> Result<bool, ProcessError> {
        let namespace = pod.namespace.as_str();
        let name = pod.name.as_str();

        let threshold =
            match threshold::resolve_memory_threshold(pod, &self.config.annotation_memory_threshold)
            {
                Ok(ResolvedThreshold::Bytes(0)) => {
                    warn!(namespace, pod = name, "memory threshold is zero, skipping");
                    return Ok(false);
                }
                Ok(ResolvedThreshold::Bytes(bytes)) => bytes,
                Ok(ResolvedThreshold::NoLimitForPercent) => {
                    warn!(
                        namespace,
                        pod = name,
                        "memory threshold is a percentage but pod has no memory limit, skipping"
                    );
                    return Ok(false);
                }
                Err(error) => {
                    warn!(
                        namespace,
                        pod = name,
                        error = %error,
                        "invalid memory threshold annotation, skipping"
                    );
                    return Ok(false);
                }
            };

        let usage = match self.repo.get_pod_metrics(namespace, name).await {
            Ok(metrics) => metrics.memory_usage,
            Err(RepoError::NotFound) => {
                debug!(namespace, pod = name, "pod metrics not found, skipping");
                return Ok(false);
            }
            Err(RepoError::RateLimited) => {
                debug!(
                    namespace,
                    pod = name,
                    "pod metrics rate limited, will retry next pass"
                );
                return Ok(false);
            }
            Err(error) => return Err(ProcessError::GetPodMetrics(error)),
        };

        let usage = match usage {
            Some(bytes) if bytes > 0 => bytes,
            _ => {
                debug!(
                    namespace,
                    pod = name,
                    "pod memory usage absent or zero, skipping"
                );
                return Ok(false);
            }
        };

        debug!(
            namespace,
            pod = name,
            usage_bytes = usage,
            threshold_bytes = threshold,
            "processing pod"
        );

        if usage > threshold {
            let outcome = self.evict(namespace, name, pod.created_at).await?;
            if outcome == EvictOutcome::Evicted {
                info!(
                    namespace,
                    pod = name,
                    usage_bytes = usage,
                    threshold_bytes = threshold,
                    "pod evicted over memory threshold"
                );
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Liveness check: ready and reconciled within twice the interval.
    pub fn ping(&self) -> Result<(), PingError> {
        if !*self.ready_tx.borrow() {
            return Err(PingError::NotReady);
        }
        let age = self.last_reconcile_age().ok_or(PingError::NotReady)?;
        if age > 2 * self.config.interval {
            return Err(PingError::Stale {
                age_secs: age.as_secs(),
            });
        }

        Ok(())
    }

    /// Wait until the controller has stamped its first reconcile clock.
    pub async fn ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Graceful shutdown: cancel pending timers, wait for the reconcile loop
    /// to exit and for in-flight evictions to drain, all bounded by
    /// `deadline`. Idempotent; a second call returns immediately.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("controller already shutting down, skipping shutdown");
            return Ok(());
        }

        info!("shutting down controller");

        let was_started = self.state() != ControllerState::Idle;
        self.set_state(ControllerState::Terminating);
        self.cancel.cancel();
        self.timers.cancel_all();

        let deadline_at = tokio::time::Instant::now() + deadline;

        if was_started {
            let mut done = self.done_tx.subscribe();
            if tokio::time::timeout_at(deadline_at, done.wait_for(|done| *done))
                .await
                .is_err()
            {
                return Err(ShutdownError::LoopDeadline);
            }
            info!("reconcile loop exited");
        }

        if tokio::time::timeout_at(deadline_at, self.timers.idle())
            .await
            .is_err()
        {
            return Err(ShutdownError::DrainDeadline);
        }
        info!("all scheduled evictions finished");

        self.set_state(ControllerState::Terminated);
        info!("controller shut down");

        Ok(())
    }

    fn set_state(&self, state: ControllerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stamp_reconcile_end(&self) {
        *self
            .last_reconcile_end
            .write()
            .expect("reconcile clock lock poisoned") = Some(Instant::now());
    }

    fn last_reconcile_age(&self) -> Option<Duration> {
        self.last_reconcile_end
            .read()
            .expect("reconcile clock lock poisoned")
            .map(|stamp| stamp.elapsed())
    }
}

#[async_trait]
impl Pinger for Controller {
    fn name(&self) -> &str {
        "controller"
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Controller::ping(self).map_err(Into::into)
    }
}
