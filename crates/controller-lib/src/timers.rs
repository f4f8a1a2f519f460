//! De-duplicated one-shot timer pool
//!
//! Holds at most one pending eviction timer per pod key. Cancellation only
//! prevents callbacks that have not started; a callback that is already
//! running is allowed to finish and is waited for via [`TimerPool::idle`].

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when the owning task finishes, whether it
/// fired or was cancelled mid-sleep.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

struct TimerEntry {
    cancel: oneshot::Sender<()>,
}

/// Pool of pending one-shot timers keyed by `namespace/name`.
pub struct TimerPool {
    jitter_max: Duration,
    timers: Mutex<HashMap<String, TimerEntry>>,
    in_flight: Arc<InFlight>,
}

impl TimerPool {
    pub fn new(jitter_max: Duration) -> Self {
        Self {
            jitter_max,
            timers: Mutex::new(HashMap::new()),
            in_flight: Arc::new(InFlight {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Arm a one-shot timer for `key` firing at `fire_at` plus jitter.
    ///
    /// Returns `false` without side effects when a timer for `key` is already
    /// pending. The callback is responsible for calling [`forget`] when it
    /// completes.
    ///
    /// [`forget`]: TimerPool::forget
    pub fn arm<F, Fut>(&self, key: &str, fire_at: DateTime<Utc>, fire: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut timers = self.timers.lock().expect("timer map lock poisoned");
        if timers.contains_key(key) {
            return false;
        }

        let delay = fire_at
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            + self.jitter();

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let task_key = key.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = tokio::time::sleep(delay) => fire().await,
                _ = cancel_rx => {
                    debug!(key = task_key.as_str(), "pending timer cancelled");
                }
            }
        });

        timers.insert(key.to_string(), TimerEntry { cancel: cancel_tx });

        true
    }

    /// Drop the pool's record of `key`. Called from the callback epilogue;
    /// a no-op for unknown keys.
    pub fn forget(&self, key: &str) {
        self.timers
            .lock()
            .expect("timer map lock poisoned")
            .remove(key);
    }

    /// Cancel every pending timer. Callbacks that have not started will never
    /// run; their in-flight contribution is released as the tasks unwind.
    pub fn cancel_all(&self) {
        let entries: Vec<(String, TimerEntry)> = self
            .timers
            .lock()
            .expect("timer map lock poisoned")
            .drain()
            .collect();

        for (key, entry) in entries {
            if entry.cancel.send(()).is_err() {
                // Callback already past the cancellation point; it will
                // finish on its own and idle() accounts for it.
                debug!(key = key.as_str(), "timer already firing, not cancelled");
            }
        }
    }

    /// Wait until no timer task is in flight. Callers bound this with a
    /// timeout.
    pub async fn idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Number of timer tasks currently alive (pending or firing).
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Whether a timer for `key` is pending.
    pub fn contains(&self, key: &str) -> bool {
        self.timers
            .lock()
            .expect("timer map lock poisoned")
            .contains_key(key)
    }

    fn jitter(&self) -> Duration {
        if self.jitter_max.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = self.jitter_max.as_millis() as u64;

        // Thundering-herd avoidance only; no cryptographic requirement.
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
