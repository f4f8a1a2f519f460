//! Periodic health pinging
//!
//! Runs registered pingers at a fixed interval with a per-ping timeout and
//! feeds the results into the health registry.

use crate::health::HealthRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Timeout applied to each individual ping.
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// A component that can report liveness on demand.
#[async_trait]
pub trait Pinger: Send + Sync {
    fn name(&self) -> &str;

    async fn ping(&self) -> anyhow::Result<()>;
}

/// Periodic ping loop over a set of registered components.
pub struct PingerLoop {
    registry: HealthRegistry,
    pingers: Vec<Arc<dyn Pinger>>,
    interval: Duration,
}

impl PingerLoop {
    pub fn new(registry: HealthRegistry, interval: Duration) -> Self {
        Self {
            registry,
            pingers: Vec::new(),
            interval,
        }
    }

    /// Register a pinger. Its component entry is created on the first tick.
    pub fn register(&mut self, pinger: Arc<dyn Pinger>) {
        self.pingers.push(pinger);
    }

    /// Run until cancelled. The first round of pings runs immediately.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            pingers = self.pingers.len(),
            "starting pinger loop"
        );

        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.ping_all().await,
                _ = cancel.cancelled() => {
                    info!("terminating pinger loop");
                    return;
                }
            }
        }
    }

    async fn ping_all(&self) {
        for pinger in &self.pingers {
            let name = pinger.name();
            match tokio::time::timeout(PING_TIMEOUT, pinger.ping()).await {
                Ok(Ok(())) => {
                    debug!(name, "ping ok");
                    self.registry.set_healthy(name).await;
                }
                Ok(Err(error)) => {
                    debug!(name, error = %error, "ping failed");
                    self.registry.set_unhealthy(name, error.to_string()).await;
                }
                Err(_) => {
                    debug!(name, "ping timed out");
                    self.registry.set_degraded(name, "ping timed out").await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyPinger {
        fail: AtomicBool,
    }

    #[async_trait]
    impl Pinger for FlakyPinger {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn ping(&self) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    struct SlowPinger;

    #[async_trait]
    impl Pinger for SlowPinger {
        fn name(&self) -> &str {
            "slow"
        }

        async fn ping(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ping_all_updates_registry() {
        let registry = HealthRegistry::new();
        let pinger = Arc::new(FlakyPinger {
            fail: AtomicBool::new(false),
        });

        let mut pinger_loop = PingerLoop::new(registry.clone(), Duration::from_secs(10));
        pinger_loop.register(pinger.clone());

        pinger_loop.ping_all().await;
        let health = registry.health().await;
        assert_eq!(health.components["flaky"].status, ComponentStatus::Healthy);

        pinger.fail.store(true, Ordering::SeqCst);
        pinger_loop.ping_all().await;
        let health = registry.health().await;
        assert_eq!(health.components["flaky"].status, ComponentStatus::Unhealthy);
        assert_eq!(health.components["flaky"].message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_slow_ping_marks_degraded() {
        let registry = HealthRegistry::new();
        let mut pinger_loop = PingerLoop::new(registry.clone(), Duration::from_secs(10));
        pinger_loop.register(Arc::new(SlowPinger));

        pinger_loop.ping_all().await;
        let health = registry.health().await;
        assert_eq!(health.components["slow"].status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_run_exits_on_cancel() {
        let registry = HealthRegistry::new();
        let pinger_loop = PingerLoop::new(registry, Duration::from_millis(10));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(pinger_loop.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pinger loop should exit")
            .expect("pinger loop should not panic");
    }
}
