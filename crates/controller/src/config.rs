//! Controller configuration

use anyhow::{bail, Context, Result};
use controller_lib::controller::{
    ControllerConfig, ANNOTATION_RESTART_AT, DEFAULT_ANNOTATION_MEMORY_THRESHOLD,
    DEFAULT_ANNOTATION_RESTART_SCHEDULE, DEFAULT_ANNOTATION_TZ, DEFAULT_POD_LABEL_SELECTOR,
};
use serde::Deserialize;
use std::time::Duration;

/// Smallest accepted reconcile interval.
const MIN_INTERVAL_SECS: u64 = 30;

/// Application configuration, sourced from `PREOOM_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP port for health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Reconcile period in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Health ping period in seconds
    #[serde(default = "default_pinger_interval")]
    pub pinger_interval_secs: u64,

    /// Upper bound in seconds of the jitter added to each restart timer
    #[serde(default = "default_jitter_max")]
    pub restart_schedule_jitter_max_secs: u64,

    /// Minimum pod age in seconds before eviction; 0 disables the guard
    #[serde(default = "default_min_pod_age")]
    pub min_pod_age_before_eviction_secs: u64,

    /// Label selector for opted-in pods
    #[serde(default = "default_pod_label_selector")]
    pub pod_label_selector: String,

    #[serde(default = "default_annotation_memory_threshold")]
    pub annotation_memory_threshold: String,

    #[serde(default = "default_annotation_restart_schedule")]
    pub annotation_restart_schedule: String,

    #[serde(default = "default_annotation_tz")]
    pub annotation_tz: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_interval() -> u64 {
    300
}

fn default_pinger_interval() -> u64 {
    10
}

fn default_jitter_max() -> u64 {
    30
}

fn default_min_pod_age() -> u64 {
    1800
}

fn default_pod_label_selector() -> String {
    DEFAULT_POD_LABEL_SELECTOR.to_string()
}

fn default_annotation_memory_threshold() -> String {
    DEFAULT_ANNOTATION_MEMORY_THRESHOLD.to_string()
}

fn default_annotation_restart_schedule() -> String {
    DEFAULT_ANNOTATION_RESTART_SCHEDULE.to_string()
}

fn default_annotation_tz() -> String {
    DEFAULT_ANNOTATION_TZ.to_string()
}

impl AppConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("PREOOM"))
            .build()
            .context("build configuration")?;

        let config: AppConfig = config
            .try_deserialize()
            .context("deserialize configuration")?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_secs < MIN_INTERVAL_SECS {
            bail!(
                "interval_secs must be at least {MIN_INTERVAL_SECS}, got {}",
                self.interval_secs
            );
        }
        if self.pinger_interval_secs == 0 {
            bail!("pinger_interval_secs must be positive");
        }

        Ok(())
    }

    pub fn pinger_interval(&self) -> Duration {
        Duration::from_secs(self.pinger_interval_secs)
    }

    /// Controller-facing view of this configuration.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            interval: Duration::from_secs(self.interval_secs),
            pod_label_selector: self.pod_label_selector.clone(),
            annotation_memory_threshold: self.annotation_memory_threshold.clone(),
            annotation_restart_schedule: self.annotation_restart_schedule.clone(),
            annotation_tz: self.annotation_tz.clone(),
            annotation_restart_at: ANNOTATION_RESTART_AT.to_string(),
            restart_schedule_jitter_max: Duration::from_secs(self.restart_schedule_jitter_max_secs),
            min_pod_age_before_eviction: Duration::from_secs(self.min_pod_age_before_eviction_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> AppConfig {
        AppConfig {
            api_port: default_api_port(),
            interval_secs: default_interval(),
            pinger_interval_secs: default_pinger_interval(),
            restart_schedule_jitter_max_secs: default_jitter_max(),
            min_pod_age_before_eviction_secs: default_min_pod_age(),
            pod_label_selector: default_pod_label_selector(),
            annotation_memory_threshold: default_annotation_memory_threshold(),
            annotation_restart_schedule: default_annotation_restart_schedule(),
            annotation_tz: default_annotation_tz(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.interval_secs, 300);
        assert_eq!(config.pinger_interval_secs, 10);
        assert_eq!(config.restart_schedule_jitter_max_secs, 30);
        assert_eq!(config.min_pod_age_before_eviction_secs, 1800);
    }

    #[test]
    fn test_interval_floor_is_enforced() {
        let config = AppConfig {
            interval_secs: 29,
            ..defaults()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            interval_secs: 30,
            ..defaults()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_controller_config_mapping() {
        let config = AppConfig {
            min_pod_age_before_eviction_secs: 0,
            ..defaults()
        };
        let controller = config.controller_config();

        assert_eq!(controller.interval, Duration::from_secs(300));
        assert!(controller.min_pod_age_before_eviction.is_zero());
        assert_eq!(controller.annotation_restart_at, ANNOTATION_RESTART_AT);
    }
}
