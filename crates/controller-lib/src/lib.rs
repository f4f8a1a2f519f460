//! Core library for the preoom controller
//!
//! This crate provides the controller's core functionality:
//! - Periodic reconciliation of opted-in pods
//! - Memory-threshold and cron-scheduled eviction policies
//! - De-duplicated eviction timers with jitter
//! - Health checks and observability
//!
//! The cluster itself is reached through the [`repository::Repository`] port;
//! the concrete adapter is wired in by the binary at boot.

pub mod controller;
pub mod cron;
pub mod health;
pub mod models;
pub mod observability;
pub mod pinger;
pub mod quantity;
pub mod repository;
pub mod threshold;
pub mod timers;

pub use controller::{
    Controller, ControllerConfig, ControllerState, EvictOutcome, PingError, ReconcileError,
    ShutdownError,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::ControllerMetrics;
pub use pinger::{Pinger, PingerLoop};
pub use repository::{RepoError, Repository};
