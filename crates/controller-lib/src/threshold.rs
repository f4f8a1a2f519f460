//! Memory-threshold resolution
//!
//! The threshold annotation is either an absolute quantity (`512Mi`) or a
//! percentage of the pod's memory limit (`80%`). Both resolve to an absolute
//! byte count before comparison against usage.

use crate::models::Pod;
use crate::quantity::{parse_quantity, QuantityError};
use thiserror::Error;
use tracing::debug;

const PERCENT_SCALE: f64 = 100.0;

/// Errors produced while resolving a threshold annotation.
#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("annotation {0:?} not found")]
    NotFound(String),

    #[error("invalid percentage {value:?}: {reason}")]
    InvalidPercent { value: String, reason: String },

    #[error("parse memory threshold: {0}")]
    Quantity(#[from] QuantityError),
}

/// A successfully resolved threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedThreshold {
    /// Absolute threshold in bytes. Zero means the annotation is
    /// misconfigured; callers skip eviction.
    Bytes(u64),
    /// The annotation is a percentage but the pod declares no memory limit;
    /// callers must not evict.
    NoLimitForPercent,
}

/// Resolve the effective memory threshold from a pod annotation.
pub fn resolve_memory_threshold(
    pod: &Pod,
    annotation_key: &str,
) -> Result<ResolvedThreshold, ThresholdError> {
    let raw = pod
        .annotations
        .get(annotation_key)
        .ok_or_else(|| ThresholdError::NotFound(annotation_key.to_string()))?;

    if let Some(percent_str) = raw.trim().strip_suffix('%') {
        return resolve_from_percent(percent_str.trim(), pod.memory_limit);
    }

    let threshold = parse_quantity(raw)?;
    debug!(value = raw.as_str(), threshold_bytes = threshold, "resolved absolute threshold");

    Ok(ResolvedThreshold::Bytes(threshold))
}

fn resolve_from_percent(
    percent_str: &str,
    memory_limit: Option<u64>,
) -> Result<ResolvedThreshold, ThresholdError> {
    let percent: f64 = percent_str.parse().map_err(|_| ThresholdError::InvalidPercent {
        value: percent_str.to_string(),
        reason: "not a number".to_string(),
    })?;

    if percent <= 0.0 || percent > PERCENT_SCALE {
        return Err(ThresholdError::InvalidPercent {
            value: percent_str.to_string(),
            reason: "must be in (0, 100]".to_string(),
        });
    }

    let limit = match memory_limit {
        Some(limit) if limit > 0 => limit,
        _ => return Ok(ResolvedThreshold::NoLimitForPercent),
    };

    let threshold = (limit as f64 * percent / PERCENT_SCALE).floor() as u64;
    debug!(
        percent,
        limit_bytes = limit,
        threshold_bytes = threshold,
        "resolved percentage threshold"
    );

    Ok(ResolvedThreshold::Bytes(threshold))
}
