//! Reachability probes.
//!
//! A probe measures whether one address answers and how long it took. Ordinary
//! unreachability is an outcome, not an error: it is folded into a
//! [`ProbeResult`] with an [`ProbeErrorKind`] classification.

mod ping;

pub use ping::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Fixed per-probe timeout used by the monitoring engine.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("name resolution failed: {0}")]
    Dns(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("probe task failed: {0}")]
    Internal(String),
    #[error("no probing primitive available: {0}")]
    Unavailable(String),
}

impl ProbeError {
    /// Classify the error for reporting on a [`ProbeResult`].
    pub fn kind(&self) -> ProbeErrorKind {
        match self {
            ProbeError::Timeout(_) => ProbeErrorKind::Timeout,
            ProbeError::Dns(_) => ProbeErrorKind::DnsError,
            ProbeError::Unreachable(_) | ProbeError::Network(_) | ProbeError::Command(_) => {
                ProbeErrorKind::Unreachable
            }
            ProbeError::PermissionDenied(_)
            | ProbeError::Internal(_)
            | ProbeError::Unavailable(_) => ProbeErrorKind::Failed,
        }
    }
}

/// Classification attached to an unsuccessful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    Timeout,
    Unreachable,
    DnsError,
    /// The probe itself broke (panicked, could not open a socket). Maps to the
    /// `error` health status rather than `offline`.
    Failed,
}

/// Outcome of one probe against one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub device_id: String,
    pub ip: String,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub error: Option<ProbeErrorKind>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    /// Build a result from a raw probe outcome (latency in milliseconds).
    pub fn from_outcome(
        device_id: &str,
        ip: &str,
        outcome: Result<f64, ProbeError>,
        checked_at: DateTime<Utc>,
    ) -> Self {
        let (reachable, latency_ms, error) = match outcome {
            Ok(latency) => (true, Some(latency), None),
            Err(e) => (false, None, Some(e.kind())),
        };
        Self {
            device_id: device_id.to_string(),
            ip: ip.to_string(),
            reachable,
            latency_ms,
            error,
            checked_at,
        }
    }

    /// Result for a probe that could not run to completion.
    pub fn failed(device_id: &str, ip: &str, checked_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            ip: ip.to_string(),
            reachable: false,
            latency_ms: None,
            error: Some(ProbeErrorKind::Failed),
            checked_at,
        }
    }
}

/// A reachability check against a single address.
///
/// Implementations must be safe to call concurrently and must never block the
/// calling task for longer than `timeout` plus a small scheduling margin.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns the round-trip latency in milliseconds.
    async fn probe(&self, address: &str, timeout: Duration) -> Result<f64, ProbeError>;
}

/// Probe one device and fold the outcome into a [`ProbeResult`].
pub async fn run_probe(
    prober: &dyn Prober,
    device_id: &str,
    address: &str,
    timeout: Duration,
) -> ProbeResult {
    let checked_at = Utc::now();
    let mut outcome = prober.probe(address, timeout).await;

    // Enforce timeout check
    if let Ok(latency) = &outcome {
        if *latency >= timeout.as_secs_f64() * 1000.0 {
            outcome = Err(ProbeError::Timeout(timeout));
        }
    }

    if let Err(e) = &outcome {
        tracing::debug!("Probe of {} ({}) failed: {}", device_id, address, e);
    }

    ProbeResult::from_outcome(device_id, address, outcome, checked_at)
}
