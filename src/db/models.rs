//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probe::ProbeResult;
use crate::scheduler::HealthStatus;

pub const DEFAULT_CATEGORY: &str = "Турникет";

/// A monitored device as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub device_id: String,
    pub ip: String,
    pub description: String,
    pub category: String,
    pub enabled: bool,
    pub status: HealthStatus,
    /// Latency of the latest persisted probe in milliseconds.
    pub response_ms: Option<f64>,
    pub last_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Device {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            device_id: String::new(),
            ip: String::new(),
            description: String::new(),
            category: DEFAULT_CATEGORY.to_string(),
            enabled: true,
            status: HealthStatus::Unknown,
            response_ms: None,
            last_check: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The subset of a device the monitoring engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub address: String,
    pub enabled: bool,
}

/// One entry of a persisted status batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub device_id: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub checked_at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn from_probe(result: &ProbeResult) -> Self {
        Self {
            device_id: result.device_id.clone(),
            status: HealthStatus::from_probe(result),
            latency_ms: result.latency_ms,
            checked_at: result.checked_at,
        }
    }
}
