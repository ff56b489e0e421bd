//! Events published by the monitoring engine and fanned out to subscribers.

mod bus;
mod channel;

pub use bus::*;
pub use channel::*;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::{HealthStatus, Transition};

/// An immutable event. Serializes as `{"type", "payload", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            EventKind::StatusChanged(_) => "status_changed",
            EventKind::Recovery(_) => "recovery",
            EventKind::Failure(_) => "failure",
            EventKind::CycleCompleted(_) => "cycle_completed",
            EventKind::CategoryEvent(_) => "category_event",
            EventKind::Heartbeat(_) => "heartbeat",
            EventKind::Connection(_) => "connection",
            EventKind::MonitoringStarted(_) => "monitoring_started",
            EventKind::MonitoringStopped(_) => "monitoring_stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    StatusChanged(StatusChange),
    Recovery(StatusChange),
    Failure(StatusChange),
    CycleCompleted(CycleCompleted),
    CategoryEvent(CategoryEvent),
    Heartbeat(Heartbeat),
    Connection(ConnectionInfo),
    MonitoringStarted(MonitoringStarted),
    MonitoringStopped(MonitoringStopped),
}

impl EventKind {
    /// One event per surfaced transition, refined into recovery/failure
    /// where the direction is clear.
    pub fn from_transition(transition: &Transition) -> Self {
        let change = StatusChange {
            device_id: transition.device_id.clone(),
            ip: transition.ip.clone(),
            old_status: transition.from,
            new_status: transition.to,
            response_time: transition.response_time,
            changed_at: transition.at,
        };

        if transition.is_recovery() {
            EventKind::Recovery(change)
        } else if transition.is_failure() {
            EventKind::Failure(change)
        } else {
            EventKind::StatusChanged(change)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub device_id: String,
    pub ip: String,
    pub old_status: HealthStatus,
    pub new_status: HealthStatus,
    pub response_time: Option<f64>,
    /// When the probe that caused the change ran.
    pub changed_at: DateTime<Utc>,
}

/// Wall-clock duration of each cycle phase, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseTimings {
    pub probe_ms: u64,
    pub persist_ms: u64,
    pub reconcile_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
    pub timings: PhaseTimings,
    pub completed_at: DateTime<Utc>,
}

impl CycleSummary {
    /// Aggregate counts over raw per-device outcomes.
    pub fn tally<'a>(
        statuses: impl IntoIterator<Item = &'a HealthStatus>,
        timings: PhaseTimings,
    ) -> Self {
        let mut summary = Self {
            total: 0,
            online: 0,
            offline: 0,
            error: 0,
            timings,
            completed_at: Utc::now(),
        };
        for status in statuses {
            summary.total += 1;
            match status {
                HealthStatus::Online => summary.online += 1,
                HealthStatus::Offline => summary.offline += 1,
                HealthStatus::Error => summary.error += 1,
                HealthStatus::Unknown => {}
            }
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceResult {
    pub device_id: String,
    pub ip: String,
    pub status: HealthStatus,
    pub response_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleCompleted {
    #[serde(flatten)]
    pub summary: CycleSummary,
    pub results: Vec<DeviceResult>,
}

/// Change to a device grouping (event category) made by the CRUD layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryEvent {
    pub category_id: i64,
    pub name: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Heartbeat {
    pub subscribers: usize,
}

/// First event on every streaming connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub subscription_id: SubscriptionId,
    pub replayed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringStarted {
    pub devices_count: usize,
    pub ping_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringStopped {
    pub devices_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(from: HealthStatus, to: HealthStatus) -> Transition {
        Transition {
            device_id: "T001".to_string(),
            ip: "10.2.98.112".to_string(),
            from,
            to,
            at: Utc::now(),
            response_time: None,
        }
    }

    #[test]
    fn test_transition_refinement() {
        use HealthStatus::*;

        let kind = |from, to| Event::new(EventKind::from_transition(&transition(from, to)));
        assert_eq!(kind(Offline, Online).type_name(), "recovery");
        assert_eq!(kind(Error, Online).type_name(), "recovery");
        assert_eq!(kind(Online, Offline).type_name(), "failure");
        assert_eq!(kind(Online, Error).type_name(), "failure");
        assert_eq!(kind(Unknown, Offline).type_name(), "failure");
        assert_eq!(kind(Offline, Error).type_name(), "status_changed");
    }

    #[test]
    fn test_transition_keeps_probe_time() {
        let mut t = transition(HealthStatus::Online, HealthStatus::Offline);
        t.at = Utc::now() - chrono::Duration::seconds(4);

        match EventKind::from_transition(&t) {
            EventKind::Failure(change) => assert_eq!(change.changed_at, t.at),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let event = Event::new(EventKind::Failure(StatusChange {
            device_id: "T001".to_string(),
            ip: "10.2.98.112".to_string(),
            old_status: HealthStatus::Online,
            new_status: HealthStatus::Offline,
            response_time: None,
            changed_at: Utc::now(),
        }));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failure");
        assert_eq!(json["payload"]["device_id"], "T001");
        assert_eq!(json["payload"]["old_status"], "online");
        assert_eq!(json["payload"]["new_status"], "offline");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_cycle_completed_flattens_summary() {
        let statuses = [
            HealthStatus::Online,
            HealthStatus::Online,
            HealthStatus::Offline,
            HealthStatus::Error,
        ];
        let summary = CycleSummary::tally(statuses.iter(), PhaseTimings::default());
        assert_eq!(
            (summary.total, summary.online, summary.offline, summary.error),
            (4, 2, 1, 1)
        );

        let event = Event::new(EventKind::CycleCompleted(CycleCompleted {
            summary,
            results: Vec::new(),
        }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cycle_completed");
        assert_eq!(json["payload"]["total"], 4);
        assert_eq!(json["payload"]["timings"]["probe_ms"], 0);
    }

    #[test]
    fn test_category_event_shape() {
        let event = Event::new(EventKind::CategoryEvent(CategoryEvent {
            category_id: 3,
            name: "Concert".to_string(),
            action: "created".to_string(),
        }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "category_event");
        assert_eq!(json["payload"]["name"], "Concert");
    }
}
