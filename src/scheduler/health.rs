//! Per-device health state machine.
//!
//! A [`DeviceMonitor`] turns a stream of probe results into a small number of
//! surfaced status transitions. Raw ICMP flicker is absorbed by two guards:
//! a debounce interval since the last transition and a flap detector that
//! mutes a device until its outcomes stabilize.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::probe::{ProbeErrorKind, ProbeResult};

/// Health status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Error,
}

impl HealthStatus {
    /// Status implied by a single probe result.
    pub fn from_probe(result: &ProbeResult) -> Self {
        if result.reachable {
            HealthStatus::Online
        } else if result.error == Some(ProbeErrorKind::Failed) {
            HealthStatus::Error
        } else {
            HealthStatus::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Online => "online",
            HealthStatus::Offline => "offline",
            HealthStatus::Error => "error",
        }
    }

    pub fn is_down(&self) -> bool {
        matches!(self, HealthStatus::Offline | HealthStatus::Error)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(HealthStatus::Unknown),
            "online" => Ok(HealthStatus::Online),
            "offline" => Ok(HealthStatus::Offline),
            "error" => Ok(HealthStatus::Error),
            other => Err(format!("unknown health status: {}", other)),
        }
    }
}

/// Thresholds deciding when a status change is surfaced.
#[derive(Debug, Clone, Copy)]
pub struct TransitionPolicy {
    /// Minimum time between surfaced transitions.
    pub min_interval: ChronoDuration,
    /// More toggles than this inside `flap_window` marks the device as flapping.
    pub flap_threshold: usize,
    pub flap_window: ChronoDuration,
    /// Identical consecutive outcomes needed to leave the flapping state, and
    /// to confirm a device that was first seen down.
    pub stabilization_count: u32,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            min_interval: ChronoDuration::seconds(60),
            flap_threshold: 10,
            flap_window: ChronoDuration::seconds(600),
            stabilization_count: 5,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MonitorError {
    #[error("device {device_id}: invalid address {address:?}")]
    InvalidAddress { device_id: String, address: String },
}

/// Health state owned by one [`DeviceMonitor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceHealthState {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Latency of the latest probe in milliseconds.
    pub last_response_time: Option<f64>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub is_flapping: bool,
}

/// Point-in-time copy of a monitor, safe to hand out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub ip: String,
    #[serde(flatten)]
    pub state: DeviceHealthState,
}

/// A status change that passed the debounce and flap guards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub device_id: String,
    pub ip: String,
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub at: DateTime<Utc>,
    pub response_time: Option<f64>,
}

impl Transition {
    /// Device came back up.
    pub fn is_recovery(&self) -> bool {
        self.from.is_down() && self.to == HealthStatus::Online
    }

    /// Device went down, either from online or after being first seen down.
    pub fn is_failure(&self) -> bool {
        matches!(self.from, HealthStatus::Online | HealthStatus::Unknown) && self.to.is_down()
    }
}

/// Health state machine for a single device.
#[derive(Debug)]
pub struct DeviceMonitor {
    device_id: String,
    address: String,
    policy: TransitionPolicy,
    state: DeviceHealthState,
    /// Start of the current debounce interval: the baseline or the last
    /// surfaced transition.
    debounce_from: Option<DateTime<Utc>>,
    /// Times at which the outcome flipped between up and down.
    toggles: VecDeque<DateTime<Utc>>,
    last_outcome: Option<HealthStatus>,
    /// First observation was down and no failure has been surfaced yet.
    initial_alert_pending: bool,
}

impl DeviceMonitor {
    pub fn new(device_id: &str, address: &str, policy: TransitionPolicy) -> Result<Self, MonitorError> {
        let trimmed = address.trim();
        if trimmed.is_empty() || trimmed.len() > 253 || trimmed.chars().any(char::is_whitespace) {
            return Err(MonitorError::InvalidAddress {
                device_id: device_id.to_string(),
                address: address.to_string(),
            });
        }

        Ok(Self {
            device_id: device_id.to_string(),
            address: trimmed.to_string(),
            policy,
            state: DeviceHealthState::default(),
            debounce_from: None,
            toggles: VecDeque::new(),
            last_outcome: None,
            initial_alert_pending: false,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> &DeviceHealthState {
        &self.state
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            ip: self.address.clone(),
            state: self.state.clone(),
        }
    }

    /// Fold one probe result into the state, returning the transition to
    /// surface, if any.
    ///
    /// The first result only establishes a baseline. A device first seen
    /// online stays silent; a device first seen down surfaces one failure
    /// once `stabilization_count` consecutive failures confirm it.
    pub fn observe(&mut self, result: &ProbeResult) -> Option<Transition> {
        let now = result.checked_at;
        let candidate = HealthStatus::from_probe(result);

        if candidate == HealthStatus::Online {
            self.state.consecutive_successes += 1;
            self.state.consecutive_failures = 0;
        } else {
            self.state.consecutive_failures += 1;
            self.state.consecutive_successes = 0;
        }
        self.state.last_response_time = result.latency_ms;
        self.state.last_check = Some(now);
        self.record_outcome(candidate, now);

        if self.state.status == HealthStatus::Unknown {
            tracing::debug!("Device {} baseline: {}", self.device_id, candidate);
            self.state.status = candidate;
            self.debounce_from = Some(now);
            self.initial_alert_pending = candidate.is_down();
            return None;
        }

        let mut stabilized = false;
        if self.state.is_flapping {
            if self.streak() < self.policy.stabilization_count {
                tracing::debug!(
                    "Device {}: {} suppressed while flapping",
                    self.device_id,
                    candidate
                );
                return None;
            }
            self.state.is_flapping = false;
            self.toggles.clear();
            stabilized = true;
            tracing::info!("Device {} stabilized as {}", self.device_id, candidate);
        }

        if self.initial_alert_pending {
            if candidate == HealthStatus::Online {
                // Never alerted as down, so coming up is not a recovery
                self.initial_alert_pending = false;
                self.state.status = candidate;
                return None;
            }
            if self.state.consecutive_failures < self.policy.stabilization_count {
                self.state.status = candidate;
                return None;
            }
            self.initial_alert_pending = false;
            return Some(self.surface(HealthStatus::Unknown, candidate, now, result));
        }

        if candidate == self.state.status {
            return None;
        }

        if !stabilized {
            if let Some(since) = self.debounce_from {
                let elapsed = now - since;
                if elapsed < self.policy.min_interval {
                    tracing::debug!(
                        "Device {}: {} -> {} suppressed (debounce {}s < {}s)",
                        self.device_id,
                        self.state.status,
                        candidate,
                        elapsed.num_seconds(),
                        self.policy.min_interval.num_seconds()
                    );
                    return None;
                }
            }
        }

        let from = self.state.status;
        Some(self.surface(from, candidate, now, result))
    }

    fn surface(
        &mut self,
        from: HealthStatus,
        to: HealthStatus,
        now: DateTime<Utc>,
        result: &ProbeResult,
    ) -> Transition {
        self.state.status = to;
        self.state.last_transition_at = Some(now);
        self.debounce_from = Some(now);
        tracing::info!("Device {} ({}): {} -> {}", self.device_id, self.address, from, to);

        Transition {
            device_id: self.device_id.clone(),
            ip: self.address.clone(),
            from,
            to,
            at: now,
            response_time: result.latency_ms,
        }
    }

    fn record_outcome(&mut self, outcome: HealthStatus, now: DateTime<Utc>) {
        if let Some(previous) = self.last_outcome {
            if previous.is_down() != outcome.is_down() {
                self.toggles.push_back(now);
            }
        }
        self.last_outcome = Some(outcome);

        let horizon = now - self.policy.flap_window;
        while self.toggles.front().is_some_and(|t| *t < horizon) {
            self.toggles.pop_front();
        }

        if !self.state.is_flapping && self.toggles.len() > self.policy.flap_threshold {
            self.state.is_flapping = true;
            tracing::warn!(
                "Device {} is flapping ({} toggles), notifications muted",
                self.device_id,
                self.toggles.len()
            );
        }
    }

    /// Length of the current run of identical outcomes.
    fn streak(&self) -> u32 {
        if self.state.consecutive_successes > 0 {
            self.state.consecutive_successes
        } else {
            self.state.consecutive_failures
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + ChronoDuration::seconds(secs)
    }

    fn up(secs: i64) -> ProbeResult {
        ProbeResult::from_outcome("T001", "10.2.98.112", Ok(20.0), at(secs))
    }

    fn down(secs: i64) -> ProbeResult {
        ProbeResult::from_outcome(
            "T001",
            "10.2.98.112",
            Err(ProbeError::Timeout(Duration::from_secs(3))),
            at(secs),
        )
    }

    fn monitor() -> DeviceMonitor {
        DeviceMonitor::new("T001", "10.2.98.112", TransitionPolicy::default()).unwrap()
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert!(DeviceMonitor::new("T001", "", TransitionPolicy::default()).is_err());
        assert!(DeviceMonitor::new("T001", "10.0.0.1 10.0.0.2", TransitionPolicy::default()).is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            HealthStatus::Unknown,
            HealthStatus::Online,
            HealthStatus::Offline,
            HealthStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<HealthStatus>().unwrap(), status);
        }
        assert!("flaky".parse::<HealthStatus>().is_err());
    }

    #[test]
    fn test_streak_counters_are_exclusive() {
        let mut m = monitor();
        let outcomes = [true, true, false, true, false, false, false, true, true, false];
        let mut expected_fail = 0;
        let mut expected_ok = 0;

        for (i, ok) in outcomes.iter().enumerate() {
            let result = if *ok { up(i as i64) } else { down(i as i64) };
            m.observe(&result);
            if *ok {
                expected_ok += 1;
                expected_fail = 0;
            } else {
                expected_fail += 1;
                expected_ok = 0;
            }
            let state = m.state();
            assert!(state.consecutive_failures == 0 || state.consecutive_successes == 0);
            assert_eq!(state.consecutive_failures, expected_fail);
            assert_eq!(state.consecutive_successes, expected_ok);
        }
    }

    #[test]
    fn test_first_success_is_silent_baseline() {
        let mut m = monitor();
        assert_eq!(m.observe(&up(0)), None);

        let state = m.state();
        assert_eq!(state.status, HealthStatus::Online);
        assert_eq!(state.last_response_time, Some(20.0));
        assert_eq!(state.last_transition_at, None);
    }

    #[test]
    fn test_isolated_flip_inside_debounce_is_silent() {
        let mut m = monitor();
        m.observe(&up(0));

        assert_eq!(m.observe(&down(20)), None);
        assert_eq!(m.observe(&up(40)), None);
        assert_eq!(m.observe(&up(100)), None);
        assert_eq!(m.state().status, HealthStatus::Online);
    }

    #[test]
    fn test_sustained_flip_surfaces_exactly_once() {
        let mut m = monitor();
        m.observe(&up(0));

        let mut transitions = Vec::new();
        for secs in (30..=300).step_by(30) {
            transitions.extend(m.observe(&down(secs)));
        }

        assert_eq!(transitions.len(), 1);
        let t = &transitions[0];
        assert_eq!(t.from, HealthStatus::Online);
        assert_eq!(t.to, HealthStatus::Offline);
        assert_eq!(t.at, at(60));
        assert!(t.is_failure());
        assert_eq!(m.state().last_transition_at, Some(at(60)));
    }

    #[test]
    fn test_recovery_after_debounce() {
        let mut m = monitor();
        m.observe(&up(0));
        m.observe(&down(90)).expect("failure surfaced");

        assert_eq!(m.observe(&up(120)), None);
        let t = m.observe(&up(150)).expect("recovery surfaced");
        assert!(t.is_recovery());
        assert_eq!(t.response_time, Some(20.0));
    }

    #[test]
    fn test_flapping_suppresses_until_stable() {
        let mut m = monitor();
        m.observe(&up(0));

        // 11 toggles in 11 seconds, all inside the debounce interval
        for secs in 1..=11 {
            let result = if secs % 2 == 1 { down(secs) } else { up(secs) };
            assert_eq!(m.observe(&result), None);
        }
        assert!(m.state().is_flapping);

        // Still alternating long after debounce would have allowed a change
        for secs in 100..110 {
            let result = if secs % 2 == 1 { down(secs) } else { up(secs) };
            assert_eq!(m.observe(&result), None);
        }
        assert!(m.state().is_flapping);

        let mut transitions = Vec::new();
        for secs in 120..126 {
            transitions.extend(m.observe(&down(secs)));
        }
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, HealthStatus::Offline);
        assert_eq!(transitions[0].at, at(123));
        assert!(!m.state().is_flapping);
    }

    #[test]
    fn test_toggles_outside_window_do_not_flap() {
        let mut m = monitor();
        m.observe(&up(0));

        // One toggle per 90s: never more than 10 inside a 600s window
        for i in 1..=30 {
            let secs = i * 90;
            let result = if i % 2 == 1 { down(secs) } else { up(secs) };
            m.observe(&result);
            assert!(!m.state().is_flapping);
        }
    }

    #[test]
    fn test_device_first_seen_down_alerts_after_stabilization() {
        let mut m = DeviceMonitor::new("A", "203.0.113.5", TransitionPolicy::default()).unwrap();
        let miss = |secs| {
            ProbeResult::from_outcome(
                "A",
                "203.0.113.5",
                Err(ProbeError::Timeout(Duration::from_secs(3))),
                at(secs),
            )
        };

        assert_eq!(m.observe(&miss(0)), None);
        assert_eq!(m.state().status, HealthStatus::Offline);
        assert_eq!(m.state().consecutive_failures, 1);

        let mut transitions = Vec::new();
        for i in 1..10 {
            transitions.extend(m.observe(&miss(i * 30)));
        }
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, HealthStatus::Unknown);
        assert_eq!(transitions[0].at, at(120));
        assert!(transitions[0].is_failure());
    }

    #[test]
    fn test_device_first_seen_down_then_up_is_silent() {
        let mut m = monitor();
        assert_eq!(m.observe(&down(0)), None);
        assert_eq!(m.observe(&up(30)), None);
        assert_eq!(m.state().status, HealthStatus::Online);
        assert_eq!(m.observe(&up(60)), None);
    }

    #[test]
    fn test_probe_failure_maps_to_error_status() {
        let mut m = monitor();
        m.observe(&up(0));

        let broken = ProbeResult::failed("T001", "10.2.98.112", at(120));
        let t = m.observe(&broken).expect("transition to error");
        assert_eq!(t.to, HealthStatus::Error);
        assert!(t.is_failure());
        assert_eq!(m.state().consecutive_failures, 1);
    }
}
