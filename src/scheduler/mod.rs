//! Scheduler module: the monitoring engine and its per-device state machines.
//!
//! One background task drives the cycle (probe, persist, reconcile, emit).
//! Probes within a cycle run concurrently on the blocking pool; the engine
//! only ever waits on them up to the probe timeout plus a small grace.

mod health;
mod source;

pub use health::*;
pub use source::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{MonitorSettings, SettingsSource};
use crate::db::StatusUpdate;
use crate::events::{
    CycleCompleted, CycleSummary, DeviceResult, Event, EventBus, EventKind, MonitoringStarted,
    MonitoringStopped, PhaseTimings,
};
use crate::probe::{run_probe, ProbeError, ProbeResult, Prober, PROBE_TIMEOUT};

/// Upper bound on probes in flight within one cycle.
pub const MAX_CONCURRENT_PROBES: usize = 32;
/// How long `stop()` waits for the loop before aborting it.
pub const STOP_GRACE: Duration = Duration::from_secs(5);
/// Extra time a probe gets beyond its own timeout before it is abandoned.
pub const PROBE_GRACE: Duration = Duration::from_secs(1);
/// Consecutive failed batches before persistence is reported degraded.
pub const DEGRADED_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub policy: TransitionPolicy,
    pub probe_timeout: Duration,
    pub probe_grace: Duration,
    pub max_concurrent_probes: usize,
    pub stop_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            policy: TransitionPolicy::default(),
            probe_timeout: PROBE_TIMEOUT,
            probe_grace: PROBE_GRACE,
            max_concurrent_probes: MAX_CONCURRENT_PROBES,
            stop_grace: STOP_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceHealth {
    Ok,
    Degraded,
}

/// Snapshot returned by [`MonitoringEngine::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub is_running: bool,
    pub devices_count: usize,
    /// Seconds between cycle starts.
    pub ping_interval: u64,
    pub reload_interval: u64,
    pub last_config_check: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleSummary>,
    pub persistence: PersistenceHealth,
    pub devices: Vec<DeviceSnapshot>,
}

/// Outcome of one completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    #[serde(flatten)]
    pub summary: CycleSummary,
    pub results: Vec<DeviceResult>,
    /// Number of transition events published by the cycle.
    pub transitions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub total: usize,
    /// New devices, including devices whose address changed.
    pub added: usize,
    pub removed: usize,
    pub kept: usize,
    pub ping_interval: u64,
}

struct EngineState {
    monitors: BTreeMap<String, DeviceMonitor>,
    settings: MonitorSettings,
    last_config_check: Option<DateTime<Utc>>,
    last_reload: Option<Instant>,
    reload_failed: bool,
    last_cycle: Option<CycleSummary>,
    persist_failures: u32,
}

struct Runner {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct EngineInner {
    source: Arc<dyn DeviceSource>,
    prober: Arc<dyn Prober>,
    settings: Arc<dyn SettingsSource>,
    bus: EventBus,
    options: EngineOptions,
    state: Mutex<EngineState>,
    /// Serializes cycles and reloads.
    cycle_lock: Mutex<()>,
    runner: Mutex<Option<Runner>>,
    running: AtomicBool,
}

/// Owns the device monitors and drives the periodic monitoring cycle.
#[derive(Clone)]
pub struct MonitoringEngine {
    inner: Arc<EngineInner>,
}

impl MonitoringEngine {
    pub fn new(
        source: Arc<dyn DeviceSource>,
        prober: Arc<dyn Prober>,
        settings: Arc<dyn SettingsSource>,
        bus: EventBus,
    ) -> Self {
        Self::with_options(source, prober, settings, bus, EngineOptions::default())
    }

    pub fn with_options(
        source: Arc<dyn DeviceSource>,
        prober: Arc<dyn Prober>,
        settings: Arc<dyn SettingsSource>,
        bus: EventBus,
        options: EngineOptions,
    ) -> Self {
        let initial = settings.monitor_settings();
        Self {
            inner: Arc::new(EngineInner {
                source,
                prober,
                settings,
                bus,
                options,
                state: Mutex::new(EngineState {
                    monitors: BTreeMap::new(),
                    settings: initial,
                    last_config_check: None,
                    last_reload: None,
                    reload_failed: false,
                    last_cycle: None,
                    persist_failures: 0,
                }),
                cycle_lock: Mutex::new(()),
                runner: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Load devices and begin the periodic cycle. No-op when already running.
    ///
    /// An unavailable device source leaves the engine running with the
    /// last-known (initially empty) device set.
    pub async fn start(&self) {
        let mut runner = self.inner.runner.lock().await;
        if runner.is_some() {
            tracing::debug!("Monitoring already running");
            return;
        }

        // Errors are logged by the reload itself
        let _ = self.reload_configuration().await;

        let (devices_count, ping_interval) = {
            let state = self.inner.state.lock().await;
            (state.monitors.len(), state.settings.ping_interval.as_secs())
        };
        tracing::info!(
            "Monitoring started: {} devices, ping interval {}s",
            devices_count,
            ping_interval
        );
        self.inner
            .bus
            .publish(Event::new(EventKind::MonitoringStarted(MonitoringStarted {
                devices_count,
                ping_interval,
            })));

        let (stop_tx, stop_rx) = watch::channel(false);
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run_loop(stop_rx).await });
        *runner = Some(Runner {
            stop: stop_tx,
            handle,
        });
        self.inner.running.store(true, Ordering::SeqCst);
    }

    /// Cancel the cycle and release every monitor. No-op when not running.
    ///
    /// The loop gets `stop_grace` to wind down before it is aborted.
    pub async fn stop(&self) {
        let mut runner = self.inner.runner.lock().await;
        let Some(Runner { stop, mut handle }) = runner.take() else {
            tracing::debug!("Monitoring not running");
            return;
        };

        let _ = stop.send(true);
        if tokio::time::timeout(self.inner.options.stop_grace, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(
                "Monitoring loop did not stop within {:?}, aborting",
                self.inner.options.stop_grace
            );
            handle.abort();
            let _ = handle.await;
        }
        self.inner.running.store(false, Ordering::SeqCst);

        let devices_count = {
            let mut state = self.inner.state.lock().await;
            let count = state.monitors.len();
            state.monitors.clear();
            state.last_reload = None;
            count
        };
        tracing::info!("Monitoring stopped ({} devices released)", devices_count);
        self.inner
            .bus
            .publish(Event::new(EventKind::MonitoringStopped(MonitoringStopped {
                devices_count,
            })));
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run one cycle immediately without touching the periodic timer.
    ///
    /// Loads devices first when none are known. Returns `None` if `stop()`
    /// cancelled the cycle midway.
    pub async fn ping_now(&self) -> Option<CycleReport> {
        let empty = self.inner.state.lock().await.monitors.is_empty();
        if empty {
            let _ = self.reload_configuration().await;
        }

        let stop = self
            .inner
            .runner
            .lock()
            .await
            .as_ref()
            .map(|r| r.stop.subscribe());
        self.run_cycle(stop.as_ref()).await
    }

    /// Re-read device records and monitoring settings.
    ///
    /// Devices no longer enabled are dropped, new ones get a fresh monitor
    /// and existing ones keep theirs. A device whose address changed is
    /// treated as new. On error the current set is kept.
    pub async fn reload_configuration(&self) -> Result<ReloadSummary, SourceError> {
        let _cycle = self.inner.cycle_lock.lock().await;

        let source = self.inner.source.clone();
        let settings_source = self.inner.settings.clone();
        let (records, settings) = tokio::task::spawn_blocking(move || {
            (
                source.list_enabled_devices(),
                settings_source.monitor_settings(),
            )
        })
        .await
        .map_err(|e| SourceError::Unavailable(format!("reload task failed: {}", e)))?;

        let mut state = self.inner.state.lock().await;
        state.settings = settings;
        state.last_config_check = Some(Utc::now());
        state.last_reload = Some(Instant::now());

        let records = match records {
            Ok(records) => {
                state.reload_failed = false;
                records
            }
            Err(e) => {
                state.reload_failed = true;
                tracing::error!(
                    "Failed to load devices, keeping {} monitors: {}",
                    state.monitors.len(),
                    e
                );
                return Err(e);
            }
        };

        let policy = self.inner.options.policy;
        let mut previous = std::mem::take(&mut state.monitors);
        let mut next = BTreeMap::new();
        let (mut added, mut kept) = (0, 0);

        for record in records.into_iter().filter(|r| r.enabled) {
            if next.contains_key(&record.id) {
                tracing::warn!("Duplicate device {} ignored", record.id);
                continue;
            }
            match previous.remove(&record.id) {
                Some(monitor) if monitor.address() == record.address.trim() => {
                    kept += 1;
                    next.insert(record.id, monitor);
                }
                _ => match DeviceMonitor::new(&record.id, &record.address, policy) {
                    Ok(monitor) => {
                        added += 1;
                        next.insert(record.id, monitor);
                    }
                    Err(e) => tracing::error!("Skipping device: {}", e),
                },
            }
        }

        let summary = ReloadSummary {
            total: next.len(),
            added,
            removed: previous.len(),
            kept,
            ping_interval: state.settings.ping_interval.as_secs(),
        };
        state.monitors = next;

        tracing::info!(
            "Configuration reloaded: {} devices ({} added, {} removed), ping interval {}s",
            summary.total,
            summary.added,
            summary.removed,
            summary.ping_interval
        );
        Ok(summary)
    }

    /// Copy of every monitor's state plus the active settings.
    pub async fn get_status(&self) -> EngineStatus {
        let state = self.inner.state.lock().await;
        EngineStatus {
            is_running: self.is_running(),
            devices_count: state.monitors.len(),
            ping_interval: state.settings.ping_interval.as_secs(),
            reload_interval: state.settings.reload_interval.as_secs(),
            last_config_check: state.last_config_check,
            last_cycle: state.last_cycle.clone(),
            persistence: if state.persist_failures >= DEGRADED_AFTER_FAILURES {
                PersistenceHealth::Degraded
            } else {
                PersistenceHealth::Ok
            },
            devices: state.monitors.values().map(DeviceMonitor::snapshot).collect(),
        }
    }

    async fn run_loop(self, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }
            let started = Instant::now();

            if self.reload_due().await {
                let _ = self.reload_configuration().await;
            }
            self.run_cycle(Some(&stop)).await;

            let interval = self.inner.state.lock().await.settings.ping_interval;
            let idle = idle_after(interval, started.elapsed());
            tracing::debug!("Next cycle in {:?}", idle);

            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }
        tracing::info!("Monitoring loop exited");
    }

    async fn reload_due(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.reload_failed
            || state
                .last_reload
                .map_or(true, |at| at.elapsed() >= state.settings.reload_interval)
    }

    async fn run_cycle(&self, stop: Option<&watch::Receiver<bool>>) -> Option<CycleReport> {
        let _cycle = self.inner.cycle_lock.lock().await;
        let cancelled = || stop.is_some_and(|s| *s.borrow());

        let targets: Vec<(String, String)> = {
            let state = self.inner.state.lock().await;
            state
                .monitors
                .values()
                .map(|m| (m.device_id().to_string(), m.address().to_string()))
                .collect()
        };

        // Probe
        let phase = Instant::now();
        let results = self.probe_all(targets).await;
        let probe_ms = elapsed_ms(phase);
        if cancelled() {
            tracing::debug!("Cycle cancelled after probe phase");
            return None;
        }

        // Persist
        let phase = Instant::now();
        self.persist(&results).await;
        let persist_ms = elapsed_ms(phase);
        if cancelled() {
            tracing::debug!("Cycle cancelled after persist phase");
            return None;
        }

        // Reconcile
        let phase = Instant::now();
        let mut transitions = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            for result in &results {
                if let Some(monitor) = state.monitors.get_mut(&result.device_id) {
                    transitions.extend(monitor.observe(result));
                }
            }
        }
        let reconcile_ms = elapsed_ms(phase);

        // Emit
        let device_results: Vec<DeviceResult> = results
            .iter()
            .map(|r| DeviceResult {
                device_id: r.device_id.clone(),
                ip: r.ip.clone(),
                status: HealthStatus::from_probe(r),
                response_time: r.latency_ms,
            })
            .collect();
        let timings = PhaseTimings {
            probe_ms,
            persist_ms,
            reconcile_ms,
        };
        let summary = CycleSummary::tally(device_results.iter().map(|r| &r.status), timings);

        for transition in &transitions {
            self.inner
                .bus
                .publish(Event::new(EventKind::from_transition(transition)));
        }
        self.inner
            .bus
            .publish(Event::new(EventKind::CycleCompleted(CycleCompleted {
                summary: summary.clone(),
                results: device_results.clone(),
            })));

        self.inner.state.lock().await.last_cycle = Some(summary.clone());

        tracing::info!(
            "Cycle completed: {} devices ({} online, {} offline, {} error), {} transitions, probe={}ms persist={}ms reconcile={}ms",
            summary.total,
            summary.online,
            summary.offline,
            summary.error,
            transitions.len(),
            probe_ms,
            persist_ms,
            reconcile_ms
        );

        Some(CycleReport {
            summary,
            results: device_results,
            transitions: transitions.len(),
        })
    }

    /// Probe every target concurrently. Results keep the order of `targets`.
    async fn probe_all(&self, targets: Vec<(String, String)>) -> Vec<ProbeResult> {
        let options = &self.inner.options;
        let semaphore = Arc::new(Semaphore::new(options.max_concurrent_probes.max(1)));
        let timeout = options.probe_timeout;
        let deadline = options.probe_timeout + options.probe_grace;

        let mut set = JoinSet::new();
        for (index, (device_id, address)) in targets.iter().cloned().enumerate() {
            let prober = self.inner.prober.clone();
            let semaphore = semaphore.clone();

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let checked_at = Utc::now();
                let probe = run_probe(prober.as_ref(), &device_id, &address, timeout);

                let result = match tokio::time::timeout(deadline, probe).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            "Probe of {} ({}) abandoned after {:?}",
                            device_id,
                            address,
                            deadline
                        );
                        ProbeResult::from_outcome(
                            &device_id,
                            &address,
                            Err(ProbeError::Timeout(timeout)),
                            checked_at,
                        )
                    }
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<ProbeResult>> = vec![None; targets.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => tracing::error!("Probe task failed: {}", e),
            }
        }

        slots
            .into_iter()
            .zip(targets)
            .map(|(slot, (device_id, address))| {
                slot.unwrap_or_else(|| ProbeResult::failed(&device_id, &address, Utc::now()))
            })
            .collect()
    }

    async fn persist(&self, results: &[ProbeResult]) {
        if results.is_empty() {
            return;
        }

        let updates: Vec<StatusUpdate> = results.iter().map(StatusUpdate::from_probe).collect();
        let source = self.inner.source.clone();
        let outcome = tokio::task::spawn_blocking(move || source.apply_status_batch(&updates))
            .await
            .map_err(|e| format!("persist task failed: {}", e))
            .and_then(|r| r.map_err(|e| e.to_string()));

        let mut state = self.inner.state.lock().await;
        match outcome {
            Ok(()) => {
                if state.persist_failures >= DEGRADED_AFTER_FAILURES {
                    tracing::info!("Persistence recovered");
                }
                state.persist_failures = 0;
            }
            Err(e) => {
                state.persist_failures += 1;
                if state.persist_failures == DEGRADED_AFTER_FAILURES {
                    tracing::warn!(
                        "Persistence degraded after {} consecutive failures: {}",
                        state.persist_failures,
                        e
                    );
                } else {
                    tracing::error!("Failed to persist status batch: {}", e);
                }
            }
        }
    }
}

/// Sleep before the next cycle, measured from the start of the last one.
pub fn idle_after(interval: Duration, cycle_elapsed: Duration) -> Duration {
    interval.saturating_sub(cycle_elapsed)
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
