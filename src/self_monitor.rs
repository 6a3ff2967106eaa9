//! # Self-Monitor - Storage Liveness and Outage Backfill
//!
//! A dedicated synthetic monitor that probes the storage backend with a
//! trivial query on a short, drift-corrected schedule and pushes a pulse for
//! itself on success. When the backend comes back after an outage, the
//! self-monitor computes the outage window and runs **backfill**: for every
//! monitor that was known healthy just before the outage, pulses are
//! synthesized at that monitor's interval so its uptime is not penalized for
//! the server's own blind spot.
//!
//! ## Backfill Rules
//!
//! - A monitor qualifies when a non-synthetic pulse exists in the window
//!   `[outage_start - 2 * interval, outage_start)`.
//! - Pulses are synthesized at aligned interval boundaries, from the first
//!   boundary inside the outage through the current interval boundary,
//!   capped per monitor.
//! - The current interval always receives a pulse when it falls after the
//!   outage start, even under the cap.
//! - Synthesized pulses carry `synthetic = true` and either the last-known
//!   measurements or nulls, per the configured latency strategy.
//! - Concurrent backfills are rejected.

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config_cache::ConfigSnapshot;
use crate::logging::{log_error, log_info, LogCategory};
use crate::storage::{format_ms, PulseRecord, PulseStorage};
use crate::{MonitorError, Result};

/// Reserved monitor ID under which the self-monitor stores its own pulses
pub const SELF_MONITOR_ID: &str = "@self";

/// How many synthesized rows are written per storage insert
const BACKFILL_CHUNK: usize = 500;

/// Latency policy for synthesized pulses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyStrategy {
    /// Copy the last known latency and custom metrics
    LastKnown,
    /// Store nulls
    Null,
}

/// Tuning for the self-monitor
#[derive(Debug, Clone)]
pub struct SelfMonitorConfig {
    /// Probe period
    pub probe_interval: Duration,
    /// Latency policy for synthesized pulses
    pub latency_strategy: LatencyStrategy,
    /// Upper bound on synthesized pulses per monitor per backfill
    pub backfill_cap: usize,
}

impl Default for SelfMonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(3),
            latency_strategy: LatencyStrategy::LastKnown,
            backfill_cap: 10_000,
        }
    }
}

/// Result of one backfill pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Monitors that qualified as known healthy
    pub monitors_backfilled: usize,
    /// Total synthesized pulses written
    pub pulses_written: usize,
}

/// The storage liveness service
pub struct SelfMonitor {
    storage: Arc<dyn PulseStorage>,
    config: SelfMonitorConfig,
    down_since_ms: Mutex<Option<i64>>,
    healthy: AtomicBool,
    backfill_running: AtomicBool,
}

impl SelfMonitor {
    pub fn new(storage: Arc<dyn PulseStorage>, config: SelfMonitorConfig) -> Self {
        Self {
            storage,
            config,
            down_since_ms: Mutex::new(None),
            healthy: AtomicBool::new(true),
            backfill_running: AtomicBool::new(false),
        }
    }

    /// Probe period, for the scheduler
    pub fn probe_interval(&self) -> Duration {
        self.config.probe_interval
    }

    /// Whether the last probe succeeded
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Start of the current outage, if the backend is down
    pub fn down_since_ms(&self) -> Option<i64> {
        *self.down_since_ms.lock()
    }

    /// Run one probe cycle
    ///
    /// On success after an outage the outage window is closed and backfill
    /// runs before the method returns.
    pub async fn probe(&self, snapshot: &ConfigSnapshot, now_ms: i64) -> Option<BackfillReport> {
        let started = Instant::now();
        match self.storage.ping().await {
            Ok(()) => {
                let probe_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.healthy.store(true, Ordering::SeqCst);

                let pulse = PulseRecord {
                    monitor_id: SELF_MONITOR_ID.to_string(),
                    timestamp_ms: now_ms,
                    latency_ms: Some(probe_latency_ms),
                    custom1: None,
                    custom2: None,
                    custom3: None,
                    synthetic: false,
                };
                if let Err(e) = self.storage.insert_pulses(vec![pulse]).await {
                    log_error(
                        LogCategory::Backfill,
                        &format!("self-monitor pulse insert failed: {e}"),
                    );
                }

                let outage_start = self.down_since_ms.lock().take();
                if let Some(outage_start_ms) = outage_start {
                    log_info(
                        LogCategory::Backfill,
                        &format!(
                            "storage recovered, outage began at {}",
                            format_ms(outage_start_ms)
                        ),
                    );
                    match self.backfill(snapshot, outage_start_ms, now_ms).await {
                        Ok(report) => return Some(report),
                        Err(e) => log_error(LogCategory::Backfill, &format!("backfill failed: {e}")),
                    }
                }
                None
            }
            Err(e) => {
                self.healthy.store(false, Ordering::SeqCst);
                let mut down_since = self.down_since_ms.lock();
                if down_since.is_none() {
                    *down_since = Some(now_ms);
                    log_error(
                        LogCategory::Backfill,
                        &format!("storage probe failed, outage window opened: {e}"),
                    );
                }
                None
            }
        }
    }

    /// Synthesize pulses covering a storage outage
    ///
    /// Only monitors with a real pulse shortly before the outage qualify;
    /// everything else genuinely may have been down and stays untouched.
    pub async fn backfill(
        &self,
        snapshot: &ConfigSnapshot,
        outage_start_ms: i64,
        now_ms: i64,
    ) -> Result<BackfillReport> {
        if self.backfill_running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::Conflict(
                "backfill already running".to_string(),
            ));
        }

        let result = self
            .backfill_inner(snapshot, outage_start_ms, now_ms)
            .await;
        self.backfill_running.store(false, Ordering::SeqCst);
        result
    }

    async fn backfill_inner(
        &self,
        snapshot: &ConfigSnapshot,
        outage_start_ms: i64,
        now_ms: i64,
    ) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();

        for monitor in snapshot.monitors() {
            let interval_ms = monitor.interval as i64 * 1000;

            let reference = self
                .storage
                .last_real_pulse_in(
                    &monitor.id,
                    outage_start_ms - 2 * interval_ms,
                    outage_start_ms,
                )
                .await?;
            let Some(reference) = reference else {
                continue;
            };

            let boundaries =
                aligned_boundaries(outage_start_ms, now_ms, interval_ms, self.config.backfill_cap);
            if boundaries.is_empty() {
                continue;
            }

            let (latency_ms, custom1, custom2, custom3) = match self.config.latency_strategy {
                LatencyStrategy::LastKnown => (
                    reference.latency_ms,
                    reference.custom1,
                    reference.custom2,
                    reference.custom3,
                ),
                LatencyStrategy::Null => (None, None, None, None),
            };

            let records: Vec<PulseRecord> = boundaries
                .iter()
                .map(|&timestamp_ms| PulseRecord {
                    monitor_id: monitor.id.clone(),
                    timestamp_ms,
                    latency_ms,
                    custom1,
                    custom2,
                    custom3,
                    synthetic: true,
                })
                .collect();

            report.monitors_backfilled += 1;
            report.pulses_written += records.len();
            for chunk in records.chunks(BACKFILL_CHUNK) {
                self.storage.insert_pulses(chunk.to_vec()).await?;
            }

            log_info(
                LogCategory::Backfill,
                &format!(
                    "synthesized {} pulses for '{}' from {}",
                    records.len(),
                    monitor.id,
                    format_ms(boundaries[0])
                ),
            );
        }

        counter!(
            "pulse_sentinel_backfilled_pulses_total",
            report.pulses_written as u64
        );
        Ok(report)
    }
}

/// Aligned interval boundaries inside an outage window
///
/// From the first boundary at or after the outage start through the current
/// interval boundary, capped. The current boundary always makes the cut so
/// the present interval carries a pulse.
fn aligned_boundaries(outage_start_ms: i64, now_ms: i64, interval_ms: i64, cap: usize) -> Vec<i64> {
    let current_boundary = now_ms - now_ms.rem_euclid(interval_ms);
    if current_boundary < outage_start_ms {
        return Vec::new();
    }

    let first_boundary = if outage_start_ms.rem_euclid(interval_ms) == 0 {
        outage_start_ms
    } else {
        outage_start_ms - outage_start_ms.rem_euclid(interval_ms) + interval_ms
    };

    let mut boundaries = Vec::new();
    let mut t = first_boundary;
    while t <= current_boundary && boundaries.len() < cap {
        boundaries.push(t);
        t += interval_ms;
    }

    if boundaries.last() != Some(&current_boundary) {
        if boundaries.len() == cap {
            boundaries.pop();
        }
        boundaries.push(current_boundary);
    }
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_cache::{ConfigDocument, CoreSettings, MonitorConfig};
    use crate::storage::MemoryStorage;

    const NOW: i64 = 1_700_000_000_000;

    fn monitor(id: &str, interval: u64) -> MonitorConfig {
        MonitorConfig {
            id: id.to_string(),
            token: format!("tok-{id}"),
            name: id.to_uppercase(),
            interval,
            max_retries: 3,
            tolerance_factor: 1.5,
            resend_notification: 0,
            group_id: None,
            notification_channels: Vec::new(),
            custom_metrics: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    fn snapshot(monitors: Vec<MonitorConfig>) -> ConfigSnapshot {
        ConfigSnapshot::build(ConfigDocument {
            settings: CoreSettings::default(),
            monitors,
            ..ConfigDocument::default()
        })
        .unwrap()
    }

    fn real_pulse(id: &str, timestamp_ms: i64) -> PulseRecord {
        PulseRecord {
            monitor_id: id.to_string(),
            timestamp_ms,
            latency_ms: Some(25.0),
            custom1: Some(1.0),
            custom2: None,
            custom3: None,
            synthetic: false,
        }
    }

    #[test]
    fn test_aligned_boundaries_window() {
        // 30s interval, outage from 10s past a boundary
        let interval = 30_000;
        let outage_start = 1_000_000_010_000;
        let now = 1_000_000_130_000;
        let boundaries = aligned_boundaries(outage_start, now, interval, 10_000);

        assert_eq!(boundaries.first(), Some(&1_000_000_020_000));
        assert_eq!(boundaries.last(), Some(&1_000_000_110_000));
        for b in &boundaries {
            assert!(*b >= outage_start && *b <= now);
            assert_eq!(b % interval, 0);
        }
    }

    #[test]
    fn test_aligned_boundaries_cap_keeps_current_interval() {
        let interval = 1_000;
        let outage_start = 0;
        let now = 100_000;
        let boundaries = aligned_boundaries(outage_start, now, interval, 10);

        assert_eq!(boundaries.len(), 10);
        assert_eq!(
            boundaries.last(),
            Some(&100_000),
            "current boundary survives the cap"
        );
    }

    #[test]
    fn test_no_boundary_before_outage() {
        // Outage starts after the only boundary in range
        let boundaries = aligned_boundaries(95_500, 95_900, 1_000, 100);
        assert!(boundaries.is_empty());
    }

    #[tokio::test]
    async fn test_probe_tracks_outage_window() {
        let storage = Arc::new(MemoryStorage::new());
        let monitor_svc = SelfMonitor::new(storage.clone(), SelfMonitorConfig::default());
        let snap = snapshot(vec![]);

        assert!(monitor_svc.probe(&snap, NOW).await.is_none());
        assert!(monitor_svc.is_healthy());
        assert_eq!(storage.pulse_count(SELF_MONITOR_ID), 1);

        storage.set_available(false);
        monitor_svc.probe(&snap, NOW + 3_000).await;
        assert!(!monitor_svc.is_healthy());
        assert_eq!(monitor_svc.down_since_ms(), Some(NOW + 3_000));

        // Outage start is pinned to the first failure
        monitor_svc.probe(&snap, NOW + 6_000).await;
        assert_eq!(monitor_svc.down_since_ms(), Some(NOW + 3_000));
    }

    #[tokio::test]
    async fn test_recovery_backfills_known_healthy_monitors() {
        let storage = Arc::new(MemoryStorage::new());
        let snap = snapshot(vec![monitor("healthy", 30), monitor("silent", 30)]);
        let monitor_svc = SelfMonitor::new(storage.clone(), SelfMonitorConfig::default());

        let outage_start = NOW;
        // 'healthy' pulsed just before the outage; 'silent' did not
        storage
            .insert_pulses(vec![real_pulse("healthy", outage_start - 15_000)])
            .await
            .unwrap();

        storage.set_available(false);
        monitor_svc.probe(&snap, outage_start).await;

        storage.set_available(true);
        let report = monitor_svc
            .probe(&snap, outage_start + 300_000)
            .await
            .expect("recovery runs backfill");

        assert_eq!(report.monitors_backfilled, 1);
        assert!(report.pulses_written > 0);

        let synthesized = storage.synthetic_pulses("healthy");
        assert_eq!(synthesized.len(), report.pulses_written);
        for pulse in &synthesized {
            assert!(pulse.timestamp_ms >= outage_start);
            assert!(pulse.timestamp_ms <= outage_start + 300_000);
            assert_eq!(pulse.latency_ms, Some(25.0), "last-known strategy");
            assert_eq!(pulse.custom1, Some(1.0));
        }
        assert!(storage.synthetic_pulses("silent").is_empty());
    }

    #[tokio::test]
    async fn test_null_latency_strategy() {
        let storage = Arc::new(MemoryStorage::new());
        let snap = snapshot(vec![monitor("m1", 30)]);
        let config = SelfMonitorConfig {
            latency_strategy: LatencyStrategy::Null,
            ..SelfMonitorConfig::default()
        };
        let monitor_svc = SelfMonitor::new(storage.clone(), config);

        storage
            .insert_pulses(vec![real_pulse("m1", NOW - 10_000)])
            .await
            .unwrap();

        monitor_svc.backfill(&snap, NOW, NOW + 120_000).await.unwrap();

        for pulse in storage.synthetic_pulses("m1") {
            assert_eq!(pulse.latency_ms, None);
            assert_eq!(pulse.custom1, None);
        }
    }

    #[tokio::test]
    async fn test_concurrent_backfill_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let snap = snapshot(vec![]);
        let monitor_svc = SelfMonitor::new(storage, SelfMonitorConfig::default());

        monitor_svc.backfill_running.store(true, Ordering::SeqCst);
        let err = monitor_svc.backfill(&snap, NOW, NOW + 1_000).await.unwrap_err();
        assert!(matches!(err, MonitorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_backfill_cap_bounds_per_monitor() {
        let storage = Arc::new(MemoryStorage::new());
        let snap = snapshot(vec![monitor("m1", 1)]);
        let config = SelfMonitorConfig {
            backfill_cap: 50,
            ..SelfMonitorConfig::default()
        };
        let monitor_svc = SelfMonitor::new(storage.clone(), config);

        storage
            .insert_pulses(vec![real_pulse("m1", NOW - 500)])
            .await
            .unwrap();

        // A 10-minute outage with a 1s interval would exceed the cap
        let report = monitor_svc.backfill(&snap, NOW, NOW + 600_000).await.unwrap();
        assert_eq!(report.pulses_written, 50);
    }
}
