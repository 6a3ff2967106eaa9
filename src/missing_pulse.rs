//! # Missing-Pulse Detector - Absence Detection and Down Lifecycle
//!
//! Storage only records successful pulses, so downtime is detected by
//! absence: a periodic scan walks every monitor, compares the age of its last
//! pulse against the tolerance allowance, and counts misses. Once the miss
//! count reaches the monitor's retry budget the monitor is marked down and
//! the down/still-down/recovered lifecycle begins.
//!
//! ## Scan Semantics
//!
//! The scan fans out per-monitor checks with all-settled semantics: one
//! monitor's error never aborts the others. Monitors without any cached
//! status are only flagged once the process has been running longer than the
//! grace period plus their own tolerance allowance, so a cold start does not
//! instantly alarm every quiet monitor.
//!
//! ## Notification Gating
//!
//! The first notification fires on the transition into down
//! (`consecutive == 1`); re-alerts fire only when the monitor's
//! `resend_notification` budget has elapsed since the last one. The engine
//! applies grace-window and dependency suppression on top, and confirms
//! delivery back via [`MissingPulseDetector::mark_notified`] so the counters
//! honor `last_notified <= consecutive` at all times.

use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::config_cache::{ConfigSnapshot, MonitorConfig};
use crate::logging::{log_info, LogCategory};
use crate::status_evaluator::{EntityStatus, StatusCache, TransitionKind};

/// Consecutive-down bookkeeping for one entity
///
/// Invariant: a positive `consecutive` count always carries a
/// `down_start_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownState {
    /// Successive checks that found the entity down
    pub consecutive: u32,
    /// `consecutive` value at the moment of the last delivered notification
    pub last_notified: u32,
    /// When the entity went down
    pub down_start_ms: i64,
}

impl DownState {
    /// Fresh state for an entity that just went down
    pub fn entered_down(now_ms: i64) -> Self {
        Self {
            consecutive: 1,
            last_notified: 0,
            down_start_ms: now_ms,
        }
    }

    /// Notification gate: first alert on entry, re-alerts per the resend budget
    pub fn should_notify(&self, resend_notification: u32) -> bool {
        if self.consecutive == 1 {
            true
        } else if resend_notification > 0 {
            self.consecutive - self.last_notified >= resend_notification
        } else {
            false
        }
    }

    /// Elapsed downtime
    pub fn downtime_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.down_start_ms).max(0)
    }
}

/// One detector finding, handed to the engine's transition pipeline
#[derive(Debug, Clone)]
pub struct DetectorEvent {
    pub monitor_id: String,
    pub monitor_name: String,
    pub group_id: Option<String>,
    pub kind: TransitionKind,
    pub timestamp_ms: i64,
    /// Whether the notification gate passed (grace and dependency
    /// suppression are applied later, at emit time)
    pub should_notify: bool,
    pub downtime_ms: Option<i64>,
}

/// The missing-pulse detection service
///
/// Owns the per-monitor miss counters and down states. A received pulse
/// clears both through [`handle_pulse_received`](Self::handle_pulse_received).
pub struct MissingPulseDetector {
    missed: DashMap<String, u32>,
    down: DashMap<String, DownState>,
    started_at_ms: AtomicI64,
    last_scan_ms: AtomicI64,
}

impl MissingPulseDetector {
    pub fn new() -> Self {
        Self {
            missed: DashMap::new(),
            down: DashMap::new(),
            started_at_ms: AtomicI64::new(0),
            last_scan_ms: AtomicI64::new(0),
        }
    }

    /// Record process start, anchoring the cold-start allowance
    pub fn mark_started(&self, now_ms: i64) {
        self.started_at_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Reset all runtime counters (configuration reload)
    pub fn clear(&self) {
        self.missed.clear();
        self.down.clear();
    }

    /// Current miss count of a monitor
    pub fn missed_count(&self, monitor_id: &str) -> u32 {
        self.missed.get(monitor_id).map(|c| *c).unwrap_or(0)
    }

    /// Current down state of a monitor
    pub fn down_state(&self, monitor_id: &str) -> Option<DownState> {
        self.down.get(monitor_id).map(|s| *s)
    }

    /// Scan every monitor for missing pulses
    ///
    /// Per-monitor checks run concurrently with all-settled semantics; each
    /// returns at most one event.
    pub async fn scan(
        &self,
        snapshot: &ConfigSnapshot,
        cache: &Arc<StatusCache>,
        now_ms: i64,
        grace_period_ms: i64,
    ) -> Vec<DetectorEvent> {
        self.last_scan_ms.store(now_ms, Ordering::SeqCst);

        let checks = snapshot
            .monitors()
            .iter()
            .map(|monitor| self.check_monitor(monitor, cache, now_ms, grace_period_ms));
        let events: Vec<DetectorEvent> = join_all(checks).await.into_iter().flatten().collect();

        counter!("pulse_sentinel_detector_scans_total", 1);
        events
    }

    /// Check one monitor; returns an event when it crossed a threshold
    async fn check_monitor(
        &self,
        monitor: &MonitorConfig,
        cache: &Arc<StatusCache>,
        now_ms: i64,
        grace_period_ms: i64,
    ) -> Option<DetectorEvent> {
        let max_allowed_ms = monitor.max_allowed_ms();

        let late = match cache.get(&monitor.id) {
            // Never produced a status: only a problem once the process has
            // outlived the grace period plus this monitor's own allowance.
            None => {
                let started = self.started_at_ms.load(Ordering::SeqCst);
                now_ms - started > grace_period_ms + max_allowed_ms
            }
            Some(data) => now_ms - data.last_check_ms > max_allowed_ms,
        };

        if !late {
            return None;
        }

        let missed = {
            let mut entry = self.missed.entry(monitor.id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        counter!("pulse_sentinel_missed_pulses_total", 1);

        if missed < monitor.max_retries {
            return None;
        }

        if let Some(mut state) = self.down.get_mut(&monitor.id) {
            // Already down: every further scan over the threshold counts
            state.consecutive += 1;
            let should = state.should_notify(monitor.resend_notification);
            let downtime = state.downtime_ms(now_ms);
            drop(state);

            return should.then(|| DetectorEvent {
                monitor_id: monitor.id.clone(),
                monitor_name: monitor.name.clone(),
                group_id: monitor.group_id.clone(),
                kind: TransitionKind::StillDown,
                timestamp_ms: now_ms,
                should_notify: true,
                downtime_ms: Some(downtime),
            });
        }

        // Entering down
        let state = DownState::entered_down(now_ms);
        self.down.insert(monitor.id.clone(), state);
        cache.set_status(&monitor.id, EntityStatus::Down);
        log_info(
            LogCategory::Detector,
            &format!("monitor '{}' marked down after {missed} misses", monitor.id),
        );

        Some(DetectorEvent {
            monitor_id: monitor.id.clone(),
            monitor_name: monitor.name.clone(),
            group_id: monitor.group_id.clone(),
            kind: TransitionKind::Down,
            timestamp_ms: now_ms,
            should_notify: state.should_notify(monitor.resend_notification),
            downtime_ms: Some(0),
        })
    }

    /// A valid pulse arrived: clear the miss counter and down state
    ///
    /// Returns the prior down state when the monitor was down, so the caller
    /// can emit a recovered transition.
    pub fn handle_pulse_received(&self, monitor_id: &str) -> Option<DownState> {
        self.missed.remove(monitor_id);
        self.down.remove(monitor_id).map(|(_, state)| state)
    }

    /// The evaluator computed a down status for a monitor
    ///
    /// Idempotent against the detector's own bookkeeping: when the monitor is
    /// already tracked as down nothing changes.
    pub fn record_status_down(&self, monitor_id: &str, now_ms: i64) -> DownState {
        if let Some(state) = self.down.get(monitor_id) {
            return *state;
        }
        let state = DownState::entered_down(now_ms);
        self.down.insert(monitor_id.to_string(), state);
        state
    }

    /// The evaluator computed a non-down status: clear counters, returning
    /// the prior state if the monitor was down
    pub fn record_recovery(&self, monitor_id: &str) -> Option<DownState> {
        self.handle_pulse_received(monitor_id)
    }

    /// Confirm a delivered notification, advancing `last_notified`
    pub fn mark_notified(&self, monitor_id: &str) {
        if let Some(mut state) = self.down.get_mut(monitor_id) {
            state.last_notified = state.consecutive;
        }
    }

    /// Timestamp of the last completed scan
    pub fn last_scan_ms(&self) -> i64 {
        self.last_scan_ms.load(Ordering::SeqCst)
    }

    /// Health signal: the scan loop ran recently
    pub fn is_healthy(&self, now_ms: i64, check_interval_ms: i64) -> bool {
        let last = self.last_scan_ms();
        last > 0 && now_ms - last <= check_interval_ms * 2
    }
}

impl Default for MissingPulseDetector {
    fn default() -> Self {
        Self::new()
    }
}
