//! # Aggregation Job - Hourly and Daily Roll-Up
//!
//! Periodically rolls raw pulses into `pulses_hourly` and hourly rows into
//! `pulses_daily`. Aggregation is strictly forward-only: each run resumes
//! from the bucket after the last aggregated one, already-written buckets are
//! never revisited, and raw-pulse TTL expiry therefore cannot corrupt
//! history.
//!
//! ## Batch Caps and the Backlog Contract
//!
//! A single run touches at most 2000 hours and 365 days per monitor, bounding
//! the partitions a run can hit. The caps are an explicit contract: whatever
//! remains is picked up by the next run, which continues from the last
//! aggregated bucket, so a backlog drains monotonically with no gaps and no
//! reprocessing.
//!
//! ## Single-Flight Scheduling
//!
//! Runs are single-flight. A new tick that finds a run younger than the abort
//! ceiling is skipped; a run older than the ceiling is force-aborted through
//! its cancellation token and a fresh run starts. Per-monitor errors are
//! logged and never abort the iteration.

use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config_cache::{ConfigSnapshot, MonitorConfig};
use crate::logging::{log_error, log_info, LogCategory};
use crate::storage::{
    day_floor_ms, hour_floor_ms, DailyRow, HourlyRow, MetricSummary, PulseStorage,
};
use crate::Result;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

/// Tuning for the aggregation job
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Period between runs
    pub run_interval: Duration,
    /// Force-abort ceiling for a run that is still active at the next tick
    pub stale_abort: Duration,
    /// Hours aggregated per monitor per run
    pub hourly_batch_cap: i64,
    /// Days aggregated per monitor per run
    pub daily_batch_cap: i64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            run_interval: Duration::from_secs(600),
            stale_abort: Duration::from_secs(300),
            hourly_batch_cap: 2_000,
            daily_batch_cap: 365,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Run finished; counts of rows written
    Completed { hourly_rows: usize, daily_rows: usize },
    /// A younger run was still active
    Skipped,
    /// The run was cancelled part-way
    Aborted,
}

struct ActiveRun {
    id: u64,
    started: Instant,
    cancel: CancellationToken,
}

/// The roll-up service
pub struct AggregationJob {
    storage: Arc<dyn PulseStorage>,
    config: AggregationConfig,
    active: Mutex<Option<ActiveRun>>,
    next_run_id: std::sync::atomic::AtomicU64,
}

impl AggregationJob {
    pub fn new(storage: Arc<dyn PulseStorage>, config: AggregationConfig) -> Self {
        Self {
            storage,
            config,
            active: Mutex::new(None),
            next_run_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Execute one scheduled run under single-flight rules
    pub async fn run(&self, snapshot: &ConfigSnapshot, now_ms: i64) -> RunOutcome {
        let cancel = CancellationToken::new();
        let run_id = self
            .next_run_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        {
            let mut active = self.active.lock();
            if let Some(run) = active.as_ref() {
                if run.started.elapsed() < self.config.stale_abort {
                    log_info(LogCategory::Aggregation, "previous run still active, skipping");
                    return RunOutcome::Skipped;
                }
                log_info(
                    LogCategory::Aggregation,
                    "previous run exceeded the abort ceiling, cancelling it",
                );
                run.cancel.cancel();
            }
            *active = Some(ActiveRun {
                id: run_id,
                started: Instant::now(),
                cancel: cancel.clone(),
            });
        }

        let outcome = self.run_once(snapshot, &cancel, now_ms).await;

        // Only clear our own registration; a forced replacement owns it now
        let mut active = self.active.lock();
        if active.as_ref().map(|run| run.id) == Some(run_id) {
            *active = None;
        }
        outcome
    }

    /// One pass over every monitor, serial within the run, errors isolated
    async fn run_once(
        &self,
        snapshot: &ConfigSnapshot,
        cancel: &CancellationToken,
        now_ms: i64,
    ) -> RunOutcome {
        let mut hourly_total = 0usize;
        let mut daily_total = 0usize;

        for monitor in snapshot.monitors() {
            if cancel.is_cancelled() {
                log_info(LogCategory::Aggregation, "run aborted");
                return RunOutcome::Aborted;
            }
            match self.aggregate_monitor_hourly(monitor, cancel, now_ms).await {
                Ok(rows) => hourly_total += rows,
                Err(e) => log_error(
                    LogCategory::Aggregation,
                    &format!("hourly roll-up failed for '{}': {e}", monitor.id),
                ),
            }
            match self.aggregate_monitor_daily(monitor, cancel, now_ms).await {
                Ok(rows) => daily_total += rows,
                Err(e) => log_error(
                    LogCategory::Aggregation,
                    &format!("daily roll-up failed for '{}': {e}", monitor.id),
                ),
            }
        }

        if cancel.is_cancelled() {
            return RunOutcome::Aborted;
        }

        counter!("pulse_sentinel_aggregated_hours_total", hourly_total as u64);
        counter!("pulse_sentinel_aggregated_days_total", daily_total as u64);
        if hourly_total > 0 || daily_total > 0 {
            log_info(
                LogCategory::Aggregation,
                &format!("aggregated {hourly_total} hourly and {daily_total} daily rows"),
            );
        }
        RunOutcome::Completed {
            hourly_rows: hourly_total,
            daily_rows: daily_total,
        }
    }

    /// Roll raw pulses into hourly rows for one monitor
    ///
    /// Resumes after the last aggregated hour, or snaps to the hour of the
    /// first ever pulse. The first hour's expected bucket count is scaled to
    /// the remainder of the hour after the first pulse, so a monitor born
    /// mid-hour is not penalized for the minutes before it existed.
    async fn aggregate_monitor_hourly(
        &self,
        monitor: &MonitorConfig,
        cancel: &CancellationToken,
        now_ms: i64,
    ) -> Result<usize> {
        let first_pulse = self.storage.first_pulse_timestamp(&monitor.id).await?;
        let start_hour = match self.storage.last_hourly_bucket(&monitor.id).await? {
            Some(last) => last + HOUR_MS,
            None => match first_pulse {
                Some(ts) => hour_floor_ms(ts),
                None => return Ok(0),
            },
        };

        let last_complete_hour = hour_floor_ms(now_ms - HOUR_MS);
        if start_hour > last_complete_hour {
            return Ok(0);
        }

        let pending_hours = (last_complete_hour - start_hour) / HOUR_MS + 1;
        let batch = pending_hours.min(self.config.hourly_batch_cap);

        let full_hour_expected = (3_600 / monitor.interval).max(1);
        let mut rows = Vec::with_capacity(batch as usize);

        for index in 0..batch {
            if cancel.is_cancelled() {
                break;
            }
            let hour_start = start_hour + index * HOUR_MS;
            let pulses = self
                .storage
                .pulses_in(&monitor.id, hour_start, hour_start + HOUR_MS)
                .await?;

            let expected = match first_pulse {
                Some(first) if hour_floor_ms(first) == hour_start => {
                    let seconds_into = (first - hour_start) / 1000;
                    (((3_600 - seconds_into) as u64) / monitor.interval).max(1)
                }
                _ => full_hour_expected,
            };

            let distinct: HashSet<i64> =
                pulses.iter().map(|p| p.bucket(monitor.interval)).collect();
            let uptime = (distinct.len() as f64 * 100.0 / expected as f64).min(100.0);

            rows.push(HourlyRow {
                monitor_id: monitor.id.clone(),
                hour_start_ms: hour_start,
                uptime,
                latency: MetricSummary::from_values(pulses.iter().filter_map(|p| p.latency_ms)),
                custom1: MetricSummary::from_values(pulses.iter().filter_map(|p| p.custom1)),
                custom2: MetricSummary::from_values(pulses.iter().filter_map(|p| p.custom2)),
                custom3: MetricSummary::from_values(pulses.iter().filter_map(|p| p.custom3)),
            });
        }

        let written = rows.len();
        if written > 0 {
            self.storage.write_hourly(rows).await?;
        }
        Ok(written)
    }

    /// Roll hourly rows into daily rows for one monitor
    ///
    /// Symmetric to the hourly pass: resumes after the last aggregated day,
    /// or snaps to the day of the earliest hourly row. The daily uptime is
    /// the mean of the day's hourly uptimes.
    async fn aggregate_monitor_daily(
        &self,
        monitor: &MonitorConfig,
        cancel: &CancellationToken,
        now_ms: i64,
    ) -> Result<usize> {
        let start_day = match self.storage.last_daily_bucket(&monitor.id).await? {
            Some(last) => last + DAY_MS,
            None => match self.storage.first_hourly_bucket(&monitor.id).await? {
                Some(hour) => day_floor_ms(hour),
                None => return Ok(0),
            },
        };

        let last_complete_day = day_floor_ms(now_ms - DAY_MS);
        if start_day > last_complete_day {
            return Ok(0);
        }

        let pending_days = (last_complete_day - start_day) / DAY_MS + 1;
        let batch = pending_days.min(self.config.daily_batch_cap);

        let mut rows = Vec::with_capacity(batch as usize);
        for index in 0..batch {
            if cancel.is_cancelled() {
                break;
            }
            let day_start = start_day + index * DAY_MS;
            let hourly = self
                .storage
                .hourly_in(&monitor.id, day_start, day_start + DAY_MS)
                .await?;

            let uptime = if hourly.is_empty() {
                0.0
            } else {
                hourly.iter().map(|row| row.uptime).sum::<f64>() / hourly.len() as f64
            };

            rows.push(DailyRow {
                monitor_id: monitor.id.clone(),
                day_start_ms: day_start,
                uptime,
                latency: MetricSummary::merge(hourly.iter().map(|row| row.latency)),
                custom1: MetricSummary::merge(hourly.iter().map(|row| row.custom1)),
                custom2: MetricSummary::merge(hourly.iter().map(|row| row.custom2)),
                custom3: MetricSummary::merge(hourly.iter().map(|row| row.custom3)),
            });
        }

        let written = rows.len();
        if written > 0 {
            self.storage.write_daily(rows).await?;
        }
        Ok(written)
    }
}
