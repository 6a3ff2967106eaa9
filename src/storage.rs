//! # Pulse Storage - Backend Seam and Reference Implementation
//!
//! All time-series state (raw pulses, hourly and daily aggregates, incidents)
//! lives in an external columnar store. The core talks to it exclusively
//! through the [`PulseStorage`] trait so the production backend, the
//! self-monitor's failure injection and the test suites all share one
//! contract.
//!
//! [`MemoryStorage`] is the in-process reference backend: it implements the
//! full contract over concurrent maps, supports simulated outages for
//! self-monitor and backfill testing, and is the backend the integration
//! suites run against.
//!
//! ## Range Conventions
//!
//! - Bucket-count queries use a half-open-at-the-start window `(start, end]`,
//!   matching the uptime formula's `(now - period, now - tolerance]`.
//! - Row scans (`pulses_in`, `hourly_in`, `daily_in`) use `[start, end)`,
//!   matching aggregation's bucket boundaries.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{MonitorError, Result};

/// A single timestamped sample from a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseRecord {
    /// Owning monitor
    pub monitor_id: String,
    /// Authoritative sample timestamp in epoch milliseconds
    pub timestamp_ms: i64,
    /// Measured latency in milliseconds, if the probe reported one
    pub latency_ms: Option<f64>,
    /// User-defined metric slot 1
    pub custom1: Option<f64>,
    /// User-defined metric slot 2
    pub custom2: Option<f64>,
    /// User-defined metric slot 3
    pub custom3: Option<f64>,
    /// True for pulses synthesized by backfill
    pub synthetic: bool,
}

impl PulseRecord {
    /// Interval bucket this pulse falls into
    pub fn bucket(&self, interval_secs: u64) -> i64 {
        (self.timestamp_ms / 1000) / interval_secs as i64
    }
}

/// min/max/avg summary of one numeric column over a bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
}

impl MetricSummary {
    /// Summarize the present values of an iterator
    pub fn from_values(values: impl Iterator<Item = f64>) -> Self {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0u64;
        for value in values {
            min = min.min(value);
            max = max.max(value);
            sum += value;
            count += 1;
        }
        if count == 0 {
            Self::default()
        } else {
            Self {
                min: Some(min),
                max: Some(max),
                avg: Some(sum / count as f64),
            }
        }
    }

    /// Merge per-bucket summaries into a coarser one (min of mins, max of
    /// maxes, mean of averages)
    pub fn merge(parts: impl Iterator<Item = MetricSummary>) -> Self {
        let mut min: Option<f64> = None;
        let mut max: Option<f64> = None;
        let mut avg_sum = 0.0;
        let mut avg_count = 0u64;
        for part in parts {
            if let Some(value) = part.min {
                min = Some(min.map_or(value, |m: f64| m.min(value)));
            }
            if let Some(value) = part.max {
                max = Some(max.map_or(value, |m: f64| m.max(value)));
            }
            if let Some(value) = part.avg {
                avg_sum += value;
                avg_count += 1;
            }
        }
        Self {
            min,
            max,
            avg: (avg_count > 0).then(|| avg_sum / avg_count as f64),
        }
    }
}

/// One row of `pulses_hourly`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRow {
    pub monitor_id: String,
    /// Hour bucket start in epoch milliseconds
    pub hour_start_ms: i64,
    /// Uptime percentage for the hour (0..=100)
    pub uptime: f64,
    pub latency: MetricSummary,
    pub custom1: MetricSummary,
    pub custom2: MetricSummary,
    pub custom3: MetricSummary,
}

/// One row of `pulses_daily`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRow {
    pub monitor_id: String,
    /// Day bucket start in epoch milliseconds (UTC midnight)
    pub day_start_ms: i64,
    /// Uptime percentage for the day (0..=100)
    pub uptime: f64,
    pub latency: MetricSummary,
    pub custom1: MetricSummary,
    pub custom2: MetricSummary,
    pub custom3: MetricSummary,
}

/// Incident lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncidentStatus {
    Investigating,
    Identified,
    Monitoring,
    Resolved,
}

/// A progress note attached to an incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentUpdate {
    pub message: String,
    pub status: IncidentStatus,
    pub timestamp_ms: i64,
}

/// An operator-declared incident affecting one or more entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub status: IncidentStatus,
    pub started_at_ms: i64,
    pub resolved_at_ms: Option<i64>,
    /// Monitor and group IDs this incident affects
    pub affected: Vec<String>,
    pub updates: Vec<IncidentUpdate>,
}

/// Contract every storage backend fulfills
///
/// All methods surface transient backend trouble as
/// [`MonitorError::StorageUnavailable`]; the self-monitor turns that signal
/// into an outage window and drives backfill on recovery.
#[async_trait]
pub trait PulseStorage: Send + Sync {
    /// Trivial liveness query used by the self-monitor
    async fn ping(&self) -> Result<()>;

    /// Append a batch of pulses as one insert
    async fn insert_pulses(&self, batch: Vec<PulseRecord>) -> Result<()>;

    /// Most recent pulse for a monitor
    async fn latest_pulse(&self, monitor_id: &str) -> Result<Option<PulseRecord>>;

    /// Most recent non-synthetic pulse with `start_ms <= ts < end_ms`
    async fn last_real_pulse_in(
        &self,
        monitor_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Option<PulseRecord>>;

    /// Count distinct interval buckets containing at least one pulse over
    /// the window `(start_ms, end_ms]`
    async fn count_interval_buckets(
        &self,
        monitor_id: &str,
        interval_secs: u64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<u64>;

    /// Pulses with `start_ms <= ts < end_ms`, ascending by timestamp
    async fn pulses_in(
        &self,
        monitor_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<PulseRecord>>;

    /// Timestamp of the first ever pulse for a monitor
    async fn first_pulse_timestamp(&self, monitor_id: &str) -> Result<Option<i64>>;

    /// Start of the most recent aggregated hour
    async fn last_hourly_bucket(&self, monitor_id: &str) -> Result<Option<i64>>;

    /// Start of the earliest aggregated hour
    async fn first_hourly_bucket(&self, monitor_id: &str) -> Result<Option<i64>>;

    /// Upsert hourly rows
    async fn write_hourly(&self, rows: Vec<HourlyRow>) -> Result<()>;

    /// Hourly rows with `start_ms <= hour_start < end_ms`, ascending
    async fn hourly_in(
        &self,
        monitor_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<HourlyRow>>;

    /// Start of the most recent aggregated day
    async fn last_daily_bucket(&self, monitor_id: &str) -> Result<Option<i64>>;

    /// Upsert daily rows
    async fn write_daily(&self, rows: Vec<DailyRow>) -> Result<()>;

    /// Daily rows with `start_ms <= day_start < end_ms`, ascending
    async fn daily_in(
        &self,
        monitor_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<DailyRow>>;

    /// Incidents overlapping `[start_ms, end_ms)` that affect any of the given entities
    async fn incidents_in(
        &self,
        entity_ids: &[String],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Incident>>;
}

/// In-process reference backend
///
/// Pulses are kept per monitor, sorted by timestamp; aggregates live in
/// ordered maps keyed by bucket start. `set_available(false)` makes every
/// call fail with `StorageUnavailable`, simulating a backend outage.
#[derive(Default)]
pub struct MemoryStorage {
    pulses: DashMap<String, Vec<PulseRecord>>,
    hourly: DashMap<String, BTreeMap<i64, HourlyRow>>,
    daily: DashMap<String, BTreeMap<i64, DailyRow>>,
    incidents: RwLock<Vec<Incident>>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated availability
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Record an incident (normally the admin collaborator's job)
    pub fn add_incident(&self, incident: Incident) {
        self.incidents.write().push(incident);
    }

    /// Total stored pulses for a monitor
    pub fn pulse_count(&self, monitor_id: &str) -> usize {
        self.pulses.get(monitor_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Stored synthetic pulses for a monitor
    pub fn synthetic_pulses(&self, monitor_id: &str) -> Vec<PulseRecord> {
        self.pulses
            .get(monitor_id)
            .map(|v| v.iter().filter(|p| p.synthetic).cloned().collect())
            .unwrap_or_default()
    }

    /// Stored hourly rows for a monitor, ascending
    pub fn hourly_rows(&self, monitor_id: &str) -> Vec<HourlyRow> {
        self.hourly
            .get(monitor_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stored daily rows for a monitor, ascending
    pub fn daily_rows(&self, monitor_id: &str) -> Vec<DailyRow> {
        self.daily
            .get(monitor_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(MonitorError::StorageUnavailable(
                "backend offline (simulated)".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PulseStorage for MemoryStorage {
    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn insert_pulses(&self, batch: Vec<PulseRecord>) -> Result<()> {
        self.check_available()?;
        for pulse in batch {
            let mut rows = self.pulses.entry(pulse.monitor_id.clone()).or_default();
            rows.push(pulse);
            rows.sort_by_key(|p| p.timestamp_ms);
        }
        Ok(())
    }

    async fn latest_pulse(&self, monitor_id: &str) -> Result<Option<PulseRecord>> {
        self.check_available()?;
        Ok(self
            .pulses
            .get(monitor_id)
            .and_then(|rows| rows.last().cloned()))
    }

    async fn last_real_pulse_in(
        &self,
        monitor_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Option<PulseRecord>> {
        self.check_available()?;
        Ok(self.pulses.get(monitor_id).and_then(|rows| {
            rows.iter()
                .rev()
                .find(|p| !p.synthetic && p.timestamp_ms >= start_ms && p.timestamp_ms < end_ms)
                .cloned()
        }))
    }

    async fn count_interval_buckets(
        &self,
        monitor_id: &str,
        interval_secs: u64,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<u64> {
        self.check_available()?;
        let Some(rows) = self.pulses.get(monitor_id) else {
            return Ok(0);
        };
        let buckets: HashSet<i64> = rows
            .iter()
            .filter(|p| p.timestamp_ms > start_ms && p.timestamp_ms <= end_ms)
            .map(|p| p.bucket(interval_secs))
            .collect();
        Ok(buckets.len() as u64)
    }

    async fn pulses_in(
        &self,
        monitor_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<PulseRecord>> {
        self.check_available()?;
        Ok(self
            .pulses
            .get(monitor_id)
            .map(|rows| {
                rows.iter()
                    .filter(|p| p.timestamp_ms >= start_ms && p.timestamp_ms < end_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn first_pulse_timestamp(&self, monitor_id: &str) -> Result<Option<i64>> {
        self.check_available()?;
        Ok(self
            .pulses
            .get(monitor_id)
            .and_then(|rows| rows.first().map(|p| p.timestamp_ms)))
    }

    async fn last_hourly_bucket(&self, monitor_id: &str) -> Result<Option<i64>> {
        self.check_available()?;
        Ok(self
            .hourly
            .get(monitor_id)
            .and_then(|m| m.keys().next_back().copied()))
    }

    async fn first_hourly_bucket(&self, monitor_id: &str) -> Result<Option<i64>> {
        self.check_available()?;
        Ok(self
            .hourly
            .get(monitor_id)
            .and_then(|m| m.keys().next().copied()))
    }

    async fn write_hourly(&self, rows: Vec<HourlyRow>) -> Result<()> {
        self.check_available()?;
        for row in rows {
            self.hourly
                .entry(row.monitor_id.clone())
                .or_default()
                .insert(row.hour_start_ms, row);
        }
        Ok(())
    }

    async fn hourly_in(
        &self,
        monitor_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<HourlyRow>> {
        self.check_available()?;
        Ok(self
            .hourly
            .get(monitor_id)
            .map(|m| m.range(start_ms..end_ms).map(|(_, row)| row.clone()).collect())
            .unwrap_or_default())
    }

    async fn last_daily_bucket(&self, monitor_id: &str) -> Result<Option<i64>> {
        self.check_available()?;
        Ok(self
            .daily
            .get(monitor_id)
            .and_then(|m| m.keys().next_back().copied()))
    }

    async fn write_daily(&self, rows: Vec<DailyRow>) -> Result<()> {
        self.check_available()?;
        for row in rows {
            self.daily
                .entry(row.monitor_id.clone())
                .or_default()
                .insert(row.day_start_ms, row);
        }
        Ok(())
    }

    async fn daily_in(
        &self,
        monitor_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<DailyRow>> {
        self.check_available()?;
        Ok(self
            .daily
            .get(monitor_id)
            .map(|m| m.range(start_ms..end_ms).map(|(_, row)| row.clone()).collect())
            .unwrap_or_default())
    }

    async fn incidents_in(
        &self,
        entity_ids: &[String],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Incident>> {
        self.check_available()?;
        let wanted: HashSet<&str> = entity_ids.iter().map(|s| s.as_str()).collect();
        Ok(self
            .incidents
            .read()
            .iter()
            .filter(|incident| {
                let ended = incident.resolved_at_ms.unwrap_or(i64::MAX);
                incident.started_at_ms < end_ms
                    && ended >= start_ms
                    && incident.affected.iter().any(|id| wanted.contains(id.as_str()))
            })
            .cloned()
            .collect())
    }
}

/// Floor a timestamp to the start of its UTC hour
pub fn hour_floor_ms(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(3_600_000)
}

/// Floor a timestamp to UTC midnight
pub fn day_floor_ms(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(86_400_000)
}

/// Render an epoch-millisecond timestamp for logs
pub fn format_ms(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt: DateTime<Utc>| dt.to_rfc3339())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(monitor_id: &str, timestamp_ms: i64, latency: Option<f64>) -> PulseRecord {
        PulseRecord {
            monitor_id: monitor_id.to_string(),
            timestamp_ms,
            latency_ms: latency,
            custom1: None,
            custom2: None,
            custom3: None,
            synthetic: false,
        }
    }

    #[tokio::test]
    async fn test_insert_and_latest() {
        let storage = MemoryStorage::new();
        storage
            .insert_pulses(vec![
                pulse("m1", 2_000, Some(10.0)),
                pulse("m1", 1_000, Some(20.0)),
            ])
            .await
            .unwrap();

        let latest = storage.latest_pulse("m1").await.unwrap().unwrap();
        assert_eq!(latest.timestamp_ms, 2_000);
        assert_eq!(storage.first_pulse_timestamp("m1").await.unwrap(), Some(1_000));
    }

    #[tokio::test]
    async fn test_bucket_counting_window_bounds() {
        let storage = MemoryStorage::new();
        // interval 30s: buckets 0, 1, 2
        storage
            .insert_pulses(vec![
                pulse("m1", 0, None),
                pulse("m1", 30_000, None),
                pulse("m1", 31_000, None),
                pulse("m1", 60_000, None),
            ])
            .await
            .unwrap();

        // (0, 60_000]: excludes ts=0, buckets {1, 2}
        let count = storage
            .count_interval_buckets("m1", 30, 0, 60_000)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_outage_simulation() {
        let storage = MemoryStorage::new();
        storage.set_available(false);

        let err = storage.ping().await.unwrap_err();
        assert!(matches!(err, MonitorError::StorageUnavailable(_)));
        assert!(storage
            .insert_pulses(vec![pulse("m1", 1, None)])
            .await
            .is_err());

        storage.set_available(true);
        assert!(storage.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_last_real_pulse_skips_synthetic() {
        let storage = MemoryStorage::new();
        let mut synthetic = pulse("m1", 5_000, None);
        synthetic.synthetic = true;
        storage
            .insert_pulses(vec![pulse("m1", 1_000, None), synthetic])
            .await
            .unwrap();

        let found = storage
            .last_real_pulse_in("m1", 0, 10_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.timestamp_ms, 1_000);
    }

    #[tokio::test]
    async fn test_hourly_upsert_is_idempotent() {
        let storage = MemoryStorage::new();
        let row = HourlyRow {
            monitor_id: "m1".to_string(),
            hour_start_ms: 3_600_000,
            uptime: 99.0,
            latency: MetricSummary::default(),
            custom1: MetricSummary::default(),
            custom2: MetricSummary::default(),
            custom3: MetricSummary::default(),
        };
        storage.write_hourly(vec![row.clone()]).await.unwrap();
        storage.write_hourly(vec![row]).await.unwrap();

        assert_eq!(storage.hourly_rows("m1").len(), 1);
        assert_eq!(
            storage.last_hourly_bucket("m1").await.unwrap(),
            Some(3_600_000)
        );
    }

    #[tokio::test]
    async fn test_incident_window_overlap() {
        let storage = MemoryStorage::new();
        storage.add_incident(Incident {
            id: "inc-1".to_string(),
            title: "API outage".to_string(),
            status: IncidentStatus::Resolved,
            started_at_ms: 1_000,
            resolved_at_ms: Some(5_000),
            affected: vec!["api".to_string()],
            updates: Vec::new(),
        });

        let hits = storage
            .incidents_in(&["api".to_string()], 4_000, 10_000)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = storage
            .incidents_in(&["api".to_string()], 6_000, 10_000)
            .await
            .unwrap();
        assert!(misses.is_empty());

        let wrong_entity = storage
            .incidents_in(&["web".to_string()], 0, 10_000)
            .await
            .unwrap();
        assert!(wrong_entity.is_empty());
    }

    #[test]
    fn test_metric_summary() {
        let summary = MetricSummary::from_values([3.0, 1.0, 2.0].into_iter());
        assert_eq!(summary.min, Some(1.0));
        assert_eq!(summary.max, Some(3.0));
        assert_eq!(summary.avg, Some(2.0));

        let empty = MetricSummary::from_values(std::iter::empty());
        assert_eq!(empty.min, None);
    }

    #[test]
    fn test_floor_helpers() {
        assert_eq!(hour_floor_ms(3_600_001), 3_600_000);
        assert_eq!(hour_floor_ms(3_599_999), 0);
        assert_eq!(day_floor_ms(86_400_000 + 5), 86_400_000);
    }
}
