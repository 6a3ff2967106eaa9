//! # Status Evaluator - Rolling Uptime and Group Composition
//!
//! Transforms stored pulses into live status. For monitors, uptime over each
//! reporting period is derived by counting distinct interval buckets that
//! contain at least one pulse: storage may only record successful pulses, so
//! absence implies down and the expected-interval count is central to
//! correctness. For groups, status is composed from the cached statuses of
//! direct children according to the configured strategy, then cascaded to the
//! parent.
//!
//! ## Evaluation Order
//!
//! Monitors are evaluated deps-first (the configuration cache pre-sorts them
//! by dependency level). After a monitor update the evaluator walks the
//! parent chain, so a parent may be recomputed multiple times per pass when
//! several children changed.
//!
//! ## Skip Policies
//!
//! A group update is skipped (old state preserved) when more than half of its
//! children have no cached status, or when it has no known children at all.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config_cache::{ConfigSnapshot, GroupConfig, GroupStrategy, MonitorConfig};
use crate::logging::{log_debug, LogCategory};
use crate::storage::PulseStorage;
use crate::Result;

/// Live status of a monitor or group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityStatus {
    /// Entity is reporting within tolerance
    Up,
    /// Group is partially up (percentage strategy only)
    Degraded,
    /// Entity stopped reporting or fell below its threshold
    Down,
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityStatus::Up => write!(f, "up"),
            EntityStatus::Degraded => write!(f, "degraded"),
            EntityStatus::Down => write!(f, "down"),
        }
    }
}

/// Whether a status belongs to a monitor or a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    Monitor,
    Group,
}

/// State-transition classes emitted toward the notification dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionKind {
    Down,
    StillDown,
    Degraded,
    Recovered,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionKind::Down => write!(f, "down"),
            TransitionKind::StillDown => write!(f, "still-down"),
            TransitionKind::Degraded => write!(f, "degraded"),
            TransitionKind::Recovered => write!(f, "recovered"),
        }
    }
}

/// Reporting periods for rolling uptime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportingPeriod {
    Hour1,
    Day1,
    Day7,
    Day30,
    Day90,
    Day365,
}

impl ReportingPeriod {
    /// Every period, shortest first
    pub const ALL: [ReportingPeriod; 6] = [
        ReportingPeriod::Hour1,
        ReportingPeriod::Day1,
        ReportingPeriod::Day7,
        ReportingPeriod::Day30,
        ReportingPeriod::Day90,
        ReportingPeriod::Day365,
    ];

    /// Window length in seconds
    pub fn seconds(self) -> i64 {
        match self {
            ReportingPeriod::Hour1 => 3_600,
            ReportingPeriod::Day1 => 86_400,
            ReportingPeriod::Day7 => 7 * 86_400,
            ReportingPeriod::Day30 => 30 * 86_400,
            ReportingPeriod::Day90 => 90 * 86_400,
            ReportingPeriod::Day365 => 365 * 86_400,
        }
    }

    /// Query-string label
    pub fn label(self) -> &'static str {
        match self {
            ReportingPeriod::Hour1 => "1h",
            ReportingPeriod::Day1 => "24h",
            ReportingPeriod::Day7 => "7d",
            ReportingPeriod::Day30 => "30d",
            ReportingPeriod::Day90 => "90d",
            ReportingPeriod::Day365 => "365d",
        }
    }

    /// Parse a query-string label
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "1h" => Some(ReportingPeriod::Hour1),
            "24h" => Some(ReportingPeriod::Day1),
            "7d" => Some(ReportingPeriod::Day7),
            "30d" => Some(ReportingPeriod::Day30),
            "90d" => Some(ReportingPeriod::Day90),
            "365d" => Some(ReportingPeriod::Day365),
            _ => None,
        }
    }
}

/// Child status tally carried on group status data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildCounts {
    pub up: u32,
    pub down: u32,
    pub unknown: u32,
}

impl ChildCounts {
    /// Children with a cached status
    pub fn known(&self) -> u32 {
        self.up + self.down
    }

    /// All children
    pub fn total(&self) -> u32 {
        self.known() + self.unknown
    }
}

/// Latest computed status of one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub entity_id: String,
    pub source_type: SourceType,
    pub status: EntityStatus,
    /// Latest latency sample (monitors only)
    pub latency_ms: Option<f64>,
    /// Timestamp of the latest pulse, or of the group evaluation
    pub last_check_ms: i64,
    /// Rolling uptime percentage per reporting period
    pub uptimes: HashMap<ReportingPeriod, f64>,
    /// Child tally (groups only)
    pub children: Option<ChildCounts>,
}

/// Process-wide map of entity ID to latest computed status
///
/// Writes are serialized per entity by the underlying concurrent map, so
/// readers observe monotonic transitions and never a torn entry.
#[derive(Default)]
pub struct StatusCache {
    entries: DashMap<String, StatusData>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status data for an entity
    pub fn get(&self, entity_id: &str) -> Option<StatusData> {
        self.entries.get(entity_id).map(|e| e.clone())
    }

    /// Latest status for an entity
    pub fn status_of(&self, entity_id: &str) -> Option<EntityStatus> {
        self.entries.get(entity_id).map(|e| e.status)
    }

    /// Insert or replace an entry, returning the previous status
    pub fn insert(&self, data: StatusData) -> Option<EntityStatus> {
        self.entries
            .insert(data.entity_id.clone(), data)
            .map(|prev| prev.status)
    }

    /// Overwrite just the status of an existing entry, returning the previous status
    pub fn set_status(&self, entity_id: &str, status: EntityStatus) -> Option<EntityStatus> {
        self.entries.get_mut(entity_id).map(|mut entry| {
            let prev = entry.status;
            entry.status = status;
            prev
        })
    }

    /// Drop every entry (configuration reload re-initializes runtime state)
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached entities
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been evaluated yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of evaluating one entity
///
/// Carried even when the status did not change: the group-state tracker
/// counts consecutive down evaluations, not only edges.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub entity_id: String,
    pub source_type: SourceType,
    pub name: String,
    pub status: EntityStatus,
    pub previous: Option<EntityStatus>,
    /// Parent group, for notification context
    pub group_id: Option<String>,
    pub timestamp_ms: i64,
}

impl EvalOutcome {
    /// True when this evaluation flipped the entity's status
    pub fn changed(&self) -> bool {
        self.previous != Some(self.status)
    }
}

/// Expected number of pulse intervals inside a period window, after removing
/// the tolerance allowance
pub fn expected_intervals(interval_secs: u64, tolerance_factor: f64, period_secs: i64) -> u64 {
    let tolerance_secs = interval_secs as f64 * tolerance_factor;
    let effective = period_secs as f64 - tolerance_secs;
    if effective <= 0.0 {
        0
    } else {
        (effective / interval_secs as f64).floor() as u64
    }
}

/// The status evaluation service
///
/// Stateless apart from the shared status cache; every call takes the
/// configuration snapshot it should evaluate against.
pub struct StatusEvaluator {
    storage: Arc<dyn PulseStorage>,
    cache: Arc<StatusCache>,
}

impl StatusEvaluator {
    pub fn new(storage: Arc<dyn PulseStorage>, cache: Arc<StatusCache>) -> Self {
        Self { storage, cache }
    }

    /// Shared status cache
    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.cache
    }

    /// Recompute a monitor's status and cascade to its parent chain
    pub async fn evaluate_monitor(
        &self,
        snapshot: &ConfigSnapshot,
        monitor: &MonitorConfig,
        now_ms: i64,
    ) -> Result<Vec<EvalOutcome>> {
        let mut outcomes = Vec::new();

        let Some(latest) = self.storage.latest_pulse(&monitor.id).await? else {
            // No pulse has ever arrived: no status is derived and the
            // missing-pulse detector owns the "never reported" case.
            return Ok(outcomes);
        };

        let mut uptimes = HashMap::with_capacity(ReportingPeriod::ALL.len());
        for period in ReportingPeriod::ALL {
            let uptime = self.monitor_uptime(monitor, period, now_ms).await?;
            uptimes.insert(period, uptime);
        }

        let status = if now_ms - latest.timestamp_ms <= monitor.max_allowed_ms() {
            EntityStatus::Up
        } else {
            EntityStatus::Down
        };

        let previous = self.cache.insert(StatusData {
            entity_id: monitor.id.clone(),
            source_type: SourceType::Monitor,
            status,
            latency_ms: latest.latency_ms,
            last_check_ms: latest.timestamp_ms,
            uptimes,
            children: None,
        });

        outcomes.push(EvalOutcome {
            entity_id: monitor.id.clone(),
            source_type: SourceType::Monitor,
            name: monitor.name.clone(),
            status,
            previous,
            group_id: monitor.group_id.clone(),
            timestamp_ms: now_ms,
        });

        if let Some(group_id) = &monitor.group_id {
            self.cascade_groups(snapshot, group_id, now_ms, &mut outcomes);
        }

        Ok(outcomes)
    }

    /// Rolling uptime of one monitor over one period
    ///
    /// Counts distinct interval buckets holding at least one pulse over the
    /// window `(now - period, now - tolerance]` against the expected interval
    /// count. With zero expected intervals the uptime is 100 by definition.
    async fn monitor_uptime(
        &self,
        monitor: &MonitorConfig,
        period: ReportingPeriod,
        now_ms: i64,
    ) -> Result<f64> {
        let expected = expected_intervals(monitor.interval, monitor.tolerance_factor, period.seconds());
        if expected == 0 {
            return Ok(100.0);
        }

        let tolerance_ms = monitor.max_allowed_ms();
        let window_start = now_ms - period.seconds() * 1000;
        let window_end = now_ms - tolerance_ms;
        let observed = self
            .storage
            .count_interval_buckets(&monitor.id, monitor.interval, window_start, window_end)
            .await?;

        Ok((observed as f64 * 100.0 / expected as f64).min(100.0))
    }

    /// Recompute the group and walk up the parent chain
    ///
    /// Group evaluation only reads the status cache, so it is synchronous.
    pub fn cascade_groups(
        &self,
        snapshot: &ConfigSnapshot,
        group_id: &str,
        now_ms: i64,
        outcomes: &mut Vec<EvalOutcome>,
    ) {
        let mut current = Some(group_id.to_string());
        while let Some(id) = current {
            let Some(group) = snapshot.group_by_id(&id) else {
                break;
            };
            match self.evaluate_group(snapshot, group, now_ms) {
                Some(outcome) => {
                    outcomes.push(outcome);
                    current = group.parent_id.clone();
                }
                // Skip policy fired: the parent would read the same stale
                // state, so the cascade stops here.
                None => break,
            }
        }
    }

    /// Compose a group's status from its direct children
    ///
    /// Returns `None` when a skip policy preserved the previous state.
    pub fn evaluate_group(
        &self,
        snapshot: &ConfigSnapshot,
        group: &GroupConfig,
        now_ms: i64,
    ) -> Option<EvalOutcome> {
        let monitor_children = snapshot.monitors_in_group(&group.id);
        let group_children = snapshot.child_groups(&group.id);
        let total_children = monitor_children.len() + group_children.len();
        if total_children == 0 {
            return None;
        }

        let mut counts = ChildCounts::default();
        for child_id in monitor_children.iter().chain(group_children.iter()) {
            match self.cache.status_of(child_id) {
                // A degraded child still serves, it counts as up for the parent
                Some(EntityStatus::Up) | Some(EntityStatus::Degraded) => counts.up += 1,
                Some(EntityStatus::Down) => counts.down += 1,
                None => counts.unknown += 1,
            }
        }

        if counts.known() == 0 || u64::from(counts.unknown) * 2 > total_children as u64 {
            log_debug(
                LogCategory::Status,
                &format!(
                    "skipping group '{}': {}/{} children unknown",
                    group.id, counts.unknown, total_children
                ),
            );
            return None;
        }

        let up_percentage = f64::from(counts.up) * 100.0 / f64::from(counts.known());
        let status = match group.strategy {
            GroupStrategy::AnyUp => {
                if counts.up > 0 {
                    EntityStatus::Up
                } else {
                    EntityStatus::Down
                }
            }
            GroupStrategy::AllUp => {
                if counts.down == 0 {
                    EntityStatus::Up
                } else {
                    EntityStatus::Down
                }
            }
            GroupStrategy::Percentage => {
                if up_percentage >= 100.0 {
                    EntityStatus::Up
                } else if up_percentage >= group.degraded_threshold {
                    EntityStatus::Degraded
                } else {
                    EntityStatus::Down
                }
            }
        };

        let mut uptimes = HashMap::with_capacity(ReportingPeriod::ALL.len());
        for period in ReportingPeriod::ALL {
            if let Some(uptime) = self.group_uptime(snapshot, group, period) {
                uptimes.insert(period, uptime);
            }
        }

        let previous = self.cache.insert(StatusData {
            entity_id: group.id.clone(),
            source_type: SourceType::Group,
            status,
            latency_ms: None,
            last_check_ms: now_ms,
            uptimes,
            children: Some(counts),
        });

        Some(EvalOutcome {
            entity_id: group.id.clone(),
            source_type: SourceType::Group,
            name: group.name.clone(),
            status,
            previous,
            group_id: group.parent_id.clone(),
            timestamp_ms: now_ms,
        })
    }

    /// Aggregate a group's uptime for one period from its direct children
    ///
    /// Monitor children contribute their cached uptime weighted by their own
    /// expected interval count; group children contribute their cached uptime
    /// unweighted. No recursive storage work happens here.
    fn group_uptime(
        &self,
        snapshot: &ConfigSnapshot,
        group: &GroupConfig,
        period: ReportingPeriod,
    ) -> Option<f64> {
        let mut samples: SmallVec<[(f64, f64); 8]> = SmallVec::new();

        for child_id in snapshot.monitors_in_group(&group.id) {
            let Some(data) = self.cache.get(child_id) else {
                continue;
            };
            let Some(&uptime) = data.uptimes.get(&period) else {
                continue;
            };
            let weight = snapshot
                .monitor_by_id(child_id)
                .map(|m| expected_intervals(m.interval, m.tolerance_factor, period.seconds()).max(1))
                .unwrap_or(1);
            samples.push((uptime, weight as f64));
        }

        for child_id in snapshot.child_groups(&group.id) {
            let Some(data) = self.cache.get(child_id) else {
                continue;
            };
            if let Some(&uptime) = data.uptimes.get(&period) {
                samples.push((uptime, 1.0));
            }
        }

        if samples.is_empty() {
            return None;
        }

        let uptime = match group.strategy {
            GroupStrategy::AnyUp => samples
                .iter()
                .map(|(u, _)| *u)
                .fold(f64::NEG_INFINITY, f64::max),
            GroupStrategy::AllUp => samples.iter().map(|(u, _)| *u).fold(f64::INFINITY, f64::min),
            GroupStrategy::Percentage => {
                let weight_sum: f64 = samples.iter().map(|(_, w)| *w).sum();
                samples.iter().map(|(u, w)| u * w).sum::<f64>() / weight_sum
            }
        };
        Some(uptime)
    }

    /// Evaluate every monitor deps-first, cascading groups along the way
    ///
    /// Used after configuration (re)load. Per-monitor errors are logged and
    /// do not abort the pass.
    pub async fn evaluate_all(&self, snapshot: &ConfigSnapshot, now_ms: i64) -> Vec<EvalOutcome> {
        let mut outcomes = Vec::new();
        for monitor_id in snapshot.monitor_eval_order() {
            let Some(monitor) = snapshot.monitor_by_id(monitor_id) else {
                continue;
            };
            match self.evaluate_monitor(snapshot, monitor, now_ms).await {
                Ok(mut batch) => outcomes.append(&mut batch),
                Err(e) => log_debug(
                    LogCategory::Status,
                    &format!("evaluation of '{monitor_id}' failed: {e}"),
                ),
            }
        }
        outcomes
    }
}
