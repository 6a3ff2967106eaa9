//! # Configuration Cache - Typed Indexes and Hot Reload
//!
//! Consumes a parsed configuration document and exposes typed lookups by ID,
//! by token, by slug, by parent, by child group, and "status pages containing
//! monitor M". Constructs the dependency DAG, assigns each entity a level so
//! evaluation can run deps-first, and rejects cycles at load time.
//!
//! ## Snapshot Semantics
//!
//! The cache holds an immutable [`ConfigSnapshot`] behind an atomic pointer
//! swap. Readers clone the `Arc` and keep a consistent view for the lifetime
//! of their logical operation; a concurrent reload never tears an index.
//!
//! ## Hot Reload Protocol
//!
//! Reload is persist-then-load-with-rollback:
//! 1. Validate the candidate document structurally (`ConfigInvalid` on reject,
//!    reload is a no-op).
//! 2. Write the candidate through to the configuration file.
//! 3. Build the new snapshot and swap it in atomically.
//! 4. On a build failure after the write, restore the previous on-disk
//!    configuration and keep the running snapshot.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::logging::{log_info, log_warn, LogCategory};
use crate::notification::ChannelConfig;
use crate::{MonitorError, Result};

/// Reserved identifier prefix for internal synthetic entities (the self-monitor)
pub const RESERVED_ID_PREFIX: char = '@';

/// Engine tunables carried in the `[settings]` table of the configuration file
///
/// Every field has a production default so a minimal configuration only needs
/// monitors and channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Startup grace window in seconds - transitions mutate state but emit no notifications
    pub grace_period_secs: u64,
    /// Missing-pulse detector scan period in seconds
    pub check_interval_secs: u64,
    /// Pulse write-buffer flush period in seconds
    pub flush_interval_secs: u64,
    /// Recompute-queue drain period in seconds
    pub drain_interval_secs: u64,
    /// Flush immediately once the write buffer holds this many pulses
    pub max_batch: usize,
    /// Write-buffer bound; oldest rows are dropped with a warning beyond it
    pub max_buffer: usize,
    /// Aggregation job period in seconds
    pub aggregation_interval_secs: u64,
    /// Force-abort ceiling for a single aggregation run in seconds
    pub aggregation_abort_secs: u64,
    /// Self-monitor probe period in seconds
    pub self_probe_interval_secs: u64,
    /// Latency policy for synthesized backfill pulses: "last-known" or "null"
    pub backfill_latency_strategy: crate::self_monitor::LatencyStrategy,
    /// Upper bound on synthesized pulses per monitor per backfill
    pub backfill_cap: usize,
    /// Bounded parallelism for the recompute drain
    pub recompute_concurrency: usize,
    /// Per-provider notification send timeout in seconds
    pub provider_timeout_secs: u64,
    /// Confirmation delay before a group down notification with dependencies fires
    pub group_confirm_delay_secs: u64,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            grace_period_secs: 60,
            check_interval_secs: 30,
            flush_interval_secs: 5,
            drain_interval_secs: 5,
            max_batch: 100,
            max_buffer: 10_000,
            aggregation_interval_secs: 600,
            aggregation_abort_secs: 300,
            self_probe_interval_secs: 3,
            backfill_latency_strategy: crate::self_monitor::LatencyStrategy::LastKnown,
            backfill_cap: 10_000,
            recompute_concurrency: 8,
            provider_timeout_secs: 10,
            group_confirm_delay_secs: 5,
        }
    }
}

/// Descriptor for one of the up-to-three user-defined metric slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomMetric {
    /// Stable metric identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Unit suffix for rendering ("ms", "%", "MB", ...)
    #[serde(default)]
    pub unit: String,
}

/// A configured monitor receiving pulses at a declared interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Stable entity identifier
    pub id: String,
    /// Secret push token; the token-to-monitor mapping is a unique bijection
    pub token: String,
    /// Display name
    pub name: String,
    /// Nominal pulse interval in seconds
    pub interval: u64,
    /// Consecutive misses before the monitor is considered down
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Multiplier applied to the interval when deciding "late"
    #[serde(default = "default_tolerance_factor")]
    pub tolerance_factor: f64,
    /// Consecutive-down checks between re-alerts; 0 never resends
    #[serde(default)]
    pub resend_notification: u32,
    /// Optional parent group
    #[serde(default)]
    pub group_id: Option<String>,
    /// Notification channel IDs alerted on transitions
    #[serde(default)]
    pub notification_channels: Vec<String>,
    /// Up to three user-defined metric descriptors
    #[serde(default)]
    pub custom_metrics: Vec<CustomMetric>,
    /// Entity IDs whose down-state suppresses this monitor's alerts
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_tolerance_factor() -> f64 {
    1.5
}

impl MonitorConfig {
    /// Milliseconds a pulse may be late before the monitor counts as down
    pub fn max_allowed_ms(&self) -> i64 {
        (self.interval as f64 * self.tolerance_factor * 1000.0) as i64
    }

    /// Whether the metric slot (1-based) is declared for this monitor
    pub fn declares_custom_slot(&self, slot: usize) -> bool {
        slot >= 1 && slot <= self.custom_metrics.len()
    }
}

/// Rule mapping child statuses to a group status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupStrategy {
    /// Up if any child is up
    AnyUp,
    /// Up only if all known children are up
    AllUp,
    /// Up at 100%, degraded above the threshold, down below it
    Percentage,
}

impl std::fmt::Display for GroupStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupStrategy::AnyUp => write!(f, "any-up"),
            GroupStrategy::AllUp => write!(f, "all-up"),
            GroupStrategy::Percentage => write!(f, "percentage"),
        }
    }
}

/// A composite entity whose status is a function of its children
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Stable entity identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Composition strategy
    #[serde(default = "default_strategy")]
    pub strategy: GroupStrategy,
    /// Percent of children that must be up to be merely degraded (percentage strategy only)
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: f64,
    /// Interval in seconds used for uptime windowing and downtime derivation
    #[serde(default = "default_group_interval")]
    pub interval: u64,
    /// Consecutive-down checks between re-alerts; 0 never resends
    #[serde(default)]
    pub resend_notification: u32,
    /// Optional parent group
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Notification channel IDs alerted on transitions
    #[serde(default)]
    pub notification_channels: Vec<String>,
    /// Entity IDs whose down-state suppresses this group's alerts
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_strategy() -> GroupStrategy {
    GroupStrategy::AnyUp
}

fn default_degraded_threshold() -> f64 {
    50.0
}

fn default_group_interval() -> u64 {
    60
}

/// Ordered selection of monitors and groups published under a slug
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPageConfig {
    /// URL slug; the slug-to-page mapping is a unique bijection
    pub slug: String,
    /// Display name
    pub name: String,
    /// Ordered monitor and group IDs shown on the page
    #[serde(default)]
    pub items: Vec<String>,
    /// Optional viewer password checked at subscribe time
    #[serde(default)]
    pub password: Option<String>,
}

/// The complete parsed configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDocument {
    /// Engine tunables
    #[serde(default)]
    pub settings: CoreSettings,
    /// Configured monitors
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
    /// Configured groups
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// Configured status pages
    #[serde(default)]
    pub status_pages: Vec<StatusPageConfig>,
    /// Configured notification channels
    #[serde(default)]
    pub notification_channels: Vec<ChannelConfig>,
}

/// Immutable, fully indexed view of one configuration document
///
/// Relationships (group to monitors, parent to groups, page to monitors) are
/// pre-built reverse indexes, rebuilt on every reload. Never relies on
/// insertion order.
#[derive(Debug)]
pub struct ConfigSnapshot {
    /// The source document
    pub document: ConfigDocument,
    monitors_by_id: HashMap<String, Arc<MonitorConfig>>,
    monitors_by_token: HashMap<String, Arc<MonitorConfig>>,
    groups_by_id: HashMap<String, Arc<GroupConfig>>,
    pages_by_slug: HashMap<String, Arc<StatusPageConfig>>,
    channels_by_id: HashMap<String, Arc<ChannelConfig>>,
    monitors_in_group: HashMap<String, Vec<String>>,
    groups_in_group: HashMap<String, Vec<String>>,
    pages_containing_monitor: HashMap<String, Vec<String>>,
    dependency_levels: HashMap<String, u32>,
    monitor_eval_order: Vec<String>,
}

impl ConfigSnapshot {
    /// Build a snapshot from a document, validating it in the process
    pub fn build(document: ConfigDocument) -> Result<Self> {
        validate_document(&document)?;

        let mut monitors_by_id = HashMap::new();
        let mut monitors_by_token = HashMap::new();
        for monitor in &document.monitors {
            let monitor = Arc::new(monitor.clone());
            monitors_by_id.insert(monitor.id.clone(), Arc::clone(&monitor));
            monitors_by_token.insert(monitor.token.clone(), monitor);
        }

        let mut groups_by_id = HashMap::new();
        for group in &document.groups {
            groups_by_id.insert(group.id.clone(), Arc::new(group.clone()));
        }

        let mut pages_by_slug = HashMap::new();
        for page in &document.status_pages {
            pages_by_slug.insert(page.slug.clone(), Arc::new(page.clone()));
        }

        let mut channels_by_id = HashMap::new();
        for channel in &document.notification_channels {
            channels_by_id.insert(channel.id.clone(), Arc::new(channel.clone()));
        }

        let mut monitors_in_group: HashMap<String, Vec<String>> = HashMap::new();
        for monitor in &document.monitors {
            if let Some(group_id) = &monitor.group_id {
                monitors_in_group
                    .entry(group_id.clone())
                    .or_default()
                    .push(monitor.id.clone());
            }
        }

        let mut groups_in_group: HashMap<String, Vec<String>> = HashMap::new();
        for group in &document.groups {
            if let Some(parent_id) = &group.parent_id {
                groups_in_group
                    .entry(parent_id.clone())
                    .or_default()
                    .push(group.id.clone());
            }
        }

        let dependency_levels = compute_dependency_levels(&document)?;

        let mut monitor_eval_order: Vec<String> =
            document.monitors.iter().map(|m| m.id.clone()).collect();
        monitor_eval_order.sort_by_key(|id| {
            (
                dependency_levels.get(id).copied().unwrap_or(0),
                id.clone(),
            )
        });

        let mut snapshot = Self {
            document,
            monitors_by_id,
            monitors_by_token,
            groups_by_id,
            pages_by_slug,
            channels_by_id,
            monitors_in_group,
            groups_in_group,
            pages_containing_monitor: HashMap::new(),
            dependency_levels,
            monitor_eval_order,
        };
        snapshot.pages_containing_monitor = snapshot.build_page_reverse_index();
        Ok(snapshot)
    }

    /// Reverse index: monitor ID to the slugs of every page showing it,
    /// expanding group items transitively
    fn build_page_reverse_index(&self) -> HashMap<String, Vec<String>> {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for page in &self.document.status_pages {
            let mut monitors: HashSet<String> = HashSet::new();
            for item in &page.items {
                if self.monitors_by_id.contains_key(item) {
                    monitors.insert(item.clone());
                } else if self.groups_by_id.contains_key(item) {
                    self.collect_group_monitors(item, &mut monitors);
                }
            }
            for monitor_id in monitors {
                index.entry(monitor_id).or_default().push(page.slug.clone());
            }
        }
        for slugs in index.values_mut() {
            slugs.sort();
        }
        index
    }

    /// Gather every monitor transitively under a group
    fn collect_group_monitors(&self, group_id: &str, out: &mut HashSet<String>) {
        if let Some(monitors) = self.monitors_in_group.get(group_id) {
            out.extend(monitors.iter().cloned());
        }
        if let Some(children) = self.groups_in_group.get(group_id) {
            for child in children {
                self.collect_group_monitors(child, out);
            }
        }
    }

    /// Lookup a monitor by ID
    pub fn monitor_by_id(&self, id: &str) -> Option<&Arc<MonitorConfig>> {
        self.monitors_by_id.get(id)
    }

    /// Lookup a monitor by push token
    pub fn monitor_by_token(&self, token: &str) -> Option<&Arc<MonitorConfig>> {
        self.monitors_by_token.get(token)
    }

    /// Lookup a group by ID
    pub fn group_by_id(&self, id: &str) -> Option<&Arc<GroupConfig>> {
        self.groups_by_id.get(id)
    }

    /// Lookup a status page by slug
    pub fn page_by_slug(&self, slug: &str) -> Option<&Arc<StatusPageConfig>> {
        self.pages_by_slug.get(slug)
    }

    /// Lookup a notification channel by ID
    pub fn channel_by_id(&self, id: &str) -> Option<&Arc<ChannelConfig>> {
        self.channels_by_id.get(id)
    }

    /// Direct monitor children of a group
    pub fn monitors_in_group(&self, group_id: &str) -> &[String] {
        self.monitors_in_group
            .get(group_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Direct sub-groups of a group
    pub fn child_groups(&self, group_id: &str) -> &[String] {
        self.groups_in_group
            .get(group_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Slugs of every status page showing the monitor (directly or via a group)
    pub fn pages_containing_monitor(&self, monitor_id: &str) -> &[String] {
        self.pages_containing_monitor
            .get(monitor_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Dependency level of an entity: 0 with no deps, 1 + max(dep levels) otherwise
    pub fn dependency_level(&self, entity_id: &str) -> u32 {
        self.dependency_levels.get(entity_id).copied().unwrap_or(0)
    }

    /// Monitor IDs pre-sorted by dependency level ascending (deps-first)
    pub fn monitor_eval_order(&self) -> &[String] {
        &self.monitor_eval_order
    }

    /// Dependencies of an entity (monitor or group)
    pub fn dependencies_of(&self, entity_id: &str) -> &[String] {
        if let Some(monitor) = self.monitors_by_id.get(entity_id) {
            &monitor.dependencies
        } else if let Some(group) = self.groups_by_id.get(entity_id) {
            &group.dependencies
        } else {
            &[]
        }
    }

    /// Display name of an entity (monitor or group)
    pub fn entity_name(&self, entity_id: &str) -> Option<&str> {
        if let Some(monitor) = self.monitors_by_id.get(entity_id) {
            Some(&monitor.name)
        } else {
            self.groups_by_id.get(entity_id).map(|g| g.name.as_str())
        }
    }

    /// All monitors
    pub fn monitors(&self) -> &[MonitorConfig] {
        &self.document.monitors
    }

    /// All groups
    pub fn groups(&self) -> &[GroupConfig] {
        &self.document.groups
    }

    /// All status pages
    pub fn status_pages(&self) -> &[StatusPageConfig] {
        &self.document.status_pages
    }
}

/// Structural validation of a candidate document
///
/// Checks uniqueness (IDs, tokens, slugs), referential integrity (groups,
/// parents, channels, dependencies, page items), per-entity bounds, and
/// channel sub-provider configuration.
pub fn validate_document(document: &ConfigDocument) -> Result<()> {
    let mut entity_ids = HashSet::new();
    let mut tokens = HashSet::new();

    for monitor in &document.monitors {
        if monitor.id.is_empty() || monitor.id.starts_with(RESERVED_ID_PREFIX) {
            return Err(MonitorError::ConfigInvalid(format!(
                "monitor id '{}' is empty or reserved",
                monitor.id
            )));
        }
        if !entity_ids.insert(monitor.id.clone()) {
            return Err(MonitorError::Conflict(format!(
                "duplicate entity id '{}'",
                monitor.id
            )));
        }
        if monitor.token.is_empty() || !tokens.insert(monitor.token.clone()) {
            return Err(MonitorError::Conflict(format!(
                "missing or duplicate token for monitor '{}'",
                monitor.id
            )));
        }
        if monitor.interval == 0 {
            return Err(MonitorError::ConfigInvalid(format!(
                "monitor '{}' must declare a positive interval",
                monitor.id
            )));
        }
        if monitor.tolerance_factor <= 0.0 || !monitor.tolerance_factor.is_finite() {
            return Err(MonitorError::ConfigInvalid(format!(
                "monitor '{}' has an invalid tolerance factor",
                monitor.id
            )));
        }
        if monitor.max_retries == 0 {
            return Err(MonitorError::ConfigInvalid(format!(
                "monitor '{}' must allow at least one retry",
                monitor.id
            )));
        }
        if monitor.custom_metrics.len() > 3 {
            return Err(MonitorError::ConfigInvalid(format!(
                "monitor '{}' declares more than three custom metrics",
                monitor.id
            )));
        }
    }

    for group in &document.groups {
        if group.id.is_empty() || group.id.starts_with(RESERVED_ID_PREFIX) {
            return Err(MonitorError::ConfigInvalid(format!(
                "group id '{}' is empty or reserved",
                group.id
            )));
        }
        if !entity_ids.insert(group.id.clone()) {
            return Err(MonitorError::Conflict(format!(
                "duplicate entity id '{}'",
                group.id
            )));
        }
        if group.interval == 0 {
            return Err(MonitorError::ConfigInvalid(format!(
                "group '{}' must declare a positive interval",
                group.id
            )));
        }
        if !(0.0..=100.0).contains(&group.degraded_threshold) {
            return Err(MonitorError::ConfigInvalid(format!(
                "group '{}' degraded threshold must lie in 0..=100",
                group.id
            )));
        }
    }

    let group_ids: HashSet<&str> = document.groups.iter().map(|g| g.id.as_str()).collect();
    let channel_ids: HashSet<&str> = document
        .notification_channels
        .iter()
        .map(|c| c.id.as_str())
        .collect();

    let mut seen_channels = HashSet::new();
    for channel in &document.notification_channels {
        if !seen_channels.insert(channel.id.as_str()) {
            return Err(MonitorError::Conflict(format!(
                "duplicate notification channel id '{}'",
                channel.id
            )));
        }
        channel.validate()?;
    }

    for monitor in &document.monitors {
        if let Some(group_id) = &monitor.group_id {
            if !group_ids.contains(group_id.as_str()) {
                return Err(MonitorError::ConfigInvalid(format!(
                    "monitor '{}' references unknown group '{group_id}'",
                    monitor.id
                )));
            }
        }
        for channel in &monitor.notification_channels {
            if !channel_ids.contains(channel.as_str()) {
                return Err(MonitorError::ConfigInvalid(format!(
                    "monitor '{}' references unknown channel '{channel}'",
                    monitor.id
                )));
            }
        }
        for dep in &monitor.dependencies {
            if !entity_ids.contains(dep) {
                return Err(MonitorError::ConfigInvalid(format!(
                    "monitor '{}' depends on unknown entity '{dep}'",
                    monitor.id
                )));
            }
        }
    }

    for group in &document.groups {
        if let Some(parent_id) = &group.parent_id {
            if !group_ids.contains(parent_id.as_str()) {
                return Err(MonitorError::ConfigInvalid(format!(
                    "group '{}' references unknown parent '{parent_id}'",
                    group.id
                )));
            }
        }
        for channel in &group.notification_channels {
            if !channel_ids.contains(channel.as_str()) {
                return Err(MonitorError::ConfigInvalid(format!(
                    "group '{}' references unknown channel '{channel}'",
                    group.id
                )));
            }
        }
        for dep in &group.dependencies {
            if !entity_ids.contains(dep) {
                return Err(MonitorError::ConfigInvalid(format!(
                    "group '{}' depends on unknown entity '{dep}'",
                    group.id
                )));
            }
        }
    }

    // Parent chains must terminate
    for group in &document.groups {
        let mut seen = HashSet::new();
        let mut current = group.parent_id.as_deref();
        seen.insert(group.id.as_str());
        while let Some(parent) = current {
            if !seen.insert(parent) {
                return Err(MonitorError::ConfigInvalid(format!(
                    "group parent cycle involving '{}'",
                    group.id
                )));
            }
            current = document
                .groups
                .iter()
                .find(|g| g.id == parent)
                .and_then(|g| g.parent_id.as_deref());
        }
    }

    let mut slugs = HashSet::new();
    for page in &document.status_pages {
        if page.slug.is_empty() || !slugs.insert(page.slug.clone()) {
            return Err(MonitorError::Conflict(format!(
                "missing or duplicate status page slug '{}'",
                page.slug
            )));
        }
        for item in &page.items {
            if !entity_ids.contains(item) {
                return Err(MonitorError::ConfigInvalid(format!(
                    "status page '{}' lists unknown entity '{item}'",
                    page.slug
                )));
            }
        }
    }

    Ok(())
}

/// Assign each entity its dependency level; rejects cycles
fn compute_dependency_levels(document: &ConfigDocument) -> Result<HashMap<String, u32>> {
    let mut deps: HashMap<&str, &[String]> = HashMap::new();
    for monitor in &document.monitors {
        deps.insert(monitor.id.as_str(), monitor.dependencies.as_slice());
    }
    for group in &document.groups {
        deps.insert(group.id.as_str(), group.dependencies.as_slice());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum VisitState {
        InProgress,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        states: &mut HashMap<&'a str, VisitState>,
        levels: &mut HashMap<String, u32>,
    ) -> Result<u32> {
        match states.get(id) {
            Some(VisitState::Done) => return Ok(levels[id]),
            Some(VisitState::InProgress) => {
                return Err(MonitorError::ConfigInvalid(format!(
                    "dependency cycle involving '{id}'"
                )));
            }
            None => {}
        }
        states.insert(id, VisitState::InProgress);

        let own_deps = deps.get(id).copied().unwrap_or(&[]);
        let mut level = 0;
        for dep in own_deps {
            let dep_level = visit(dep.as_str(), deps, states, levels)?;
            level = level.max(dep_level + 1);
        }

        states.insert(id, VisitState::Done);
        levels.insert(id.to_string(), level);
        Ok(level)
    }

    let mut states = HashMap::new();
    let mut levels = HashMap::new();
    let ids: Vec<&str> = deps.keys().copied().collect();
    for id in ids {
        visit(id, &deps, &mut states, &mut levels)?;
    }
    Ok(levels)
}

/// Process-wide configuration cache holding the current snapshot
///
/// A singleton service: constructed once at startup, its snapshot pointer is
/// swapped atomically on every successful reload.
pub struct ConfigCache {
    /// Backing file, if the cache was loaded from disk
    path: Option<PathBuf>,
    /// Current snapshot; readers clone the Arc
    snapshot: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigCache {
    /// Build a cache directly from a document (no backing file)
    pub fn from_document(document: ConfigDocument) -> Result<Self> {
        let snapshot = ConfigSnapshot::build(document)?;
        Ok(Self {
            path: None,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Load the configuration file at `path` and build the cache
    ///
    /// Uses the layered `config` loader so `PULSE_SENTINEL__*` environment
    /// variables can override file values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let document = read_document(&path)?;
        let snapshot = ConfigSnapshot::build(document)?;
        log_info(
            LogCategory::Config,
            &format!("configuration loaded from {}", path.display()),
        );
        Ok(Self {
            path: Some(path),
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Apply a candidate document: validate, persist, rebuild, swap
    ///
    /// Returns the new snapshot on success. On validation failure the call is
    /// a no-op; on a persist-then-build failure the previous file content is
    /// restored and the running snapshot kept.
    pub fn apply(&self, candidate: ConfigDocument) -> Result<Arc<ConfigSnapshot>> {
        validate_document(&candidate)?;

        let previous_document = self.snapshot().document.clone();

        if let Some(path) = &self.path {
            write_document(path, &candidate)?;
        }

        match ConfigSnapshot::build(candidate) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.snapshot.write() = Arc::clone(&snapshot);
                log_info(LogCategory::Config, "configuration reloaded");
                Ok(snapshot)
            }
            Err(e) => {
                if let Some(path) = &self.path {
                    if let Err(restore_err) = write_document(path, &previous_document) {
                        log_warn(
                            LogCategory::Config,
                            &format!("failed to restore previous configuration: {restore_err}"),
                        );
                    }
                }
                log_warn(
                    LogCategory::Config,
                    &format!("configuration reload rejected: {e}"),
                );
                Err(e)
            }
        }
    }

    /// Re-read the backing file and apply it
    pub fn reload_from_disk(&self) -> Result<Arc<ConfigSnapshot>> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| MonitorError::ConfigInvalid("cache has no backing file".into()))?;
        let document = read_document(path)?;
        self.apply(document)
    }
}

/// Resolve the configuration path: `$CONFIG`, defaulting to `./config.toml`
///
/// Honors a `.env` file in the working directory.
pub fn config_path_from_env() -> PathBuf {
    dotenvy::dotenv().ok();
    std::env::var("CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./config.toml"))
}

/// Parse a TOML configuration file with environment overrides
fn read_document(path: &Path) -> Result<ConfigDocument> {
    let loader = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("PULSE_SENTINEL").separator("__"))
        .build()
        .map_err(|e| MonitorError::ConfigInvalid(format!("cannot read configuration: {e}")))?;
    loader
        .try_deserialize()
        .map_err(|e| MonitorError::ConfigInvalid(format!("cannot parse configuration: {e}")))
}

/// Serialize a document back to its TOML file
fn write_document(path: &Path, document: &ConfigDocument) -> Result<()> {
    let rendered = toml::to_string_pretty(document)
        .map_err(|e| MonitorError::Internal(format!("cannot serialize configuration: {e}")))?;
    std::fs::write(path, rendered)
        .map_err(|e| MonitorError::Internal(format!("cannot write configuration: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(id: &str, token: &str) -> MonitorConfig {
        MonitorConfig {
            id: id.to_string(),
            token: token.to_string(),
            name: id.to_uppercase(),
            interval: 30,
            max_retries: 3,
            tolerance_factor: 1.5,
            resend_notification: 0,
            group_id: None,
            notification_channels: Vec::new(),
            custom_metrics: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    fn group(id: &str) -> GroupConfig {
        GroupConfig {
            id: id.to_string(),
            name: id.to_uppercase(),
            strategy: GroupStrategy::AnyUp,
            degraded_threshold: 50.0,
            interval: 60,
            resend_notification: 0,
            parent_id: None,
            notification_channels: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    fn document() -> ConfigDocument {
        let mut db = monitor("db", "tok-db");
        db.group_id = Some("backend".to_string());
        let mut api = monitor("api", "tok-api");
        api.group_id = Some("backend".to_string());
        api.dependencies = vec!["db".to_string()];
        let web = monitor("web", "tok-web");

        ConfigDocument {
            settings: CoreSettings::default(),
            monitors: vec![db, api, web],
            groups: vec![group("backend")],
            status_pages: vec![StatusPageConfig {
                slug: "public".to_string(),
                name: "Public".to_string(),
                items: vec!["backend".to_string(), "web".to_string()],
                password: None,
            }],
            notification_channels: Vec::new(),
        }
    }

    #[test]
    fn test_snapshot_indexes() {
        let snapshot = ConfigSnapshot::build(document()).unwrap();

        assert_eq!(snapshot.monitor_by_token("tok-db").unwrap().id, "db");
        assert!(snapshot.monitor_by_token("missing").is_none());
        assert_eq!(snapshot.monitors_in_group("backend"), ["db", "api"]);
        assert_eq!(snapshot.page_by_slug("public").unwrap().name, "Public");
    }

    #[test]
    fn test_page_reverse_index_expands_groups() {
        let snapshot = ConfigSnapshot::build(document()).unwrap();

        assert_eq!(snapshot.pages_containing_monitor("db"), ["public"]);
        assert_eq!(snapshot.pages_containing_monitor("api"), ["public"]);
        assert_eq!(snapshot.pages_containing_monitor("web"), ["public"]);
    }

    #[test]
    fn test_dependency_levels_and_eval_order() {
        let snapshot = ConfigSnapshot::build(document()).unwrap();

        assert_eq!(snapshot.dependency_level("db"), 0);
        assert_eq!(snapshot.dependency_level("api"), 1);

        let order = snapshot.monitor_eval_order();
        let db_pos = order.iter().position(|id| id == "db").unwrap();
        let api_pos = order.iter().position(|id| id == "api").unwrap();
        assert!(db_pos < api_pos, "dependencies evaluate first");
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let mut doc = document();
        doc.monitors[0].dependencies = vec!["api".to_string()];
        let err = ConfigSnapshot::build(doc).unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let mut doc = document();
        doc.monitors[1].token = "tok-db".to_string();
        let err = ConfigSnapshot::build(doc).unwrap_err();
        assert!(matches!(err, MonitorError::Conflict(_)));
    }

    #[test]
    fn test_unknown_group_reference_rejected() {
        let mut doc = document();
        doc.monitors[2].group_id = Some("nope".to_string());
        let err = ConfigSnapshot::build(doc).unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
    }

    #[test]
    fn test_reserved_id_rejected() {
        let mut doc = document();
        doc.monitors[0].id = "@self".to_string();
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
    }

    #[test]
    fn test_group_parent_cycle_rejected() {
        let mut doc = document();
        let mut a = group("a");
        a.parent_id = Some("b".to_string());
        let mut b = group("b");
        b.parent_id = Some("a".to_string());
        doc.groups.push(a);
        doc.groups.push(b);
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, MonitorError::ConfigInvalid(_)));
    }

    #[test]
    fn test_apply_invalid_candidate_is_noop() {
        let cache = ConfigCache::from_document(document()).unwrap();
        let before = cache.snapshot();

        let mut bad = document();
        bad.monitors[0].interval = 0;
        assert!(cache.apply(bad).is_err());

        let after = cache.snapshot();
        assert!(Arc::ptr_eq(&before, &after), "snapshot must be untouched");
    }

    #[test]
    fn test_apply_swaps_snapshot() {
        let cache = ConfigCache::from_document(document()).unwrap();

        let mut next = document();
        next.monitors.push(monitor("worker", "tok-worker"));
        cache.apply(next).unwrap();

        assert!(cache.snapshot().monitor_by_id("worker").is_some());
    }

    #[test]
    fn test_document_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&document()).unwrap();
        let parsed: ConfigDocument = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.monitors.len(), 3);
        assert_eq!(parsed.groups[0].strategy, GroupStrategy::AnyUp);
    }
}
