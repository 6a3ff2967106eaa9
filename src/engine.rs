//! # Monitoring Engine - Orchestration and Public Operations
//!
//! The process-wide orchestrator. It owns every service singleton
//! (configuration cache, pulse store, status evaluator, missing-pulse
//! detector, group-state tracker, notification dispatcher, aggregation job,
//! self-monitor, realtime broadcaster), wires them into one transition
//! pipeline, and exposes the operations the transport and admin collaborators
//! call.
//!
//! ## Lifecycle
//!
//! Services are initialized at construction; [`MonitoringEngine::start`]
//! performs the initial full evaluation and spawns the background loops
//! (pulse flush, recompute drain, missing-pulse scan, aggregation, storage
//! probe), each carrying the engine's cancellation token.
//! [`MonitoringEngine::stop`] cancels the token, awaits the loops and runs a
//! final flush.
//!
//! ## Transition Pipeline
//!
//! Every status evaluation and detector finding flows through one pipeline:
//! the status cache is updated first, then the down counters, and only then
//! is a notification considered, so concurrent readers always observe a
//! consistent snapshot. Notification emission applies, in order: the startup
//! grace window, dependency suppression (checked against the live status
//! cache at emit time), and per-channel fan-out. Delivery confirmation
//! advances the last-notified counters.

use chrono::{TimeZone, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregation::{AggregationConfig, AggregationJob};
use crate::broadcaster::RealtimeBroadcaster;
use crate::config_cache::{
    ConfigCache, ConfigDocument, ConfigSnapshot, CoreSettings, GroupConfig,
};
use crate::group_state::GroupStateTracker;
use crate::logging::{log_info, log_warn, LogCategory};
use crate::missing_pulse::{DetectorEvent, MissingPulseDetector};
use crate::notification::{NotificationDispatcher, NotificationEvent};
use crate::pulse_store::{prepare_pulse, PulseRequest, PulseStore, PulseStoreConfig};
use crate::self_monitor::{SelfMonitor, SelfMonitorConfig};
use crate::status_evaluator::{
    EntityStatus, EvalOutcome, ReportingPeriod, SourceType, StatusCache, StatusData,
    StatusEvaluator, TransitionKind,
};
use crate::storage::{Incident, MemoryStorage, MetricSummary, PulseStorage};
use crate::{MonitorError, Result, ARCHITECTURE_VERSION};

/// Acknowledgement returned for an accepted pulse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseAck {
    pub monitor_id: String,
}

/// Aggregated entity counts for one status page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSummary {
    pub up: u32,
    pub degraded: u32,
    pub down: u32,
    pub total: u32,
}

/// One point of a history series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySample {
    pub timestamp_ms: i64,
    /// Present for aggregated buckets, absent for raw pulses
    pub uptime: Option<f64>,
    pub latency: MetricSummary,
    pub custom1: MetricSummary,
    pub custom2: MetricSummary,
    pub custom3: MetricSummary,
}

/// Engine tunables derived from the `[settings]` configuration table
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub grace_period: Duration,
    pub check_interval: Duration,
    pub drain_interval: Duration,
    pub recompute_concurrency: usize,
    pub group_confirm_delay: Duration,
    pub provider_timeout: Duration,
    pub pulse_store: PulseStoreConfig,
    pub aggregation: AggregationConfig,
    pub self_monitor: SelfMonitorConfig,
}

impl EngineConfig {
    /// Map the configuration document's settings onto service tunables
    pub fn from_settings(settings: &CoreSettings) -> Self {
        Self {
            grace_period: Duration::from_secs(settings.grace_period_secs),
            check_interval: Duration::from_secs(settings.check_interval_secs),
            drain_interval: Duration::from_secs(settings.drain_interval_secs),
            recompute_concurrency: settings.recompute_concurrency.max(1),
            group_confirm_delay: Duration::from_secs(settings.group_confirm_delay_secs),
            provider_timeout: Duration::from_secs(settings.provider_timeout_secs),
            pulse_store: PulseStoreConfig {
                max_batch: settings.max_batch,
                max_buffer: settings.max_buffer,
                flush_interval: Duration::from_secs(settings.flush_interval_secs),
            },
            aggregation: AggregationConfig {
                run_interval: Duration::from_secs(settings.aggregation_interval_secs),
                stale_abort: Duration::from_secs(settings.aggregation_abort_secs),
                ..AggregationConfig::default()
            },
            self_monitor: SelfMonitorConfig {
                probe_interval: Duration::from_secs(settings.self_probe_interval_secs.max(1)),
                latency_strategy: settings.backfill_latency_strategy,
                backfill_cap: settings.backfill_cap,
            },
        }
    }
}

/// The monitoring core
pub struct MonitoringEngine {
    config: EngineConfig,
    config_cache: Arc<ConfigCache>,
    storage: Arc<dyn PulseStorage>,
    pulse_store: Arc<PulseStore>,
    status_cache: Arc<StatusCache>,
    evaluator: Arc<StatusEvaluator>,
    detector: Arc<MissingPulseDetector>,
    group_tracker: Arc<GroupStateTracker>,
    dispatcher: Arc<NotificationDispatcher>,
    aggregation: Arc<AggregationJob>,
    self_monitor: Arc<SelfMonitor>,
    broadcaster: Arc<RealtimeBroadcaster>,
    /// Internal stream of delivered notifications, observable by the admin surface
    notify_tx: broadcast::Sender<NotificationEvent>,
    started_at_ms: AtomicI64,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MonitoringEngine {
    /// Build an engine over an explicit storage backend
    pub fn with_storage(config_cache: ConfigCache, storage: Arc<dyn PulseStorage>) -> Arc<Self> {
        let settings = config_cache.snapshot().document.settings.clone();
        let config = EngineConfig::from_settings(&settings);

        let status_cache = Arc::new(StatusCache::new());
        let pulse_store = Arc::new(PulseStore::new(
            Arc::clone(&storage),
            config.pulse_store.clone(),
        ));
        let evaluator = Arc::new(StatusEvaluator::new(
            Arc::clone(&storage),
            Arc::clone(&status_cache),
        ));
        let aggregation = Arc::new(AggregationJob::new(
            Arc::clone(&storage),
            config.aggregation.clone(),
        ));
        let self_monitor = Arc::new(SelfMonitor::new(
            Arc::clone(&storage),
            config.self_monitor.clone(),
        ));
        let (notify_tx, _) = broadcast::channel(256);

        Arc::new(Self {
            dispatcher: Arc::new(NotificationDispatcher::new(config.provider_timeout)),
            config,
            config_cache: Arc::new(config_cache),
            storage,
            pulse_store,
            status_cache,
            evaluator,
            detector: Arc::new(MissingPulseDetector::new()),
            group_tracker: Arc::new(GroupStateTracker::new()),
            aggregation,
            self_monitor,
            broadcaster: Arc::new(RealtimeBroadcaster::new()),
            notify_tx,
            started_at_ms: AtomicI64::new(0),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Load the configuration file and build an engine over the in-process backend
    pub fn from_config_path(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let config_cache = ConfigCache::load(path)?;
        Ok(Self::with_storage(
            config_cache,
            Arc::new(MemoryStorage::new()),
        ))
    }

    /// Current configuration snapshot
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.config_cache.snapshot()
    }

    /// Shared status cache
    pub fn status_cache(&self) -> &Arc<StatusCache> {
        &self.status_cache
    }

    /// Subscribe to the internal stream of delivered notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.notify_tx.subscribe()
    }

    /// Bring every service up
    ///
    /// Performs the initial full evaluation (inside the grace window, so no
    /// notifications fire) and spawns the background loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.started_at_ms.store(now_ms, Ordering::SeqCst);
        self.detector.mark_started(now_ms);
        log_info(
            LogCategory::System,
            &format!("starting monitoring engine {ARCHITECTURE_VERSION}"),
        );

        let snapshot = self.snapshot();
        let outcomes = self.evaluator.evaluate_all(&snapshot, now_ms).await;
        self.process_outcomes(&snapshot, outcomes).await;

        let cancel = CancellationToken::new();
        let mut tasks = vec![
            self.pulse_store.spawn_flush_loop(cancel.child_token()),
            self.spawn_drain_loop(cancel.child_token()),
            self.spawn_detector_loop(cancel.child_token()),
            self.spawn_aggregation_loop(cancel.child_token()),
            self.spawn_probe_loop(cancel.child_token()),
        ];
        self.tasks.lock().append(&mut tasks);
        *self.cancel.lock() = Some(cancel);

        log_info(LogCategory::System, "monitoring engine started");
        Ok(())
    }

    /// Graceful shutdown: stop the loops, run a final flush
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        join_all(tasks).await;
        let _ = self.pulse_store.flush().await;
        log_info(LogCategory::System, "monitoring engine stopped");
    }

    /// Whether notification emission is still suppressed after startup
    fn in_grace_window(&self, now_ms: i64) -> bool {
        let started = self.started_at_ms.load(Ordering::SeqCst);
        started > 0 && now_ms - started < self.config.grace_period.as_millis() as i64
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    /// Accept one pulse from a probe
    ///
    /// Resolves the token, validates and buffers the pulse, clears the
    /// monitor's miss counters (emitting a recovered transition when it was
    /// down), marks it for recompute and publishes the realtime event.
    pub async fn submit_pulse(&self, token: &str, request: PulseRequest) -> Result<PulseAck> {
        let snapshot = self.snapshot();
        let monitor = snapshot
            .monitor_by_token(token)
            .ok_or_else(|| MonitorError::Unauthorized("unknown push token".to_string()))?
            .clone();
        let now_ms = Utc::now().timestamp_millis();

        let record = prepare_pulse(&monitor, &request, now_ms)?;
        let latency_ms = record.latency_ms;
        let timestamp_ms = record.timestamp_ms;

        if self.pulse_store.enqueue(record) {
            let store = Arc::clone(&self.pulse_store);
            tokio::spawn(async move {
                let _ = store.flush().await;
            });
        }
        counter!("pulse_sentinel_pulses_accepted_total", 1);

        // A valid pulse resets the miss counters; a previously down monitor recovers
        if let Some(prior) = self.detector.handle_pulse_received(&monitor.id) {
            self.status_cache.set_status(&monitor.id, EntityStatus::Up);
            self.emit_transition(
                &snapshot,
                SourceType::Monitor,
                &monitor.id,
                &monitor.name,
                monitor.group_id.as_deref(),
                &monitor.notification_channels,
                TransitionKind::Recovered,
                Some(prior.downtime_ms(now_ms)),
                now_ms,
            )
            .await;
        }

        self.broadcaster.publish_pulse(
            &snapshot,
            &monitor.id,
            json!({
                "monitorId": monitor.id,
                "latency": latency_ms,
                "pulseTimestamp": timestamp_ms,
            }),
        );

        Ok(PulseAck {
            monitor_id: monitor.id.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Transition pipeline
    // ------------------------------------------------------------------

    /// Feed evaluation outcomes through counters, suppression and dispatch
    pub async fn process_outcomes(
        self: &Arc<Self>,
        snapshot: &Arc<ConfigSnapshot>,
        outcomes: Vec<EvalOutcome>,
    ) {
        for outcome in outcomes {
            if outcome.changed() {
                self.broadcaster.publish_status(
                    snapshot,
                    &outcome.entity_id,
                    json!({
                        "id": outcome.entity_id,
                        "sourceType": outcome.source_type,
                        "status": outcome.status,
                    }),
                );
                counter!("pulse_sentinel_transitions_total", 1);
            }
            match outcome.source_type {
                SourceType::Monitor => self.process_monitor_outcome(snapshot, &outcome).await,
                SourceType::Group => self.process_group_outcome(snapshot, &outcome).await,
            }
        }
    }

    async fn process_monitor_outcome(
        self: &Arc<Self>,
        snapshot: &Arc<ConfigSnapshot>,
        outcome: &EvalOutcome,
    ) {
        let Some(monitor) = snapshot.monitor_by_id(&outcome.entity_id) else {
            return;
        };
        let monitor = monitor.clone();

        match (outcome.previous, outcome.status) {
            (previous, EntityStatus::Down) if previous != Some(EntityStatus::Down) => {
                let state = self
                    .detector
                    .record_status_down(&monitor.id, outcome.timestamp_ms);
                if state.consecutive == 1
                    && state.should_notify(monitor.resend_notification)
                {
                    self.emit_transition(
                        snapshot,
                        SourceType::Monitor,
                        &monitor.id,
                        &monitor.name,
                        monitor.group_id.as_deref(),
                        &monitor.notification_channels,
                        TransitionKind::Down,
                        Some(0),
                        outcome.timestamp_ms,
                    )
                    .await;
                }
            }
            (Some(EntityStatus::Down), status) if status != EntityStatus::Down => {
                if let Some(prior) = self.detector.record_recovery(&monitor.id) {
                    self.emit_transition(
                        snapshot,
                        SourceType::Monitor,
                        &monitor.id,
                        &monitor.name,
                        monitor.group_id.as_deref(),
                        &monitor.notification_channels,
                        TransitionKind::Recovered,
                        Some(prior.downtime_ms(outcome.timestamp_ms)),
                        outcome.timestamp_ms,
                    )
                    .await;
                }
            }
            _ => {}
        }
    }

    async fn process_group_outcome(
        self: &Arc<Self>,
        snapshot: &Arc<ConfigSnapshot>,
        outcome: &EvalOutcome,
    ) {
        let Some(group) = snapshot.group_by_id(&outcome.entity_id) else {
            return;
        };
        let group = group.clone();
        let now_ms = outcome.timestamp_ms;

        match (outcome.previous, outcome.status) {
            (previous, EntityStatus::Down) if previous != Some(EntityStatus::Down) => {
                let (state, first) = self.group_tracker.record_down(&group.id, now_ms);
                if first && state.should_notify(group.resend_notification) {
                    if group.dependencies.is_empty() {
                        self.emit_transition(
                            snapshot,
                            SourceType::Group,
                            &group.id,
                            &group.name,
                            group.parent_id.as_deref(),
                            &group.notification_channels,
                            TransitionKind::Down,
                            Some(0),
                            now_ms,
                        )
                        .await;
                    } else {
                        // Hold the alert for a confirmation delay; a
                        // dependency going down or a recovery aborts it
                        self.defer_group_down(Arc::clone(snapshot), group);
                    }
                }
            }
            (Some(EntityStatus::Down), EntityStatus::Down) => {
                self.group_tracker.record_down(&group.id, now_ms);
                if self
                    .group_tracker
                    .should_send_still_down(&group.id, group.resend_notification)
                {
                    let downtime = self
                        .group_tracker
                        .downtime_ms(&group.id, group.interval, now_ms);
                    self.emit_transition(
                        snapshot,
                        SourceType::Group,
                        &group.id,
                        &group.name,
                        group.parent_id.as_deref(),
                        &group.notification_channels,
                        TransitionKind::StillDown,
                        Some(downtime),
                        now_ms,
                    )
                    .await;
                }
            }
            (Some(EntityStatus::Down), status) => {
                if let Some(prior) = self.group_tracker.record_recovery(&group.id) {
                    let kind = if status == EntityStatus::Up {
                        TransitionKind::Recovered
                    } else {
                        TransitionKind::Degraded
                    };
                    self.emit_transition(
                        snapshot,
                        SourceType::Group,
                        &group.id,
                        &group.name,
                        group.parent_id.as_deref(),
                        &group.notification_channels,
                        kind,
                        Some(prior.downtime_ms(now_ms)),
                        now_ms,
                    )
                    .await;
                }
            }
            (previous, EntityStatus::Degraded) if previous != Some(EntityStatus::Degraded) => {
                self.emit_transition(
                    snapshot,
                    SourceType::Group,
                    &group.id,
                    &group.name,
                    group.parent_id.as_deref(),
                    &group.notification_channels,
                    TransitionKind::Degraded,
                    None,
                    now_ms,
                )
                .await;
            }
            _ => {}
        }
    }

    /// Spawn the deferred group down notification
    fn defer_group_down(self: &Arc<Self>, snapshot: Arc<ConfigSnapshot>, group: Arc<GroupConfig>) {
        let token = CancellationToken::new();
        self.group_tracker.defer_notification(&group.id, token.clone());

        let engine = Arc::clone(self);
        let delay = self.config.group_confirm_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    engine.group_tracker.finish_pending(&group.id);
                    let now_ms = Utc::now().timestamp_millis();
                    if engine.status_cache.status_of(&group.id) == Some(EntityStatus::Down) {
                        engine
                            .emit_transition(
                                &snapshot,
                                SourceType::Group,
                                &group.id,
                                &group.name,
                                group.parent_id.as_deref(),
                                &group.notification_channels,
                                TransitionKind::Down,
                                Some(engine.group_tracker.downtime_ms(&group.id, group.interval, now_ms)),
                                now_ms,
                            )
                            .await;
                    }
                }
            }
        });
    }

    /// The single notification emission point
    ///
    /// Applies the grace window and dependency suppression, fans out to the
    /// entity's channels, confirms delivery on the down counters and feeds
    /// the internal notification stream.
    #[allow(clippy::too_many_arguments)]
    async fn emit_transition(
        &self,
        snapshot: &Arc<ConfigSnapshot>,
        source_type: SourceType,
        entity_id: &str,
        entity_name: &str,
        group_id: Option<&str>,
        channels: &[String],
        kind: TransitionKind,
        downtime_ms: Option<i64>,
        now_ms: i64,
    ) {
        if self.in_grace_window(now_ms) {
            log_info(
                LogCategory::Notify,
                &format!("grace window suppressed '{kind}' for '{entity_id}'"),
            );
            return;
        }

        if matches!(kind, TransitionKind::Down | TransitionKind::StillDown) {
            let suppressed = snapshot
                .dependencies_of(entity_id)
                .iter()
                .any(|dep| self.status_cache.status_of(dep) == Some(EntityStatus::Down));
            if suppressed {
                log_info(
                    LogCategory::Notify,
                    &format!("dependency down, withholding '{kind}' for '{entity_id}'"),
                );
                counter!("pulse_sentinel_notifications_suppressed_total", 1);
                return;
            }
        }

        let event = NotificationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source_type,
            entity_id: entity_id.to_string(),
            entity_name: entity_name.to_string(),
            timestamp_ms: now_ms,
            downtime_ms,
            group_name: group_id
                .and_then(|id| snapshot.entity_name(id))
                .map(|name| name.to_string()),
        };

        self.dispatcher.dispatch(snapshot, channels, &event).await;

        if matches!(kind, TransitionKind::Down | TransitionKind::StillDown) {
            match source_type {
                SourceType::Monitor => self.detector.mark_notified(entity_id),
                SourceType::Group => self.group_tracker.mark_notified(entity_id),
            }
        }

        let _ = self.notify_tx.send(event);
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    fn spawn_drain_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.drain_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.drain_recompute_queue().await,
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }

    /// Flush the pulse write buffer immediately
    pub async fn flush_pulses(&self) -> Result<usize> {
        self.pulse_store.flush().await
    }

    /// Evaluate every queued monitor with bounded parallelism
    pub async fn drain_recompute_queue(self: &Arc<Self>) {
        let monitor_ids = self.pulse_store.drain_recompute();
        if monitor_ids.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        let now_ms = Utc::now().timestamp_millis();

        let evaluations = stream::iter(monitor_ids)
            .map(|monitor_id| {
                let snapshot = Arc::clone(&snapshot);
                let evaluator = Arc::clone(&self.evaluator);
                async move {
                    let Some(monitor) = snapshot.monitor_by_id(&monitor_id) else {
                        return Vec::new();
                    };
                    match evaluator.evaluate_monitor(&snapshot, monitor, now_ms).await {
                        Ok(outcomes) => outcomes,
                        Err(e) => {
                            log_warn(
                                LogCategory::Status,
                                &format!("recompute of '{monitor_id}' failed: {e}"),
                            );
                            Vec::new()
                        }
                    }
                }
            })
            .buffer_unordered(self.config.recompute_concurrency)
            .collect::<Vec<Vec<EvalOutcome>>>()
            .await;

        for outcomes in evaluations {
            self.process_outcomes(&snapshot, outcomes).await;
        }
    }

    fn spawn_detector_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.run_detector_pass().await,
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }

    /// One detector scan plus downstream handling of its findings
    pub async fn run_detector_pass(self: &Arc<Self>) {
        let snapshot = self.snapshot();
        let now_ms = Utc::now().timestamp_millis();
        let grace_ms = self.config.grace_period.as_millis() as i64;

        let events = self
            .detector
            .scan(&snapshot, &self.status_cache, now_ms, grace_ms)
            .await;

        for event in events {
            self.handle_detector_event(&snapshot, event).await;
        }
    }

    async fn handle_detector_event(
        self: &Arc<Self>,
        snapshot: &Arc<ConfigSnapshot>,
        event: DetectorEvent,
    ) {
        if event.kind == TransitionKind::Down {
            self.broadcaster.publish_status(
                snapshot,
                &event.monitor_id,
                json!({
                    "id": event.monitor_id,
                    "sourceType": SourceType::Monitor,
                    "status": EntityStatus::Down,
                }),
            );
            counter!("pulse_sentinel_transitions_total", 1);
        }

        let channels = snapshot
            .monitor_by_id(&event.monitor_id)
            .map(|m| m.notification_channels.clone())
            .unwrap_or_default();

        if event.should_notify {
            self.emit_transition(
                snapshot,
                SourceType::Monitor,
                &event.monitor_id,
                &event.monitor_name,
                event.group_id.as_deref(),
                &channels,
                event.kind,
                event.downtime_ms,
                event.timestamp_ms,
            )
            .await;
        }

        // A monitor marked down changes its parent's composition
        if event.kind == TransitionKind::Down {
            if let Some(group_id) = &event.group_id {
                let mut outcomes = Vec::new();
                self.evaluator
                    .cascade_groups(snapshot, group_id, event.timestamp_ms, &mut outcomes);
                self.process_outcomes(snapshot, outcomes).await;
            }
        }
    }

    fn spawn_aggregation_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.aggregation.run_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = engine.snapshot();
                        let now_ms = Utc::now().timestamp_millis();
                        engine.aggregation.run(&snapshot, now_ms).await;
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }

    fn spawn_probe_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            // Drift-corrected schedule: the next probe is anchored to the
            // previous target, not to when the probe finished
            let interval = engine.self_monitor.probe_interval();
            let mut next = tokio::time::Instant::now() + interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(next) => {
                        next += interval;
                        let snapshot = engine.snapshot();
                        let now_ms = Utc::now().timestamp_millis();
                        if let Some(report) = engine.self_monitor.probe(&snapshot, now_ms).await {
                            if report.pulses_written > 0 {
                                // Backfilled monitors need fresh statuses
                                for monitor in snapshot.monitors() {
                                    engine.pulse_store.mark_for_recompute(&monitor.id);
                                }
                            }
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Configuration reload
    // ------------------------------------------------------------------

    /// Apply a new configuration document (hot reload)
    ///
    /// On success every runtime state map is re-initialized, all statuses are
    /// recomputed and live subscribers receive one configuration-update
    /// signal. On validation failure nothing changes.
    pub async fn reload(self: &Arc<Self>, candidate: ConfigDocument) -> Result<()> {
        let snapshot = self.config_cache.apply(candidate)?;
        self.finish_reload(snapshot).await;
        Ok(())
    }

    /// Re-read the backing configuration file and apply it
    pub async fn reload_from_disk(self: &Arc<Self>) -> Result<()> {
        let snapshot = self.config_cache.reload_from_disk()?;
        self.finish_reload(snapshot).await;
        Ok(())
    }

    async fn finish_reload(self: &Arc<Self>, snapshot: Arc<ConfigSnapshot>) {
        self.status_cache.clear();
        self.detector.clear();
        self.group_tracker.clear();

        let now_ms = Utc::now().timestamp_millis();
        let outcomes = self.evaluator.evaluate_all(&snapshot, now_ms).await;
        self.process_outcomes(&snapshot, outcomes).await;

        // Subscribers see the fully rebuilt state exactly once
        self.broadcaster.publish_config_update(&snapshot);
        counter!("pulse_sentinel_reloads_total", 1);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Latest status data of a monitor or group
    pub fn status_of(&self, entity_id: &str) -> Option<StatusData> {
        self.status_cache.get(entity_id)
    }

    /// Aggregated counts for a status page
    pub fn page_summary(&self, slug: &str) -> Result<PageSummary> {
        let snapshot = self.snapshot();
        let page = snapshot
            .page_by_slug(slug)
            .ok_or_else(|| MonitorError::NotFound(format!("status page '{slug}'")))?;

        let mut summary = PageSummary {
            total: page.items.len() as u32,
            ..PageSummary::default()
        };
        for item in &page.items {
            match self.status_cache.status_of(item) {
                Some(EntityStatus::Up) => summary.up += 1,
                Some(EntityStatus::Degraded) => summary.degraded += 1,
                Some(EntityStatus::Down) => summary.down += 1,
                None => {}
            }
        }
        Ok(summary)
    }

    /// Time series for one monitor
    ///
    /// Short periods read raw pulses; 7d/30d/90d read hourly rows; 365d reads
    /// daily rows.
    pub async fn monitor_history(
        &self,
        monitor_id: &str,
        period: ReportingPeriod,
    ) -> Result<Vec<HistorySample>> {
        let snapshot = self.snapshot();
        if snapshot.monitor_by_id(monitor_id).is_none() {
            return Err(MonitorError::NotFound(format!("monitor '{monitor_id}'")));
        }
        let now_ms = Utc::now().timestamp_millis();
        let start_ms = now_ms - period.seconds() * 1000;

        let samples = match period {
            ReportingPeriod::Hour1 | ReportingPeriod::Day1 => self
                .storage
                .pulses_in(monitor_id, start_ms, now_ms)
                .await?
                .into_iter()
                .map(|pulse| {
                    let point = |value: Option<f64>| MetricSummary {
                        min: value,
                        max: value,
                        avg: value,
                    };
                    HistorySample {
                        timestamp_ms: pulse.timestamp_ms,
                        uptime: None,
                        latency: point(pulse.latency_ms),
                        custom1: point(pulse.custom1),
                        custom2: point(pulse.custom2),
                        custom3: point(pulse.custom3),
                    }
                })
                .collect(),
            ReportingPeriod::Day7 | ReportingPeriod::Day30 | ReportingPeriod::Day90 => self
                .storage
                .hourly_in(monitor_id, start_ms, now_ms)
                .await?
                .into_iter()
                .map(|row| HistorySample {
                    timestamp_ms: row.hour_start_ms,
                    uptime: Some(row.uptime),
                    latency: row.latency,
                    custom1: row.custom1,
                    custom2: row.custom2,
                    custom3: row.custom3,
                })
                .collect(),
            ReportingPeriod::Day365 => self
                .storage
                .daily_in(monitor_id, start_ms, now_ms)
                .await?
                .into_iter()
                .map(|row| HistorySample {
                    timestamp_ms: row.day_start_ms,
                    uptime: Some(row.uptime),
                    latency: row.latency,
                    custom1: row.custom1,
                    custom2: row.custom2,
                    custom3: row.custom3,
                })
                .collect(),
        };
        Ok(samples)
    }

    /// Time series for a group, combined from its direct monitor children
    /// bucket by bucket according to the group's strategy
    pub async fn group_history(
        &self,
        group_id: &str,
        period: ReportingPeriod,
    ) -> Result<Vec<HistorySample>> {
        use crate::config_cache::GroupStrategy;
        use std::collections::BTreeMap;

        let snapshot = self.snapshot();
        let group = snapshot
            .group_by_id(group_id)
            .ok_or_else(|| MonitorError::NotFound(format!("group '{group_id}'")))?
            .clone();

        let now_ms = Utc::now().timestamp_millis();
        let start_ms = now_ms - period.seconds() * 1000;
        let daily = period == ReportingPeriod::Day365;

        let mut buckets: BTreeMap<i64, Vec<(f64, MetricSummary)>> = BTreeMap::new();
        for monitor_id in snapshot.monitors_in_group(group_id) {
            if daily {
                for row in self.storage.daily_in(monitor_id, start_ms, now_ms).await? {
                    buckets
                        .entry(row.day_start_ms)
                        .or_default()
                        .push((row.uptime, row.latency));
                }
            } else {
                for row in self.storage.hourly_in(monitor_id, start_ms, now_ms).await? {
                    buckets
                        .entry(row.hour_start_ms)
                        .or_default()
                        .push((row.uptime, row.latency));
                }
            }
        }

        let samples = buckets
            .into_iter()
            .map(|(timestamp_ms, entries)| {
                let uptime = match group.strategy {
                    GroupStrategy::AnyUp => entries
                        .iter()
                        .map(|(u, _)| *u)
                        .fold(f64::NEG_INFINITY, f64::max),
                    GroupStrategy::AllUp => {
                        entries.iter().map(|(u, _)| *u).fold(f64::INFINITY, f64::min)
                    }
                    GroupStrategy::Percentage => {
                        entries.iter().map(|(u, _)| *u).sum::<f64>() / entries.len() as f64
                    }
                };
                HistorySample {
                    timestamp_ms,
                    uptime: Some(uptime),
                    latency: MetricSummary::merge(entries.iter().map(|(_, l)| *l)),
                    custom1: MetricSummary::default(),
                    custom2: MetricSummary::default(),
                    custom3: MetricSummary::default(),
                }
            })
            .collect();
        Ok(samples)
    }

    /// Incidents affecting a status page within one calendar month
    pub async fn incidents_for_page(
        &self,
        slug: &str,
        year: i32,
        month: u32,
    ) -> Result<Vec<Incident>> {
        let snapshot = self.snapshot();
        let page = snapshot
            .page_by_slug(slug)
            .ok_or_else(|| MonitorError::NotFound(format!("status page '{slug}'")))?;

        let start = Utc
            .with_ymd_and_hms(year, month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| MonitorError::BadRequest(format!("invalid month {year}-{month:02}")))?;
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let end = Utc
            .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| MonitorError::Internal("month arithmetic failed".to_string()))?;

        // Every entity visible on the page, including monitors reached
        // through listed groups
        let mut entity_ids: Vec<String> = page.items.clone();
        for monitor in snapshot.monitors() {
            if snapshot
                .pages_containing_monitor(&monitor.id)
                .contains(&page.slug)
                && !entity_ids.contains(&monitor.id)
            {
                entity_ids.push(monitor.id.clone());
            }
        }

        self.storage
            .incidents_in(&entity_ids, start.timestamp_millis(), end.timestamp_millis())
            .await
    }

    /// Subscribe a status-page viewer to realtime events
    pub fn subscribe_page(
        &self,
        slug: &str,
        password: Option<&str>,
    ) -> Result<broadcast::Receiver<serde_json::Value>> {
        self.broadcaster
            .subscribe_page(&self.snapshot(), slug, password)
    }

    /// Subscribe a probe worker to configuration pushes
    pub fn subscribe_worker(&self, token: &str) -> Result<broadcast::Receiver<serde_json::Value>> {
        self.broadcaster.subscribe_worker(&self.snapshot(), token)
    }

    /// Overall engine health report
    pub fn health(&self) -> serde_json::Value {
        let now_ms = Utc::now().timestamp_millis();
        let started = self.started_at_ms.load(Ordering::SeqCst);
        json!({
            "status": if self.self_monitor.is_healthy() { "operational" } else { "degraded" },
            "version": ARCHITECTURE_VERSION,
            "uptimeSeconds": if started > 0 { (now_ms - started) / 1000 } else { 0 },
            "storageHealthy": self.self_monitor.is_healthy(),
            "bufferDepth": self.pulse_store.buffer_depth(),
            "cachedEntities": self.status_cache.len(),
            "graceWindowActive": self.in_grace_window(now_ms),
        })
    }

    /// Missing-pulse detector health report
    pub fn detector_health(&self) -> serde_json::Value {
        let now_ms = Utc::now().timestamp_millis();
        let check_interval_ms = self.config.check_interval.as_millis() as i64;
        json!({
            "healthy": self.detector.is_healthy(now_ms, check_interval_ms),
            "lastScanMs": self.detector.last_scan_ms(),
        })
    }
}
