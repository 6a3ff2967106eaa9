use pulse_sentinel::config_cache::{
    ConfigDocument, CoreSettings, GroupConfig, GroupStrategy, MonitorConfig, StatusPageConfig,
};
use pulse_sentinel::engine::MonitoringEngine;
use pulse_sentinel::notification::{ChannelConfig, WebhookSettings};
use pulse_sentinel::pulse_store::PulseRequest;
use pulse_sentinel::status_evaluator::{EntityStatus, ReportingPeriod};
use pulse_sentinel::config_cache::ConfigCache;
use pulse_sentinel::storage::{Incident, IncidentStatus, MemoryStorage, PulseStorage};
use pulse_sentinel::MonitorError;
use std::collections::HashMap;
use std::sync::Arc;

/// End-to-end engine workflows over the in-process backend: ingest, realtime
/// fan-out, summaries, histories, incidents and hot reload.

fn monitor(id: &str, group: Option<&str>) -> MonitorConfig {
    MonitorConfig {
        id: id.to_string(),
        token: format!("tok-{id}"),
        name: id.to_uppercase(),
        interval: 30,
        max_retries: 3,
        tolerance_factor: 1.5,
        resend_notification: 0,
        group_id: group.map(|g| g.to_string()),
        notification_channels: Vec::new(),
        custom_metrics: Vec::new(),
        dependencies: Vec::new(),
    }
}

fn document() -> ConfigDocument {
    let mut settings = CoreSettings::default();
    settings.grace_period_secs = 0;
    settings.flush_interval_secs = 1;
    settings.drain_interval_secs = 1;
    ConfigDocument {
        settings,
        monitors: vec![monitor("api", Some("backend")), monitor("db", Some("backend"))],
        groups: vec![GroupConfig {
            id: "backend".to_string(),
            name: "Backend".to_string(),
            strategy: GroupStrategy::AllUp,
            degraded_threshold: 50.0,
            interval: 60,
            resend_notification: 0,
            parent_id: None,
            notification_channels: Vec::new(),
            dependencies: Vec::new(),
        }],
        status_pages: vec![StatusPageConfig {
            slug: "public".to_string(),
            name: "Public Status".to_string(),
            items: vec!["backend".to_string()],
            password: None,
        }],
        notification_channels: vec![ChannelConfig {
            id: "ops".to_string(),
            enabled: true,
            email: None,
            discord: None,
            ntfy: None,
            telegram: None,
            webhook: Some(WebhookSettings {
                enabled: true,
                url: "http://127.0.0.1:9/unreachable".to_string(),
                method: "POST".to_string(),
                headers: HashMap::new(),
            }),
        }],
    }
}

fn engine_with(document: ConfigDocument) -> (Arc<MonitoringEngine>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let cache = ConfigCache::from_document(document).unwrap();
    (MonitoringEngine::with_storage(cache, storage.clone()), storage)
}

#[tokio::test]
async fn test_ingest_to_realtime_workflow() {
    println!("🧪 Testing Ingest → Realtime Fan-Out Workflow");

    let (engine, _storage) = engine_with(document());

    // Step 1: a viewer subscribes to the public page
    println!("👤 Step 1: viewer subscribes to /public");
    let mut viewer = engine.subscribe_page("public", None).unwrap();

    // Step 2: a probe pushes a pulse
    println!("📡 Step 2: probe pushes a pulse");
    let ack = engine
        .submit_pulse("tok-api", PulseRequest::with_latency(21.5))
        .await
        .unwrap();
    assert_eq!(ack.monitor_id, "api");

    // Step 3: the viewer receives the pulse envelope, because the page
    // lists the group containing the monitor
    println!("📬 Step 3: envelope arrives");
    let event = viewer.recv().await.unwrap();
    assert_eq!(event["action"], "pulse");
    assert_eq!(event["monitorId"], "api");
    assert_eq!(event["latency"], 21.5);
    println!("✅ Realtime pulse routed through the group reverse index");

    // Step 4: unknown tokens and pages are rejected
    assert!(matches!(
        engine.submit_pulse("ghost", PulseRequest::heartbeat()).await,
        Err(MonitorError::Unauthorized(_))
    ));
    assert!(matches!(
        engine.subscribe_page("ghost", None),
        Err(MonitorError::NotFound(_))
    ));
    println!("✅ Auth and lookup failures surface correctly");
}

#[tokio::test]
async fn test_status_summary_workflow() {
    println!("🧪 Testing Page Summary Workflow");

    let (engine, _storage) = engine_with(document());

    // Pulses for both monitors, then a drained recompute
    engine
        .submit_pulse("tok-api", PulseRequest::with_latency(10.0))
        .await
        .unwrap();
    engine
        .submit_pulse("tok-db", PulseRequest::with_latency(12.0))
        .await
        .unwrap();
    engine.flush_pulses().await.unwrap();
    engine.drain_recompute_queue().await;

    let summary = engine.page_summary("public").unwrap();
    assert_eq!(summary.total, 1, "the page lists one group item");
    assert_eq!(summary.up, 1, "the all-up group computed up");
    assert_eq!(
        engine.status_of("backend").map(|d| d.status),
        Some(EntityStatus::Up)
    );
    println!("✅ Summary counts the composed group status");
}

#[tokio::test]
async fn test_history_series_workflow() {
    println!("🧪 Testing History Series Workflow");

    let (engine, storage) = engine_with(document());
    let now_ms = chrono::Utc::now().timestamp_millis();

    // Seed raw pulses over the last 30 minutes
    let pulses: Vec<_> = (0..10)
        .map(|i| pulse_sentinel::storage::PulseRecord {
            monitor_id: "api".to_string(),
            timestamp_ms: now_ms - 1_800_000 + i * 60_000,
            latency_ms: Some(20.0 + i as f64),
            custom1: None,
            custom2: None,
            custom3: None,
            synthetic: false,
        })
        .collect();
    storage.insert_pulses(pulses).await.unwrap();

    let series = engine
        .monitor_history("api", ReportingPeriod::Hour1)
        .await
        .unwrap();
    assert_eq!(series.len(), 10);
    assert!(series[0].uptime.is_none(), "raw pulses carry no uptime");
    assert_eq!(series[0].latency.avg, Some(20.0));

    assert!(matches!(
        engine.monitor_history("ghost", ReportingPeriod::Hour1).await,
        Err(MonitorError::NotFound(_))
    ));
    println!("✅ Raw series served for the 1h period");
}

#[tokio::test]
async fn test_incident_month_query() {
    println!("🧪 Testing Incident Month Query");

    let (engine, storage) = engine_with(document());

    // One incident in March 2024 affecting the API monitor
    let march_start = 1_709_300_000_000;
    storage.add_incident(Incident {
        id: "inc-1".to_string(),
        title: "API latency spike".to_string(),
        status: IncidentStatus::Resolved,
        started_at_ms: march_start,
        resolved_at_ms: Some(march_start + 3_600_000),
        affected: vec!["api".to_string()],
        updates: Vec::new(),
    });

    let hits = engine.incidents_for_page("public", 2024, 3).await.unwrap();
    assert_eq!(hits.len(), 1, "the page shows 'api' through the group item");

    let misses = engine.incidents_for_page("public", 2024, 5).await.unwrap();
    assert!(misses.is_empty());

    assert!(matches!(
        engine.incidents_for_page("ghost", 2024, 3).await,
        Err(MonitorError::NotFound(_))
    ));
    println!("✅ Month-scoped incident lookup follows page membership");
}

#[tokio::test]
async fn test_hot_reload_with_rollback_on_disk() {
    println!("🧪 Testing Hot Reload With On-Disk Rollback");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, toml::to_string_pretty(&document()).unwrap()).unwrap();

    let engine = MonitoringEngine::from_config_path(&path).unwrap();
    assert!(engine.snapshot().monitor_by_id("api").is_some());

    // Step 1: a valid reload is written through
    println!("🔄 Step 1: valid reload");
    let mut next = document();
    next.monitors.push(monitor("cache", None));
    engine.reload(next).await.unwrap();
    assert!(engine.snapshot().monitor_by_id("cache").is_some());

    let on_disk: ConfigDocument =
        toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk.monitors.len(), 3, "new document persisted");

    // Step 2: an invalid candidate is rejected as a no-op
    println!("🛑 Step 2: invalid reload is a no-op");
    let mut bad = document();
    bad.monitors[0].token = bad.monitors[1].token.clone();
    let err = engine.reload(bad).await.unwrap_err();
    assert!(matches!(err, MonitorError::Conflict(_)));

    assert!(engine.snapshot().monitor_by_id("cache").is_some());
    let on_disk: ConfigDocument =
        toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk.monitors.len(), 3, "previous document kept on disk");
    println!("✅ Reload protocol validated");
}

#[tokio::test]
async fn test_worker_receives_config_push_on_reload() {
    println!("🧪 Testing Worker Config Push");

    let (engine, _storage) = engine_with(document());
    let mut worker = engine.subscribe_worker("tok-api").unwrap();

    engine.reload(document()).await.unwrap();

    let event = worker.recv().await.unwrap();
    assert_eq!(event["action"], "config");
    println!("✅ Worker notified exactly once per reload");
}
