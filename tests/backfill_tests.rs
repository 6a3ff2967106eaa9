use pulse_sentinel::config_cache::{ConfigDocument, ConfigSnapshot, CoreSettings, MonitorConfig};
use pulse_sentinel::self_monitor::{
    LatencyStrategy, SelfMonitor, SelfMonitorConfig, SELF_MONITOR_ID,
};
use pulse_sentinel::storage::{MemoryStorage, PulseRecord, PulseStorage};
use std::sync::Arc;

/// Self-monitor and backfill tests: outage tracking, qualification window,
/// synthesis bounds and latency strategies.

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

fn build(monitors: Vec<MonitorConfig>) -> ConfigSnapshot {
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
        latency_ms: Some(33.0),
        custom1: Some(7.0),
        custom2: None,
        custom3: None,
        synthetic: false,
    }
}

#[test_log::test(tokio::test)]
async fn test_storage_outage_and_recovery_workflow() {
    println!("🧪 Testing Storage Outage → Recovery → Backfill Workflow");

    let storage = Arc::new(MemoryStorage::new());
    let snap = build(vec![monitor("api", 30), monitor("batch", 30)]);
    let self_monitor = SelfMonitor::new(storage.clone(), SelfMonitorConfig::default());

    // Step 1: healthy probes push self pulses
    println!("💓 Step 1: healthy probe");
    assert!(self_monitor.probe(&snap, NOW - 30_000).await.is_none());
    assert!(self_monitor.is_healthy());
    assert_eq!(storage.pulse_count(SELF_MONITOR_ID), 1);

    // 'api' was pulsing right before the outage; 'batch' was already silent
    storage
        .insert_pulses(vec![real_pulse("api", NOW - 20_000)])
        .await
        .unwrap();

    // Step 2: the backend goes dark
    println!("🛑 Step 2: backend outage");
    storage.set_available(false);
    self_monitor.probe(&snap, NOW).await;
    assert!(!self_monitor.is_healthy());
    assert_eq!(self_monitor.down_since_ms(), Some(NOW));

    self_monitor.probe(&snap, NOW + 60_000).await;
    assert_eq!(self_monitor.down_since_ms(), Some(NOW), "outage start is pinned");

    // Step 3: recovery runs backfill for the known-healthy monitor only
    println!("🟢 Step 3: recovery and backfill");
    storage.set_available(true);
    let outage_end = NOW + 240_000;
    let report = self_monitor
        .probe(&snap, outage_end)
        .await
        .expect("recovery triggers backfill");

    assert_eq!(report.monitors_backfilled, 1);
    let synthesized = storage.synthetic_pulses("api");
    assert_eq!(synthesized.len(), report.pulses_written);
    assert!(!synthesized.is_empty());

    // Property: synthesis never leaves [outage_start, current interval end]
    for pulse in &synthesized {
        assert!(pulse.timestamp_ms >= NOW, "no pulse before the outage start");
        assert!(pulse.timestamp_ms <= outage_end, "no pulse after the recovery");
        assert!(pulse.synthetic);
        assert_eq!(pulse.latency_ms, Some(33.0), "last-known latency");
        assert_eq!(pulse.custom1, Some(7.0), "last-known custom metric");
    }
    assert!(
        storage.synthetic_pulses("batch").is_empty(),
        "a silent monitor is not backfilled"
    );

    // The current interval carries a pulse
    let current_boundary = outage_end - outage_end.rem_euclid(30_000);
    assert!(
        synthesized.iter().any(|p| p.timestamp_ms == current_boundary),
        "current interval boundary is covered"
    );
    println!("✅ Backfill respected the outage window and qualification rules");
}

#[tokio::test]
async fn test_qualification_window_is_two_intervals() {
    println!("🧪 Testing Backfill Qualification Window");

    let storage = Arc::new(MemoryStorage::new());
    let snap = build(vec![monitor("fresh", 30), monitor("stale", 30)]);
    let self_monitor = SelfMonitor::new(storage.clone(), SelfMonitorConfig::default());

    // 'fresh' pulsed inside [outage - 2 * interval, outage); 'stale' before that
    storage
        .insert_pulses(vec![
            real_pulse("fresh", NOW - 59_000),
            real_pulse("stale", NOW - 61_000),
        ])
        .await
        .unwrap();

    let report = self_monitor.backfill(&snap, NOW, NOW + 120_000).await.unwrap();

    assert_eq!(report.monitors_backfilled, 1);
    assert!(!storage.synthetic_pulses("fresh").is_empty());
    assert!(storage.synthetic_pulses("stale").is_empty());
    println!("✅ Only the monitor seen within 2 intervals qualified");
}

#[tokio::test]
async fn test_null_latency_strategy_writes_nulls() {
    println!("🧪 Testing null Latency Strategy");

    let storage = Arc::new(MemoryStorage::new());
    let snap = build(vec![monitor("api", 30)]);
    let self_monitor = SelfMonitor::new(
        storage.clone(),
        SelfMonitorConfig {
            latency_strategy: LatencyStrategy::Null,
            ..SelfMonitorConfig::default()
        },
    );

    storage
        .insert_pulses(vec![real_pulse("api", NOW - 5_000)])
        .await
        .unwrap();
    self_monitor.backfill(&snap, NOW, NOW + 90_000).await.unwrap();

    let synthesized = storage.synthetic_pulses("api");
    assert!(!synthesized.is_empty());
    for pulse in synthesized {
        assert_eq!(pulse.latency_ms, None);
        assert_eq!(pulse.custom1, None);
    }
    println!("✅ Synthesized pulses carry nulls");
}

#[tokio::test]
async fn test_backfill_cap_and_concurrency_guard() {
    println!("🧪 Testing Backfill Cap and Concurrency Guard");

    let storage = Arc::new(MemoryStorage::new());
    let snap = build(vec![monitor("api", 1)]);
    let self_monitor = SelfMonitor::new(
        storage.clone(),
        SelfMonitorConfig {
            backfill_cap: 100,
            ..SelfMonitorConfig::default()
        },
    );

    storage
        .insert_pulses(vec![real_pulse("api", NOW - 1_500)])
        .await
        .unwrap();

    // A one-hour outage with a 1s interval would want 3600 pulses
    let report = self_monitor
        .backfill(&snap, NOW, NOW + 3_600_000)
        .await
        .unwrap();
    assert_eq!(report.pulses_written, 100, "per-monitor cap applied");

    let current_boundary = NOW + 3_600_000;
    assert!(
        storage
            .synthetic_pulses("api")
            .iter()
            .any(|p| p.timestamp_ms == current_boundary - current_boundary.rem_euclid(1_000)),
        "current interval still covered under the cap"
    );
    println!("✅ Cap bounded the synthesis, current interval kept");
}

#[tokio::test]
async fn test_backfill_synthetic_pulses_do_not_requalify() {
    println!("🧪 Testing Synthetic Pulses Do Not Qualify a Later Backfill");

    let storage = Arc::new(MemoryStorage::new());
    let snap = build(vec![monitor("api", 30)]);
    let self_monitor = SelfMonitor::new(storage.clone(), SelfMonitorConfig::default());

    // Only a synthetic pulse exists before this outage
    storage
        .insert_pulses(vec![PulseRecord {
            synthetic: true,
            ..real_pulse("api", NOW - 10_000)
        }])
        .await
        .unwrap();

    let report = self_monitor.backfill(&snap, NOW, NOW + 120_000).await.unwrap();
    assert_eq!(report.monitors_backfilled, 0);
    println!("✅ Synthetic history does not count as known-healthy");
}
