//! # Pulse Store - Ingest Validation and Buffered Persistence
//!
//! The ingest path of the core. Incoming pulses are validated (timing
//! derivation, push window, latency bounds), appended to a bounded in-memory
//! write buffer, and flushed to storage as batched inserts. Alongside the
//! buffer the store keeps the deduplicated recompute queue: every accepted
//! pulse marks its monitor for re-evaluation, and the drain loop hands the
//! set to the status evaluator.
//!
//! ## Failure Handling
//!
//! A failed batch insert retains the batch: the rows are prepended to the
//! buffer for the next flush. The buffer is bounded; when it overflows the
//! oldest rows are dropped with a warning so a long storage outage degrades
//! instead of exhausting memory.

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config_cache::MonitorConfig;
use crate::logging::{log_debug, log_error, log_warn, LogCategory};
use crate::storage::{PulseRecord, PulseStorage};
use crate::{MonitorError, Result};

/// Hard ceiling on a stored latency sample in milliseconds
pub const MAX_LATENCY_MS: f64 = 600_000.0;

/// How far into the future an `end_time` may point
pub const FUTURE_WINDOW_MS: i64 = 60_000;

/// How far into the past a `start_time` may point
pub const PAST_WINDOW_MS: i64 = 600_000;

/// Caller-supplied pulse parameters, prior to validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseRequest {
    /// Measured latency in milliseconds
    pub latency_ms: Option<f64>,
    /// Caller-provided sample start in epoch milliseconds
    pub start_time_ms: Option<i64>,
    /// Caller-provided sample end in epoch milliseconds
    pub end_time_ms: Option<i64>,
    /// User-defined metric slot 1
    pub custom1: Option<f64>,
    /// User-defined metric slot 2
    pub custom2: Option<f64>,
    /// User-defined metric slot 3
    pub custom3: Option<f64>,
}

impl PulseRequest {
    /// A bare pulse carrying only a latency sample
    pub fn with_latency(latency_ms: f64) -> Self {
        Self {
            latency_ms: Some(latency_ms),
            ..Self::default()
        }
    }

    /// A heartbeat pulse with no measurements at all
    pub fn heartbeat() -> Self {
        Self::default()
    }
}

/// Tuning for the write buffer and queues
#[derive(Debug, Clone)]
pub struct PulseStoreConfig {
    /// Flush immediately once the buffer holds this many pulses
    pub max_batch: usize,
    /// Buffer bound; oldest rows are dropped beyond it
    pub max_buffer: usize,
    /// Periodic flush interval
    pub flush_interval: Duration,
}

impl Default for PulseStoreConfig {
    fn default() -> Self {
        Self {
            max_batch: 100,
            max_buffer: 10_000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Validate a request against its monitor and derive the canonical record
///
/// Timing rules:
/// - both start and end given: latency is derived as `end - start` (>= 0)
/// - one of them plus a latency: the other endpoint is derived
/// - only a latency: `end = now`, `start = end - latency`
/// - nothing: both endpoints are `now` and no latency is stored
///
/// The push window rejects `end > now + 60 s` and `start < now - 10 min`.
/// Explicit latencies must be finite and positive; anything above the cap is
/// clamped to 600 000 ms on storage. Custom metric slots are stored only when
/// the monitor declares them.
pub fn prepare_pulse(
    monitor: &MonitorConfig,
    request: &PulseRequest,
    now_ms: i64,
) -> Result<PulseRecord> {
    // Validate first, clamp second: the clamped value also drives the
    // timing derivation so an oversized sample cannot fall out of the
    // push window
    let explicit_latency = match request.latency_ms {
        Some(value) if !value.is_finite() || value <= 0.0 => {
            return Err(MonitorError::BadRequest(format!(
                "latency must be a positive finite number, got {value}"
            )));
        }
        Some(value) => Some(value.min(MAX_LATENCY_MS)),
        None => None,
    };

    let (start_ms, end_ms, latency_ms) = match (request.start_time_ms, request.end_time_ms) {
        (Some(start), Some(end)) => {
            if end < start {
                return Err(MonitorError::BadRequest(
                    "end_time precedes start_time".to_string(),
                ));
            }
            (start, end, Some((end - start) as f64))
        }
        (None, Some(end)) => match explicit_latency {
            Some(latency) => (end - latency as i64, end, Some(latency)),
            None => (end, end, None),
        },
        (Some(start), None) => match explicit_latency {
            Some(latency) => (start, start + latency as i64, Some(latency)),
            None => {
                if now_ms < start {
                    return Err(MonitorError::BadRequest(
                        "start_time lies in the future".to_string(),
                    ));
                }
                (start, now_ms, Some((now_ms - start) as f64))
            }
        },
        (None, None) => match explicit_latency {
            Some(latency) => (now_ms - latency as i64, now_ms, Some(latency)),
            None => (now_ms, now_ms, None),
        },
    };

    if end_ms > now_ms + FUTURE_WINDOW_MS {
        return Err(MonitorError::BadRequest(
            "end_time lies outside the push window".to_string(),
        ));
    }
    if start_ms < now_ms - PAST_WINDOW_MS {
        return Err(MonitorError::BadRequest(
            "start_time lies outside the push window".to_string(),
        ));
    }

    let latency_ms = latency_ms.map(|value| value.min(MAX_LATENCY_MS));

    let custom = |slot: usize, value: Option<f64>| -> Result<Option<f64>> {
        match value {
            Some(v) if !monitor.declares_custom_slot(slot) => {
                log_debug(
                    LogCategory::Ingest,
                    &format!(
                        "monitor '{}' does not declare custom slot {slot}, dropping value {v}",
                        monitor.id
                    ),
                );
                Ok(None)
            }
            Some(v) if !v.is_finite() => Err(MonitorError::BadRequest(format!(
                "custom{slot} must be finite, got {v}"
            ))),
            other => Ok(other),
        }
    };

    Ok(PulseRecord {
        monitor_id: monitor.id.clone(),
        timestamp_ms: end_ms,
        latency_ms,
        custom1: custom(1, request.custom1)?,
        custom2: custom(2, request.custom2)?,
        custom3: custom(3, request.custom3)?,
        synthetic: false,
    })
}

/// Buffered, batching pulse persistence with the recompute queue
///
/// A process-wide singleton owned by the engine. The buffer and queue have
/// their own locks; flush is single-flight so the periodic loop and a
/// size-triggered flush never run the same batch twice.
pub struct PulseStore {
    storage: Arc<dyn PulseStorage>,
    config: PulseStoreConfig,
    buffer: Mutex<VecDeque<PulseRecord>>,
    flush_inflight: AtomicBool,
    recompute: Mutex<HashSet<String>>,
}

impl PulseStore {
    /// Create a store on top of a storage backend
    pub fn new(storage: Arc<dyn PulseStorage>, config: PulseStoreConfig) -> Self {
        Self {
            storage,
            config,
            buffer: Mutex::new(VecDeque::new()),
            flush_inflight: AtomicBool::new(false),
            recompute: Mutex::new(HashSet::new()),
        }
    }

    /// Append an already validated record to the write buffer
    ///
    /// Returns `true` when the buffer reached the batch threshold and the
    /// caller should trigger an early flush.
    pub fn enqueue(&self, record: PulseRecord) -> bool {
        let monitor_id = record.monitor_id.clone();
        let depth = {
            let mut buffer = self.buffer.lock();
            buffer.push_back(record);
            while buffer.len() > self.config.max_buffer {
                buffer.pop_front();
                counter!("pulse_sentinel_pulses_dropped_total", 1);
                log_warn(
                    LogCategory::Ingest,
                    "write buffer overflow, dropping oldest pulse",
                );
            }
            buffer.len()
        };

        counter!("pulse_sentinel_pulses_buffered_total", 1);
        gauge!("pulse_sentinel_buffer_depth", depth as f64);

        self.mark_for_recompute(&monitor_id);
        depth >= self.config.max_batch
    }

    /// Mark a monitor for status recomputation (deduplicated)
    pub fn mark_for_recompute(&self, monitor_id: &str) {
        self.recompute.lock().insert(monitor_id.to_string());
    }

    /// Take the current recompute set
    pub fn drain_recompute(&self) -> Vec<String> {
        let mut queue = self.recompute.lock();
        queue.drain().collect()
    }

    /// Current buffer depth
    pub fn buffer_depth(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Flush the buffer as one batched insert
    ///
    /// Single-flight: a concurrent call observes the in-flight flag and
    /// returns immediately. On insert failure the batch is prepended back to
    /// the buffer for the next attempt.
    pub async fn flush(&self) -> Result<usize> {
        if self
            .flush_inflight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }

        let batch: Vec<PulseRecord> = {
            let mut buffer = self.buffer.lock();
            buffer.drain(..).collect()
        };

        if batch.is_empty() {
            self.flush_inflight.store(false, Ordering::SeqCst);
            return Ok(0);
        }

        let count = batch.len();
        let result = self.storage.insert_pulses(batch.clone()).await;
        self.flush_inflight.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                counter!("pulse_sentinel_flush_batches_total", 1);
                gauge!("pulse_sentinel_buffer_depth", self.buffer_depth() as f64);
                log_debug(
                    LogCategory::Ingest,
                    &format!("flushed {count} pulses to storage"),
                );
                Ok(count)
            }
            Err(e) => {
                counter!("pulse_sentinel_flush_failures_total", 1);
                log_error(
                    LogCategory::Ingest,
                    &format!("batch insert failed, retaining {count} pulses: {e}"),
                );
                let mut buffer = self.buffer.lock();
                for record in batch.into_iter().rev() {
                    buffer.push_front(record);
                }
                while buffer.len() > self.config.max_buffer {
                    buffer.pop_front();
                    counter!("pulse_sentinel_pulses_dropped_total", 1);
                    log_warn(
                        LogCategory::Ingest,
                        "write buffer overflow after failed flush, dropping oldest pulse",
                    );
                }
                Err(e)
            }
        }
    }

    /// Spawn the periodic flush loop; a final flush runs on cancellation
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = store.flush().await;
                    }
                    _ = cancel.cancelled() => {
                        let _ = store.flush().await;
                        return;
                    }
                }
            }
        })
    }
}
