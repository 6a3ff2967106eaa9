//! # Pulse Sentinel v1.0.0
//!
//! A production-ready push-based uptime and metrics monitoring core. External
//! probes emit pulses (keyed by a secret token) carrying a latency sample and up
//! to three user-defined numeric metrics. The core persists pulses, computes
//! rolling uptime for each monitor, derives composite status for hierarchical
//! groups, detects missing pulses, aggregates historical data into coarser
//! buckets, and dispatches multi-channel notifications on state transitions.
//!
//! ## 🏗️ Architecture Overview
//!
//! The system is a set of process-wide services wired together by the
//! [`engine::MonitoringEngine`] orchestrator:
//!
//! ### Configuration Cache
//! - **Typed lookups**: by ID, by token, by slug, by parent, by page membership
//! - **Dependency DAG**: every entity is assigned a level so evaluation runs deps-first
//! - **Hot reload**: write-through with rollback, atomic snapshot swap
//!
//! ### Pulse Store
//! - **Ingest validation**: timing derivation, push window, latency cap
//! - **Bounded write buffer**: batched inserts, retain-on-failure, overflow drop
//! - **Recompute queue**: deduplicated set of monitors awaiting re-evaluation
//!
//! ### Status Evaluator
//! - **Rolling uptime**: interval-bucket counting over six reporting periods
//! - **Group composition**: any-up, all-up, and percentage strategies
//! - **Upward cascade**: parent groups recompute after every child change
//!
//! ### Missing-Pulse Detector
//! - **Periodic scan**: all-settled per-monitor checks with miss counters
//! - **Down lifecycle**: down, still-down and recovered transitions
//! - **Resend policy**: consecutive-down gating with dependency suppression
//!
//! ### Aggregation Job
//! - **Hourly and daily roll-up**: idempotent, never reprocesses a bucket
//! - **Single-flight**: overlapping runs are skipped or force-aborted
//! - **Backlog contract**: batch caps leave the remainder for the next run
//!
//! ### Self-Monitor + Backfill
//! - **Storage liveness**: drift-corrected probe of the storage backend
//! - **Backfill**: synthetic pulses for monitors that were healthy during an
//!   outage of the storage layer itself
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulse_sentinel::engine::MonitoringEngine;
//! use pulse_sentinel::pulse_store::PulseRequest;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load the TOML configuration and bring every service up
//!     let engine = MonitoringEngine::from_config_path("./config.toml")?;
//!     engine.start().await?;
//!
//!     // Ingest a pulse exactly the way the transport layer would
//!     let ack = engine
//!         .submit_pulse("monitor-token", PulseRequest::with_latency(42.0))
//!         .await?;
//!     println!("accepted pulse for {}", ack.monitor_id);
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## ⚡ Concurrency Model
//!
//! All subsystems run concurrently on the tokio runtime. Scheduled work
//! (pulse flush, recompute drain, missing-pulse scan, aggregation, the
//! self-monitor probe) runs in dedicated background loops carrying
//! cancellation tokens for graceful shutdown. Shared runtime state
//! (status cache, miss counters, down counters) lives in concurrent maps with
//! per-entry serialization, so a burst of pulses and a detector tick against
//! the same monitor never interleave mutations.
//!
//! ## 🔔 Notification Semantics
//!
//! Delivery is at-least-once with best-effort deduplication via in-memory
//! state. Each provider send is isolated: one sink's failure or timeout never
//! blocks its siblings, and there is no persistent retry queue. During the
//! startup grace window transitions still mutate the status cache but emit no
//! notifications, preventing alert storms on cold start.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Architecture version for compatibility tracking and upgrade management
pub const ARCHITECTURE_VERSION: &str = "1.0.0-core";

// Production hardening modules - operational capabilities shared by every service
pub mod logging; // Structured logging, log categories, subscriber initialization

// Core monitoring modules - the status-and-alerting engine
pub mod aggregation; // Hourly/daily roll-up job with single-flight scheduling
pub mod broadcaster; // Realtime event fan-out keyed by status page and worker token
pub mod config_cache; // Configuration document, typed indexes, dependency DAG, hot reload
pub mod engine; // Orchestrator wiring every service, public operations, lifecycle
pub mod group_state; // Group down-counter state and deferred notification handles
pub mod missing_pulse; // Periodic absence detection and down/still-down/recovered lifecycle
pub mod notification; // Channel configuration, provider sinks, isolated dispatch
pub mod pulse_store; // Ingest validation, bounded write buffer, recompute queue
pub mod self_monitor; // Storage liveness probe and outage backfill
pub mod status_evaluator; // Rolling uptime, group composition, transition outcomes
pub mod storage; // PulseStorage trait and the in-memory reference backend

// Re-export the engine types for convenient access
pub use engine::*;

/// Comprehensive error type covering every subsystem and failure mode
///
/// The variants map one-to-one onto the externally visible failure classes:
/// ingest rejections surface as `BadRequest`/`Unauthorized`, lookup misses as
/// `NotFound`, configuration problems as `ConfigInvalid`, transient backend
/// trouble as `StorageUnavailable`, and notification sink trouble as
/// `ProviderFailure`. `Internal` is reserved for unexpected paths.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum MonitorError {
    /// Input validation failures - malformed timing, out-of-window pulses, bad parameters
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Token authentication failures - unknown push token, wrong page password
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Lookup failures - unknown monitor/group ID or status-page slug
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness violations - duplicate IDs, tokens or slugs in a candidate config
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration load or reload rejections - structural validation, cycles, bad references
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Transient storage backend errors - the self-monitor reflects these as an outage
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Notification sink failures - provider timeouts, rejected sends
    #[error("Provider failure: {0}")]
    ProviderFailure(String),

    /// Unexpected internal conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for all monitoring core operations
///
/// This alias provides a consistent error handling interface across the entire
/// codebase, simplifying error propagation with `?` and keeping every public
/// API on the same failure surface.
pub type Result<T> = std::result::Result<T, MonitorError>;
