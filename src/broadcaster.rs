//! # Realtime Broadcaster - Event Fan-Out to Live Subscribers
//!
//! Maintains subscriptions keyed by status-page slug (public viewers) and by
//! probe-worker token (configuration push). Pulse and status-transition
//! events are published as JSON envelopes `{action, ..., timestamp}` to every
//! subscriber whose page contains the affected monitor, using the reverse
//! index maintained by the configuration cache.
//!
//! Password-protected pages require the password at subscribe time; the
//! transport layer holds the returned receiver for the lifetime of the
//! connection and drops it to unsubscribe. Channels with no remaining
//! receivers are reclaimed lazily on publish.

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::config_cache::ConfigSnapshot;
use crate::logging::{log_debug, LogCategory};
use crate::{MonitorError, Result};

/// Per-channel buffered event capacity
const CHANNEL_CAPACITY: usize = 256;

/// The realtime fan-out service
pub struct RealtimeBroadcaster {
    pages: DashMap<String, broadcast::Sender<Value>>,
    workers: DashMap<String, broadcast::Sender<Value>>,
}

impl RealtimeBroadcaster {
    pub fn new() -> Self {
        Self {
            pages: DashMap::new(),
            workers: DashMap::new(),
        }
    }

    /// Subscribe a viewer to a status page
    ///
    /// Fails with `NotFound` for an unknown slug and `Unauthorized` when the
    /// page is password-protected and the supplied password does not match.
    pub fn subscribe_page(
        &self,
        snapshot: &ConfigSnapshot,
        slug: &str,
        password: Option<&str>,
    ) -> Result<broadcast::Receiver<Value>> {
        let page = snapshot
            .page_by_slug(slug)
            .ok_or_else(|| MonitorError::NotFound(format!("status page '{slug}'")))?;

        if let Some(required) = &page.password {
            if password != Some(required.as_str()) {
                return Err(MonitorError::Unauthorized(format!(
                    "wrong password for status page '{slug}'"
                )));
            }
        }

        let sender = self
            .pages
            .entry(slug.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        counter!("pulse_sentinel_page_subscriptions_total", 1);
        Ok(sender.subscribe())
    }

    /// Subscribe a probe worker by its monitor token
    pub fn subscribe_worker(
        &self,
        snapshot: &ConfigSnapshot,
        token: &str,
    ) -> Result<broadcast::Receiver<Value>> {
        if snapshot.monitor_by_token(token).is_none() {
            return Err(MonitorError::Unauthorized("unknown worker token".to_string()));
        }
        let sender = self
            .workers
            .entry(token.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        counter!("pulse_sentinel_worker_subscriptions_total", 1);
        Ok(sender.subscribe())
    }

    /// Publish a pulse event to every page showing the monitor
    pub fn publish_pulse(&self, snapshot: &ConfigSnapshot, monitor_id: &str, payload: Value) {
        let envelope = envelope("pulse", payload);
        for slug in snapshot.pages_containing_monitor(monitor_id) {
            self.send_to_page(slug, envelope.clone());
        }
    }

    /// Publish a status event for a monitor or group
    ///
    /// Monitor events route through the reverse index; group events route to
    /// pages listing the group itself plus every page showing one of its
    /// monitors.
    pub fn publish_status(&self, snapshot: &ConfigSnapshot, entity_id: &str, payload: Value) {
        let envelope = envelope("status", payload);

        if snapshot.monitor_by_id(entity_id).is_some() {
            for slug in snapshot.pages_containing_monitor(entity_id) {
                self.send_to_page(slug, envelope.clone());
            }
            return;
        }

        for page in snapshot.status_pages() {
            if page.items.iter().any(|item| item == entity_id) {
                self.send_to_page(&page.slug, envelope.clone());
            }
        }
    }

    /// Push a configuration-changed signal to every subscriber
    ///
    /// Probe workers re-read their assignment on this signal; page viewers
    /// re-render.
    pub fn publish_config_update(&self, snapshot: &ConfigSnapshot) {
        let envelope = envelope("config", json!({}));

        self.workers.retain(|token, sender| {
            if snapshot.monitor_by_token(token).is_none() {
                // Token vanished from the configuration, drop the channel
                return false;
            }
            let _ = sender.send(envelope.clone());
            sender.receiver_count() > 0
        });

        self.pages.retain(|slug, sender| {
            if snapshot.page_by_slug(slug).is_none() {
                return false;
            }
            let _ = sender.send(envelope.clone());
            sender.receiver_count() > 0
        });
    }

    /// Current live subscriber count for a page
    pub fn page_subscriber_count(&self, slug: &str) -> usize {
        self.pages
            .get(slug)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn send_to_page(&self, slug: &str, envelope: Value) {
        let mut stale = false;
        if let Some(sender) = self.pages.get(slug) {
            if sender.send(envelope).is_err() {
                stale = true;
            }
        }
        if stale {
            // No receivers are left; reclaim the channel
            self.pages.remove(slug);
            log_debug(
                LogCategory::Realtime,
                &format!("reclaimed idle page channel '{slug}'"),
            );
        }
    }
}

impl Default for RealtimeBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a payload in the wire envelope
fn envelope(action: &str, payload: Value) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    object.insert("action".to_string(), json!(action));
    object.insert("timestamp".to_string(), json!(Utc::now().timestamp_millis()));
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_cache::{ConfigDocument, MonitorConfig, StatusPageConfig};

    fn snapshot() -> ConfigSnapshot {
        ConfigSnapshot::build(ConfigDocument {
            monitors: vec![MonitorConfig {
                id: "api".to_string(),
                token: "tok-api".to_string(),
                name: "API".to_string(),
                interval: 30,
                max_retries: 3,
                tolerance_factor: 1.5,
                resend_notification: 0,
                group_id: None,
                notification_channels: Vec::new(),
                custom_metrics: Vec::new(),
                dependencies: Vec::new(),
            }],
            status_pages: vec![
                StatusPageConfig {
                    slug: "public".to_string(),
                    name: "Public".to_string(),
                    items: vec!["api".to_string()],
                    password: None,
                },
                StatusPageConfig {
                    slug: "internal".to_string(),
                    name: "Internal".to_string(),
                    items: vec![],
                    password: Some("s3cret".to_string()),
                },
            ],
            ..ConfigDocument::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_pulse_routed_to_subscribed_page() {
        let snap = snapshot();
        let broadcaster = RealtimeBroadcaster::new();
        let mut receiver = broadcaster.subscribe_page(&snap, "public", None).unwrap();

        broadcaster.publish_pulse(&snap, "api", json!({"monitorId": "api", "latency": 12.0}));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event["action"], "pulse");
        assert_eq!(event["monitorId"], "api");
        assert!(event["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_pulse_not_routed_to_unrelated_page() {
        let snap = snapshot();
        let broadcaster = RealtimeBroadcaster::new();
        let mut receiver = broadcaster
            .subscribe_page(&snap, "internal", Some("s3cret"))
            .unwrap();

        broadcaster.publish_pulse(&snap, "api", json!({"monitorId": "api"}));

        assert!(
            receiver.try_recv().is_err(),
            "internal page does not show the monitor"
        );
    }

    #[test]
    fn test_unknown_slug_and_wrong_password() {
        let snap = snapshot();
        let broadcaster = RealtimeBroadcaster::new();

        assert!(matches!(
            broadcaster.subscribe_page(&snap, "ghost", None),
            Err(MonitorError::NotFound(_))
        ));
        assert!(matches!(
            broadcaster.subscribe_page(&snap, "internal", Some("wrong")),
            Err(MonitorError::Unauthorized(_))
        ));
        assert!(matches!(
            broadcaster.subscribe_page(&snap, "internal", None),
            Err(MonitorError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_subscription_and_config_push() {
        let snap = snapshot();
        let broadcaster = RealtimeBroadcaster::new();

        assert!(matches!(
            broadcaster.subscribe_worker(&snap, "bad-token"),
            Err(MonitorError::Unauthorized(_))
        ));

        let mut receiver = broadcaster.subscribe_worker(&snap, "tok-api").unwrap();
        broadcaster.publish_config_update(&snap);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event["action"], "config");
    }

    #[tokio::test]
    async fn test_idle_channel_reclaimed() {
        let snap = snapshot();
        let broadcaster = RealtimeBroadcaster::new();

        let receiver = broadcaster.subscribe_page(&snap, "public", None).unwrap();
        assert_eq!(broadcaster.page_subscriber_count("public"), 1);
        drop(receiver);

        broadcaster.publish_pulse(&snap, "api", json!({}));
        assert_eq!(broadcaster.page_subscriber_count("public"), 0);
        assert!(!broadcaster.pages.contains_key("public"));
    }
}
