use crate::util::config::NotifyConfig;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

const COLOR_GREEN: &str = "36a64f";
const COLOR_RED: &str = "d00000";
const COLOR_ORANGE: &str = "ff9f00";
const COLOR_BLUE: &str = "4387f4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Failure,
    Warning,
    Health,
    Summary,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "backup_success",
            Self::Failure => "backup_failure",
            Self::Warning => "warning",
            Self::Health => "health",
            Self::Summary => "cycle_summary",
        }
    }
}

/// A single notification, carrying whatever the event kind needs.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Success {
        container: String,
        path: String,
        size_bytes: u64,
        duration_seconds: f64,
    },
    Failure {
        container: String,
        error: String,
    },
    Warning {
        container: Option<String>,
        message: String,
    },
    Health {
        healthy: bool,
        message: String,
        directory: Option<String>,
        available_space: Option<u64>,
    },
    Summary {
        total: u64,
        succeeded: u64,
        failed: u64,
        duration_seconds: f64,
        total_bytes: u64,
    },
}

impl BackupEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Success { .. } => EventKind::Success,
            Self::Failure { .. } => EventKind::Failure,
            Self::Warning { .. } => EventKind::Warning,
            Self::Health { .. } => EventKind::Health,
            Self::Summary { .. } => EventKind::Summary,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Warning { .. } => "warning",
            Self::Health { healthy, .. } => {
                if *healthy {
                    "success"
                } else {
                    "failure"
                }
            }
            Self::Summary { failed, .. } => {
                if *failed == 0 {
                    "success"
                } else {
                    "warning"
                }
            }
        }
    }

    pub fn container(&self) -> Option<&str> {
        match self {
            Self::Success { container, .. } | Self::Failure { container, .. } => Some(container),
            Self::Warning { container, .. } => container.as_deref(),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Success {
                container,
                size_bytes,
                duration_seconds,
                ..
            } => format!(
                "Backup of '{container}' finished: {size_bytes} bytes in {duration_seconds:.1}s"
            ),
            Self::Failure { container, error } => {
                format!("Backup of '{container}' failed: {error}")
            }
            Self::Warning { container, message } => match container {
                Some(container) => format!("'{container}': {message}"),
                None => message.clone(),
            },
            Self::Health { message, .. } => message.clone(),
            Self::Summary {
                total,
                succeeded,
                failed,
                duration_seconds,
                ..
            } => format!(
                "Backup cycle finished: {succeeded}/{total} succeeded, {failed} failed in {duration_seconds:.1}s"
            ),
        }
    }

    fn extra_fields(&self) -> Value {
        match self {
            Self::Success {
                path,
                size_bytes,
                duration_seconds,
                ..
            } => json!({
                "path": path,
                "size_bytes": size_bytes,
                "duration_seconds": duration_seconds,
            }),
            Self::Failure { error, .. } => json!({ "error": error }),
            Self::Warning { .. } => json!({}),
            Self::Health {
                directory,
                available_space,
                ..
            } => json!({
                "directory": directory,
                "available_space": available_space,
            }),
            Self::Summary {
                total,
                succeeded,
                failed,
                duration_seconds,
                total_bytes,
            } => json!({
                "total": total,
                "succeeded": succeeded,
                "failed": failed,
                "duration_seconds": duration_seconds,
                "total_bytes": total_bytes,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Log,
    Webhook,
    Slack,
    Discord,
    Teams,
    Email,
}

impl Channel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "log" => Some(Self::Log),
            "webhook" => Some(Self::Webhook),
            "slack" => Some(Self::Slack),
            "discord" => Some(Self::Discord),
            "teams" => Some(Self::Teams),
            "email" => Some(Self::Email),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Webhook => "webhook",
            Self::Slack => "slack",
            Self::Discord => "discord",
            Self::Teams => "teams",
            Self::Email => "email",
        }
    }
}

/// Best-effort fan-out. A failing channel logs an error and never stops the
/// others; nothing here is allowed to fail a backup.
pub struct Notifier {
    channels: Vec<Channel>,
    config: NotifyConfig,
    client: reqwest::Client,
}

impl Notifier {
    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut channels = Vec::new();
        for name in &config.channels {
            match Channel::parse(name) {
                Some(channel) if !channels.contains(&channel) => channels.push(channel),
                Some(_) => {}
                None => tracing::warn!(channel = %name, "unknown notification channel ignored"),
            }
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            channels,
            config: config.clone(),
            client,
        }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    fn gate_open(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Success => self.config.on_success,
            EventKind::Failure => self.config.on_failure,
            EventKind::Warning => self.config.on_warning,
            EventKind::Health => self.config.on_health,
            EventKind::Summary => self.config.on_summary,
        }
    }

    pub async fn dispatch(&self, event: &BackupEvent) {
        if self.channels.is_empty() || !self.gate_open(event.kind()) {
            return;
        }
        for channel in &self.channels {
            if let Err(err) = self.dispatch_channel(*channel, event).await {
                tracing::error!(
                    channel = channel.as_str(),
                    event = event.kind().as_str(),
                    error = %err,
                    "notification dispatch failed"
                );
            }
        }
    }

    async fn dispatch_channel(&self, channel: Channel, event: &BackupEvent) -> Result<(), String> {
        match channel {
            Channel::Log => {
                dispatch_log(event);
                Ok(())
            }
            Channel::Email => {
                tracing::info!(
                    event = event.kind().as_str(),
                    "email channel has no transport configured, skipping"
                );
                Ok(())
            }
            Channel::Webhook => {
                let url = self.require_url(channel, self.config.webhook_url.as_deref())?;
                self.post_json(url, &generic_payload(event)).await
            }
            Channel::Slack => {
                let url = self.require_url(channel, self.config.slack_webhook_url.as_deref())?;
                self.post_json(url, &slack_payload(event)).await
            }
            Channel::Discord => {
                let url = self.require_url(channel, self.config.discord_webhook_url.as_deref())?;
                self.post_json(url, &discord_payload(event)).await
            }
            Channel::Teams => {
                let url = self.require_url(channel, self.config.teams_webhook_url.as_deref())?;
                self.post_json(url, &teams_payload(event)).await
            }
        }
    }

    fn require_url<'a>(&self, channel: Channel, url: Option<&'a str>) -> Result<&'a str, String> {
        url.ok_or_else(|| format!("channel '{}' is enabled but has no webhook URL", channel.as_str()))
    }

    async fn post_json(&self, url: &str, payload: &Value) -> Result<(), String> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|err| format!("post failed: {err}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("endpoint returned status {status}"));
        }
        Ok(())
    }
}

fn dispatch_log(event: &BackupEvent) {
    let message = event.message();
    match event.status() {
        "failure" => tracing::error!(event = event.kind().as_str(), "{message}"),
        "warning" => tracing::warn!(event = event.kind().as_str(), "{message}"),
        _ => tracing::info!(event = event.kind().as_str(), "{message}"),
    }
}

fn status_color(status: &str) -> &'static str {
    match status {
        "success" => COLOR_GREEN,
        "failure" | "error" => COLOR_RED,
        "warning" => COLOR_ORANGE,
        _ => COLOR_BLUE,
    }
}

pub fn generic_payload(event: &BackupEvent) -> Value {
    let mut payload = json!({
        "event": event.kind().as_str(),
        "status": event.status(),
        "timestamp": Utc::now().to_rfc3339(),
        "message": event.message(),
    });
    if let Some(container) = event.container() {
        payload["container"] = json!(container);
    }
    if let (Value::Object(base), Value::Object(extra)) = (&mut payload, event.extra_fields()) {
        for (key, value) in extra {
            base.insert(key, value);
        }
    }
    payload
}

pub fn slack_payload(event: &BackupEvent) -> Value {
    json!({
        "attachments": [{
            "color": format!("#{}", status_color(event.status())),
            "title": format!("Baktainer: {}", event.kind().as_str()),
            "text": event.message(),
            "ts": Utc::now().timestamp(),
        }]
    })
}

pub fn discord_payload(event: &BackupEvent) -> Value {
    let color = u32::from_str_radix(status_color(event.status()), 16).unwrap_or(0);
    json!({
        "embeds": [{
            "title": format!("Baktainer: {}", event.kind().as_str()),
            "description": event.message(),
            "color": color,
            "timestamp": Utc::now().to_rfc3339(),
        }]
    })
}

pub fn teams_payload(event: &BackupEvent) -> Value {
    json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        "themeColor": status_color(event.status()),
        "summary": format!("Baktainer: {}", event.kind().as_str()),
        "sections": [{
            "activityTitle": format!("Baktainer: {}", event.kind().as_str()),
            "text": event.message(),
        }]
    })
}
