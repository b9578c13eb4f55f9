use crate::notify::{BackupEvent, Notifier};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const RECORD_RING_CAP: usize = 1000;
pub const ALERT_RING_CAP: usize = 100;

/// Completions slower than this raise a `slow_backup` alert.
pub const SLOW_BACKUP_SECONDS: f64 = 600.0;
/// Successful artifacts smaller than this raise a `small_backup` alert.
pub const SMALL_BACKUP_BYTES: u64 = 1024;
/// This many failures of one container among the ring's last 10 records
/// raise `repeated_failures`.
pub const REPEATED_FAILURE_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub container_name: String,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub file_size_bytes: u64,
    pub file_path: Option<String>,
    pub status: BackupStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowBackup,
    SmallBackup,
    RepeatedFailures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MonitorSummary {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_duration: f64,
    pub avg_size: f64,
    pub total_data: u64,
    pub active_alerts: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct InFlight {
    engine: String,
    started_at: DateTime<Utc>,
}

/// Thread-safe record of backup outcomes: a bounded ring of records, a
/// bounded ring of alerts, and the currently running backups.
pub struct Monitor {
    in_flight: DashMap<String, InFlight>,
    records: Mutex<VecDeque<BackupRecord>>,
    alerts: Mutex<VecDeque<Alert>>,
    notifier: Option<Arc<Notifier>>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            records: Mutex::new(VecDeque::with_capacity(128)),
            alerts: Mutex::new(VecDeque::with_capacity(16)),
            notifier: None,
        }
    }

    pub fn with_notifier(notifier: Arc<Notifier>) -> Self {
        Self {
            notifier: Some(notifier),
            ..Self::new()
        }
    }

    pub fn start(&self, name: &str, engine: &str) {
        self.in_flight.insert(
            name.to_string(),
            InFlight {
                engine: engine.to_string(),
                started_at: Utc::now(),
            },
        );
        tracing::debug!(container = name, engine, "backup started");
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_names(&self) -> Vec<String> {
        self.in_flight
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub async fn complete(&self, name: &str, path: &Path, size: Option<u64>) {
        let duration = self.take_duration(name);
        let size = size.unwrap_or(0);
        let record = BackupRecord {
            container_name: name.to_string(),
            timestamp: Utc::now(),
            duration_seconds: duration,
            file_size_bytes: size,
            file_path: Some(path.display().to_string()),
            status: BackupStatus::Success,
            error: None,
        };
        self.push_record(record);
        self.raise_completion_alerts(name, duration, size);

        if let Some(notifier) = &self.notifier {
            notifier
                .dispatch(&BackupEvent::Success {
                    container: name.to_string(),
                    path: path.display().to_string(),
                    size_bytes: size,
                    duration_seconds: duration,
                })
                .await;
        }
    }

    pub async fn fail(&self, name: &str, error: &str) {
        let duration = self.take_duration(name);
        let record = BackupRecord {
            container_name: name.to_string(),
            timestamp: Utc::now(),
            duration_seconds: duration,
            file_size_bytes: 0,
            file_path: None,
            status: BackupStatus::Failed,
            error: Some(error.to_string()),
        };
        self.push_record(record);
        self.raise_failure_alerts(name);

        if let Some(notifier) = &self.notifier {
            notifier
                .dispatch(&BackupEvent::Failure {
                    container: name.to_string(),
                    error: error.to_string(),
                })
                .await;
        }
    }

    fn take_duration(&self, name: &str) -> f64 {
        self.in_flight
            .remove(name)
            .map(|(_, entry)| {
                let millis = (Utc::now() - entry.started_at).num_milliseconds().max(0);
                tracing::debug!(container = name, engine = %entry.engine, "backup settled");
                millis as f64 / 1000.0
            })
            .unwrap_or(0.0)
    }

    fn push_record(&self, record: BackupRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == RECORD_RING_CAP {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn raise_completion_alerts(&self, name: &str, duration: f64, size: u64) {
        if duration > SLOW_BACKUP_SECONDS {
            self.raise_alert(
                AlertKind::SlowBackup,
                format!("backup of '{name}' took {duration:.0}s"),
            );
        }
        if size < SMALL_BACKUP_BYTES {
            self.raise_alert(
                AlertKind::SmallBackup,
                format!("backup of '{name}' is only {size} bytes"),
            );
        }
    }

    fn raise_failure_alerts(&self, name: &str) {
        let recent_failures = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records
                .iter()
                .rev()
                .take(10)
                .filter(|record| {
                    record.container_name == name && record.status == BackupStatus::Failed
                })
                .count()
        };
        if recent_failures >= REPEATED_FAILURE_THRESHOLD {
            self.raise_alert(
                AlertKind::RepeatedFailures,
                format!("'{name}' failed {recent_failures} of the last 10 backups"),
            );
        }
    }

    fn raise_alert(&self, kind: AlertKind, message: String) {
        tracing::warn!(kind = ?kind, "{message}");
        let mut alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        if alerts.len() == ALERT_RING_CAP {
            alerts.pop_front();
        }
        alerts.push_back(Alert {
            id: Uuid::new_v4(),
            kind,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn summary(&self) -> MonitorSummary {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let total = records.len() as u64;
        let successful = records
            .iter()
            .filter(|r| r.status == BackupStatus::Success)
            .count() as u64;
        let failed = total - successful;

        let last_100: Vec<_> = records.iter().rev().take(100).collect();
        let success_rate = if last_100.is_empty() {
            0.0
        } else {
            let ok = last_100
                .iter()
                .filter(|r| r.status == BackupStatus::Success)
                .count();
            ok as f64 * 100.0 / last_100.len() as f64
        };

        let (mut duration_sum, mut size_sum) = (0.0, 0u64);
        for record in records.iter().filter(|r| r.status == BackupStatus::Success) {
            duration_sum += record.duration_seconds;
            size_sum += record.file_size_bytes;
        }
        let avg_duration = if successful > 0 {
            duration_sum / successful as f64
        } else {
            0.0
        };
        let avg_size = if successful > 0 {
            size_sum as f64 / successful as f64
        } else {
            0.0
        };

        let active_alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner()).len() as u64;
        MonitorSummary {
            total,
            successful,
            failed,
            success_rate,
            avg_duration,
            avg_size,
            total_data: size_sum,
            active_alerts,
            last_updated: records.back().map(|r| r.timestamp),
        }
    }

    pub fn per_container(&self, name: &str) -> Vec<BackupRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|record| record.container_name == name)
            .cloned()
            .collect()
    }

    pub fn recent(&self, count: usize) -> Vec<BackupRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().rev().take(count).cloned().collect()
    }

    pub fn failures(&self, count: usize) -> Vec<BackupRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .rev()
            .filter(|record| record.status == BackupStatus::Failed)
            .take(count)
            .cloned()
            .collect()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        let alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        alerts.iter().cloned().collect()
    }

    pub fn export(&self, format: ExportFormat) -> String {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match format {
            ExportFormat::Json => {
                serde_json::to_string(&records.iter().collect::<Vec<_>>()).unwrap_or_default()
            }
            ExportFormat::Csv => export_csv(records.iter()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

fn export_csv<'a>(records: impl Iterator<Item = &'a BackupRecord>) -> String {
    let mut out = String::from(
        "container_name,timestamp,duration_seconds,file_size_bytes,file_path,status,error\n",
    );
    for record in records {
        let status = match record.status {
            BackupStatus::Success => "success",
            BackupStatus::Failed => "failed",
        };
        out.push_str(&format!(
            "{},{},{:.3},{},{},{},{}\n",
            csv_field(&record.container_name),
            record.timestamp.to_rfc3339(),
            record.duration_seconds,
            record.file_size_bytes,
            csv_field(record.file_path.as_deref().unwrap_or("")),
            status,
            csv_field(record.error.as_deref().unwrap_or("")),
        ));
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
