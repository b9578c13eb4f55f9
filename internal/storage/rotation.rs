use crate::util::config::RotationConfig;
use crate::util::volume::SpaceProbe;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;

/// One parsed artifact on disk. `.tmp` and `.meta` shadows never make it
/// into a scan, which is what lets rotation run concurrently with backups.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub container: String,
    pub timestamp: u64,
    pub modified: SystemTime,
    pub size: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RotationResult {
    pub deleted_count: u64,
    pub deleted_size: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerStats {
    pub container: String,
    pub count: u64,
    pub total_size: u64,
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DateStats {
    pub date: String,
    pub count: u64,
    pub total_size: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RotationStatistics {
    pub total_count: u64,
    pub total_size: u64,
    pub per_container: Vec<ContainerStats>,
    pub per_date: Vec<DateStats>,
}

/// Applies the retention policy to the artifact tree after every cycle.
/// Passes run in order: age, count, free space, then an empty-dir sweep.
/// Individual failures are counted, never raised.
pub struct Rotation {
    backup_dir: PathBuf,
    config: RotationConfig,
    probe: Arc<dyn SpaceProbe>,
}

impl Rotation {
    pub fn new(backup_dir: PathBuf, config: RotationConfig, probe: Arc<dyn SpaceProbe>) -> Self {
        Self {
            backup_dir,
            config,
            probe,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn run(&self) -> RotationResult {
        let mut result = RotationResult::default();
        let mut artifacts = self.scan().await;

        self.age_pass(&mut artifacts, &mut result).await;
        self.count_pass(&mut artifacts, &mut result).await;
        self.free_space_pass(&mut artifacts, &mut result).await;
        self.sweep_empty_dirs().await;

        if result.deleted_count > 0 || !result.errors.is_empty() {
            tracing::info!(
                deleted = result.deleted_count,
                freed_bytes = result.deleted_size,
                errors = result.errors.len(),
                "rotation finished"
            );
        }
        result
    }

    async fn age_pass(&self, artifacts: &mut Vec<Artifact>, result: &mut RotationResult) {
        if self.config.retention_days == 0 {
            return;
        }
        let cutoff = SystemTime::now()
            - Duration::from_secs(u64::from(self.config.retention_days) * 86_400);
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(artifacts)
            .into_iter()
            .partition(|artifact| artifact.modified < cutoff);
        *artifacts = kept;
        for artifact in expired {
            self.delete_artifact(&artifact, result).await;
        }
    }

    async fn count_pass(&self, artifacts: &mut Vec<Artifact>, result: &mut RotationResult) {
        if self.config.retention_count == 0 {
            return;
        }
        let keep = self.config.retention_count as usize;
        let mut by_container: BTreeMap<String, Vec<Artifact>> = BTreeMap::new();
        for artifact in std::mem::take(artifacts) {
            by_container
                .entry(artifact.container.clone())
                .or_default()
                .push(artifact);
        }
        for (_, mut group) in by_container {
            group.sort_by(|a, b| b.modified.cmp(&a.modified));
            let excess = if group.len() > keep {
                group.split_off(keep)
            } else {
                Vec::new()
            };
            artifacts.extend(group);
            for artifact in excess {
                self.delete_artifact(&artifact, result).await;
            }
        }
    }

    async fn free_space_pass(&self, artifacts: &mut Vec<Artifact>, result: &mut RotationResult) {
        if self.config.min_free_space_gb == 0 {
            return;
        }
        let floor = self.config.min_free_space_gb * (1 << 30);
        let Some(free) = self.probe.free_space(&self.backup_dir) else {
            tracing::warn!(
                path = %self.backup_dir.display(),
                "free-space probe failed, skipping the free-space pass"
            );
            return;
        };
        if free >= floor {
            return;
        }
        let mut deficit = floor - free;
        artifacts.sort_by(|a, b| a.modified.cmp(&b.modified));
        while deficit > 0 {
            if artifacts.is_empty() {
                break;
            }
            let artifact = artifacts.remove(0);
            deficit = deficit.saturating_sub(artifact.size);
            self.delete_artifact(&artifact, result).await;
        }
    }

    async fn sweep_empty_dirs(&self) {
        let Ok(mut entries) = fs::read_dir(&self.backup_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_date_dir(&name) {
                continue;
            }
            let path = entry.path();
            if dir_is_empty(&path).await {
                if let Err(err) = fs::remove_dir(&path).await {
                    tracing::warn!(path = %path.display(), error = %err, "empty date dir sweep failed");
                } else {
                    tracing::debug!(path = %path.display(), "removed empty date dir");
                }
            }
        }
    }

    async fn delete_artifact(&self, artifact: &Artifact, result: &mut RotationResult) {
        match fs::remove_file(&artifact.path).await {
            Ok(()) => {
                result.deleted_count += 1;
                result.deleted_size += artifact.size;
                tracing::debug!(
                    path = %artifact.path.display(),
                    container = %artifact.container,
                    "rotated out backup artifact"
                );
            }
            Err(err) => {
                result
                    .errors
                    .push(format!("delete {} failed: {err}", artifact.path.display()));
                return;
            }
        }
        for shadow in [".meta", ".enc.meta"] {
            let mut os_string = artifact.path.as_os_str().to_owned();
            os_string.push(shadow);
            let shadow_path = PathBuf::from(os_string);
            match fs::remove_file(&shadow_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => result
                    .errors
                    .push(format!("delete {} failed: {err}", shadow_path.display())),
            }
        }
    }

    /// Enumerate every artifact under `<backup_dir>/<YYYY-MM-DD>/`.
    pub async fn scan(&self) -> Vec<Artifact> {
        let mut artifacts = Vec::new();
        let Ok(mut dirs) = fs::read_dir(&self.backup_dir).await else {
            return artifacts;
        };
        while let Ok(Some(dir_entry)) = dirs.next_entry().await {
            let dir_name = dir_entry.file_name().to_string_lossy().into_owned();
            if !is_date_dir(&dir_name) {
                continue;
            }
            self.scan_date_dir(&dir_entry.path(), &mut artifacts).await;
        }
        artifacts
    }

    async fn scan_date_dir(&self, dir: &Path, artifacts: &mut Vec<Artifact>) {
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((container, timestamp)) = parse_artifact_name(&name) else {
                continue;
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            artifacts.push(Artifact {
                path: entry.path(),
                container,
                timestamp,
                modified,
                size: metadata.len(),
            });
        }
    }

    /// Per-container and per-date aggregates for the status surface.
    pub async fn statistics(&self) -> RotationStatistics {
        let artifacts = self.scan().await;
        let mut stats = RotationStatistics {
            total_count: artifacts.len() as u64,
            ..Default::default()
        };
        let mut containers: BTreeMap<String, ContainerStats> = BTreeMap::new();
        let mut dates: BTreeMap<String, DateStats> = BTreeMap::new();
        for artifact in &artifacts {
            stats.total_size += artifact.size;
            let entry = containers
                .entry(artifact.container.clone())
                .or_insert_with(|| ContainerStats {
                    container: artifact.container.clone(),
                    count: 0,
                    total_size: 0,
                    oldest: None,
                    newest: None,
                });
            entry.count += 1;
            entry.total_size += artifact.size;
            entry.oldest = Some(entry.oldest.map_or(artifact.timestamp, |v| v.min(artifact.timestamp)));
            entry.newest = Some(entry.newest.map_or(artifact.timestamp, |v| v.max(artifact.timestamp)));

            let date = artifact
                .path
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let date_entry = dates.entry(date.clone()).or_insert_with(|| DateStats {
                date,
                count: 0,
                total_size: 0,
            });
            date_entry.count += 1;
            date_entry.total_size += artifact.size;
        }
        stats.per_container = containers.into_values().collect();
        stats.per_date = dates.into_values().collect();
        stats
    }
}

async fn dir_is_empty(path: &Path) -> bool {
    match fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

pub fn is_date_dir(name: &str) -> bool {
    NaiveDate::parse_from_str(name, "%Y-%m-%d").is_ok() && name.len() == 10
}

/// `<container>-<10-digit unix ts>.sql[.gz][.encrypted]` → (container, ts).
pub fn parse_artifact_name(name: &str) -> Option<(String, u64)> {
    if name.starts_with('.') {
        return None;
    }
    let stem = name.strip_suffix(".encrypted").unwrap_or(name);
    let stem = stem
        .strip_suffix(".sql.gz")
        .or_else(|| stem.strip_suffix(".sql"))?;
    let (container, timestamp) = stem.rsplit_once('-')?;
    if container.is_empty() || timestamp.len() != 10 {
        return None;
    }
    let timestamp: u64 = timestamp.parse().ok()?;
    Some((container.to_string(), timestamp))
}
