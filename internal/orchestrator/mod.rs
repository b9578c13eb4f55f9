use crate::docker::{Container, ContainerRuntime, StderrBuffer};
use crate::error::{Error, Result};
use crate::labels::{self, BackupLabels, LabelVerdict};
use crate::monitor::Monitor;
use crate::notify::{BackupEvent, Notifier};
use crate::storage::encryption::Encryptor;
use crate::storage::fileops::{self, SidecarMetadata};
use crate::strategy::{sniff_matches, DumpOptions, StrategyRegistry};
use crate::util::config::Config;
use crate::util::volume::SpaceProbe;
use chrono::{Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Exponential backoff for retryable pipeline failures: 1s, 2s, 4s.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Everything a worker needs to run one container's pipeline.
pub struct BackupContext {
    pub config: Arc<Config>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub registry: Arc<StrategyRegistry>,
    pub monitor: Arc<Monitor>,
    pub notifier: Arc<Notifier>,
    pub encryptor: Option<Encryptor>,
    pub probe: Arc<dyn SpaceProbe>,
    pub retry: RetryPolicy,
}

/// Gate a candidate before any work happens. All failures are bundled into
/// one message so operators see the full list at once.
pub fn validate_candidate(
    container: &Container,
    verdict: Option<&LabelVerdict>,
    registry: &StrategyRegistry,
) -> Result<BackupLabels> {
    let mut failures = Vec::new();
    if !container.state.is_running() {
        failures.push(format!(
            "container is {}, backups need a running container",
            container.state.as_str()
        ));
    }
    if container.labels.is_empty() {
        failures.push("container has no labels".to_string());
    }

    let normalized = match verdict {
        Some(verdict) => {
            if !verdict.valid {
                failures.extend(verdict.errors.iter().cloned());
            }
            verdict.normalized.clone()
        }
        None => legacy_validate(container, registry, &mut failures),
    };

    if !failures.is_empty() {
        return Err(Error::Validation(failures.join("; ")));
    }
    normalized.ok_or_else(|| Error::Validation("labels did not normalize".into()))
}

/// Minimal pre-schema checks, kept for callers that bypass the label table.
fn legacy_validate(
    container: &Container,
    registry: &StrategyRegistry,
    failures: &mut Vec<String>,
) -> Option<BackupLabels> {
    if !labels::backup_enabled(&container.labels) {
        failures.push("baktainer.backup is not true".to_string());
        return None;
    }
    let Some(engine) = container
        .labels
        .get(labels::LABEL_ENGINE)
        .map(|value| value.trim().to_ascii_lowercase())
    else {
        failures.push("baktainer.db.engine is not set".to_string());
        return None;
    };
    if !registry.supports(&engine) {
        failures.push(format!("engine '{engine}' is not supported"));
        return None;
    }
    let get = |key: &str| {
        container
            .labels
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let user = get(labels::LABEL_DB_USER);
    let password = get(labels::LABEL_DB_PASSWORD);
    if engine != "sqlite" {
        if user.is_none() {
            failures.push("baktainer.db.user is not set".to_string());
        }
        if password.is_none() {
            failures.push("baktainer.db.password is not set".to_string());
        }
    }
    Some(BackupLabels {
        engine,
        database: get(labels::LABEL_DB_NAME).unwrap_or_default(),
        user,
        password,
        backup_name: get(labels::LABEL_NAME),
        all_databases: container
            .labels
            .get(labels::LABEL_DB_ALL)
            .and_then(|value| crate::util::config::parse_bool_value(value))
            .unwrap_or(false),
        compress: None,
        encrypt: None,
        retention_days: None,
        retention_count: None,
        priority: Default::default(),
    })
}

struct AttemptOutcome {
    path: PathBuf,
    size: u64,
}

/// The per-container pipeline, wrapped in the retry policy. Validation and
/// security failures terminate immediately; transport and disk failures are
/// retried with backoff. The monitor sees exactly one outcome either way.
pub async fn backup_container(ctx: &BackupContext, container: &Container) -> Result<PathBuf> {
    let verdict = labels::validate(&container.labels, ctx.encryptor.is_some());
    for warning in &verdict.warnings {
        tracing::warn!(container = %container.name, "{warning}");
        ctx.notifier
            .dispatch(&BackupEvent::Warning {
                container: Some(container.name.clone()),
                message: warning.clone(),
            })
            .await;
    }

    let labels = match validate_candidate(container, Some(&verdict), &ctx.registry) {
        Ok(labels) => labels,
        Err(err) => {
            ctx.monitor.fail(&container.name, &err.to_string()).await;
            return Err(err);
        }
    };
    let backup_name = labels
        .backup_name
        .clone()
        .unwrap_or_else(|| container.name.clone());
    ctx.monitor.start(&backup_name, &labels.engine);

    let mut attempt = 0u32;
    let result = loop {
        match attempt_backup(ctx, container, &labels, &backup_name).await {
            Ok(outcome) => break Ok(outcome),
            Err(err) if err.is_retryable() && attempt + 1 < ctx.retry.max_attempts => {
                let delay = ctx.retry.delay(attempt);
                attempt += 1;
                tracing::warn!(
                    container = %container.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "backup attempt failed, retrying"
                );
                sleep(delay).await;
            }
            Err(err) => break Err(err),
        }
    };

    match result {
        Ok(outcome) => {
            tracing::info!(
                container = %container.name,
                path = %outcome.path.display(),
                size = outcome.size,
                "backup published"
            );
            ctx.monitor
                .complete(&backup_name, &outcome.path, Some(outcome.size))
                .await;
            Ok(outcome.path)
        }
        Err(err) => {
            tracing::error!(container = %container.name, error = %err, "backup failed");
            ctx.monitor.fail(&backup_name, &err.to_string()).await;
            Err(err)
        }
    }
}

async fn attempt_backup(
    ctx: &BackupContext,
    container: &Container,
    labels: &BackupLabels,
    backup_name: &str,
) -> Result<AttemptOutcome> {
    let date_dir = ctx
        .config
        .backup_dir
        .join(Local::now().format("%Y-%m-%d").to_string());
    fileops::create_backup_dir(&date_dir, ctx.probe.as_ref()).await?;

    let unix_ts = Utc::now().timestamp();
    let base = format!("{backup_name}-{unix_ts}");
    let compress = labels.compress.unwrap_or(ctx.config.compress);
    let result = run_pipeline(ctx, container, labels, backup_name, &date_dir, &base, compress).await;
    if result.is_err() {
        cleanup_attempt(&date_dir, &base).await;
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    ctx: &BackupContext,
    container: &Container,
    labels: &BackupLabels,
    backup_name: &str,
    date_dir: &Path,
    base: &str,
    compress: bool,
) -> Result<AttemptOutcome> {
    let strategy = ctx.registry.lookup(&labels.engine)?;
    let command = strategy.command(&DumpOptions::from_labels(labels))?;

    let temp = date_dir.join(format!(".{base}.sql.tmp"));
    let final_path = if compress {
        date_dir.join(format!("{base}.sql.gz"))
    } else {
        date_dir.join(format!("{base}.sql"))
    };

    let mut stderr = StderrBuffer::new(&container.name);
    let mut file = fileops::create_temp_file(&temp).await?;
    let exec_result = ctx
        .runtime
        .exec(&container.id, &command, &mut file, &mut stderr)
        .await;
    if exec_result.is_ok() {
        fileops::sync_file(&mut file).await?;
    }
    drop(file);
    exec_result?;
    if !stderr.is_empty() {
        tracing::debug!(container = %container.name, stderr = %stderr.tail(), "dump wrote to stderr");
    }

    fileops::verify_created(&temp).await?;

    if compress {
        fileops::compress(&temp, &final_path).await?;
    } else {
        fileops::rename(&temp, &final_path).await?;
    }

    // advisory content check on the readable artifact, before encryption
    let head = fileops::read_dump_head(&final_path, 5).await;
    if !sniff_matches(&head, strategy.sniff_tokens()) {
        let message = format!(
            "dump of '{}' does not look like {} output",
            container.name,
            labels.engine
        );
        tracing::warn!(container = %container.name, "{message}");
        ctx.notifier
            .dispatch(&BackupEvent::Warning {
                container: Some(container.name.clone()),
                message,
            })
            .await;
    }

    let encrypt = labels.encrypt.unwrap_or(ctx.config.encryption.enabled);
    let published = if encrypt {
        let Some(encryptor) = &ctx.encryptor else {
            return Err(Error::Encryption(
                "encryption requested but no key is configured".into(),
            ));
        };
        encryptor.encrypt_file(&final_path).await?
    } else {
        final_path.clone()
    };

    let check = fileops::verify_integrity(&published).await?;

    let sidecar = SidecarMetadata {
        timestamp: Utc::now(),
        container_name: backup_name.to_string(),
        engine: labels.engine.clone(),
        database: labels.database.clone(),
        file_size: check.size,
        checksum: check.checksum.clone(),
        backup_file: published
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        compressed: compress,
        compression_type: compress.then(|| "gzip".to_string()),
    };
    if let Err(err) = fileops::write_metadata(&published, &sidecar).await {
        tracing::warn!(container = %container.name, error = %err, "sidecar write failed");
    }

    Ok(AttemptOutcome {
        path: published,
        size: check.size,
    })
}

/// One cleanup pass over everything an attempt may have left behind.
async fn cleanup_attempt(date_dir: &Path, base: &str) {
    let mut leftovers = Vec::new();
    for name in [
        format!(".{base}.sql.tmp"),
        format!("{base}.sql"),
        format!("{base}.sql.gz"),
        format!("{base}.sql.encrypted"),
        format!("{base}.sql.gz.encrypted"),
    ] {
        let path = date_dir.join(&name);
        for shadow in ["", ".meta", ".enc.meta"] {
            let mut os_string = path.as_os_str().to_owned();
            os_string.push(shadow);
            leftovers.push(PathBuf::from(os_string));
        }
    }
    fileops::cleanup(&leftovers).await;
}

#[cfg(test)]
mod tests {
    use super::{backup_container, validate_candidate, BackupContext, RetryPolicy};
    use crate::docker::{Container, ContainerState};
    use crate::error::Error;
    use crate::labels;
    use crate::monitor::Monitor;
    use crate::notify::Notifier;
    use crate::storage::encryption::Encryptor;
    use crate::strategy::StrategyRegistry;
    use crate::test_support::{base_config, MockRuntime};
    use crate::util::volume::SpaceProbe;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::time::Duration;
    use uuid::Uuid;

    struct PlentyProbe;

    impl SpaceProbe for PlentyProbe {
        fn free_space(&self, _path: &Path) -> Option<u64> {
            Some(u64::MAX)
        }

        fn capacity(&self, _path: &Path) -> Option<u64> {
            Some(u64::MAX)
        }
    }

    fn postgres_container(name: &str) -> Container {
        let mut labels = HashMap::new();
        labels.insert("baktainer.backup".to_string(), "true".to_string());
        labels.insert("baktainer.db.engine".to_string(), "postgres".to_string());
        labels.insert("baktainer.db.name".to_string(), "appdb".to_string());
        labels.insert("baktainer.db.user".to_string(), "postgres".to_string());
        labels.insert("baktainer.db.password".to_string(), "pw".to_string());
        Container {
            id: format!("{name}-0123456789abcdef"),
            name: name.to_string(),
            labels,
            state: ContainerState::Running,
        }
    }

    fn context(runtime: Arc<MockRuntime>, compress: bool) -> (BackupContext, PathBuf) {
        let backup_dir = std::env::temp_dir().join(format!("bt-orch-{}", Uuid::new_v4()));
        let mut config = base_config();
        config.backup_dir = backup_dir.clone();
        config.compress = compress;
        let notifier = Arc::new(Notifier::from_config(&config.notify));
        let ctx = BackupContext {
            config: Arc::new(config),
            runtime,
            registry: Arc::new(StrategyRegistry::with_builtin()),
            monitor: Arc::new(Monitor::new()),
            notifier,
            encryptor: None,
            probe: Arc::new(PlentyProbe),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        };
        (ctx, backup_dir)
    }

    fn date_dir(backup_dir: &Path) -> PathBuf {
        backup_dir.join(chrono::Local::now().format("%Y-%m-%d").to_string())
    }

    fn leftover_artifacts(dir: &Path) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| name.contains(".sql"))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_publishes_compressed_artifact_with_sidecar() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        let (ctx, backup_dir) = context(runtime.clone(), true);
        let container = postgres_container("myapp");

        let published = backup_container(&ctx, &container).await.expect("backup");
        assert!(published.to_string_lossy().ends_with(".sql.gz"));
        assert!(published.starts_with(date_dir(&backup_dir)));
        assert!(published.exists());

        let sidecar = std::fs::read_to_string(format!("{}.meta", published.display())).expect("sidecar");
        let parsed: crate::storage::fileops::SidecarMetadata =
            serde_json::from_str(&sidecar).expect("parse");
        assert_eq!(parsed.container_name, "myapp");
        assert_eq!(parsed.engine, "postgres");
        assert_eq!(parsed.database, "appdb");
        assert!(parsed.compressed);
        assert_eq!(parsed.compression_type.as_deref(), Some("gzip"));

        let summary = ctx.monitor.summary();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.success_rate, 100.0);
        assert_eq!(runtime.exec_call_count(), 1);
    }

    #[tokio::test]
    async fn uncompressed_artifact_keeps_plain_extension() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        let (ctx, _backup_dir) = context(runtime, false);
        let container = postgres_container("plain");

        let published = backup_container(&ctx, &container).await.expect("backup");
        assert!(published.to_string_lossy().ends_with(".sql"));
        let body = std::fs::read_to_string(&published).expect("read");
        assert!(body.contains("PostgreSQL database dump"));
    }

    #[tokio::test]
    async fn compress_label_overrides_global_setting() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        let (ctx, _backup_dir) = context(runtime, true);
        let mut container = postgres_container("override");
        container
            .labels
            .insert("baktainer.backup.compress".to_string(), "false".to_string());

        let published = backup_container(&ctx, &container).await.expect("backup");
        assert!(published.to_string_lossy().ends_with(".sql"));
    }

    #[tokio::test]
    async fn stopped_container_fails_validation_without_exec() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        let (ctx, _backup_dir) = context(runtime.clone(), true);
        let mut container = postgres_container("stopped");
        container.state = ContainerState::Stopped;

        let err = backup_container(&ctx, &container).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(runtime.exec_call_count(), 0);
        assert_eq!(ctx.monitor.summary().failed, 1);
    }

    #[tokio::test]
    async fn invalid_labels_bundle_all_failures() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        let (ctx, _backup_dir) = context(runtime, true);
        let mut container = postgres_container("broken");
        container.labels.remove("baktainer.db.user");
        container.labels.remove("baktainer.db.password");
        container.state = ContainerState::Stopped;

        let err = backup_container(&ctx, &container).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("running"));
        assert!(message.contains("baktainer.db.user"));
        assert!(message.contains("baktainer.db.password"));
    }

    #[tokio::test]
    async fn retryable_exec_errors_are_retried() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        runtime.fail_next_exec(Error::RuntimeTimeout("exec timed out".into()));
        let (ctx, _backup_dir) = context(runtime.clone(), true);
        let container = postgres_container("flaky");

        backup_container(&ctx, &container).await.expect("backup");
        assert_eq!(runtime.exec_call_count(), 2);
        assert_eq!(ctx.monitor.summary().successful, 1);
    }

    #[tokio::test]
    async fn retries_stop_after_max_attempts() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        for _ in 0..3 {
            runtime.fail_next_exec(Error::Runtime("socket closed".into()));
        }
        let (ctx, backup_dir) = context(runtime.clone(), true);
        let container = postgres_container("down");

        let err = backup_container(&ctx, &container).await.unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert_eq!(runtime.exec_call_count(), 3);
        assert!(leftover_artifacts(&date_dir(&backup_dir)).is_empty());
    }

    #[tokio::test]
    async fn security_errors_do_not_retry() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        runtime.fail_next_exec(Error::Security("bad argv".into()));
        let (ctx, _backup_dir) = context(runtime.clone(), true);
        let container = postgres_container("sec");

        let err = backup_container(&ctx, &container).await.unwrap_err();
        assert!(matches!(err, Error::Security(_)));
        assert_eq!(runtime.exec_call_count(), 1);
    }

    #[tokio::test]
    async fn empty_dump_is_an_integrity_error_with_no_leftovers() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        runtime.set_stdout(b"");
        let (ctx, backup_dir) = context(runtime, true);
        let container = postgres_container("empty");

        let err = backup_container(&ctx, &container).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert!(leftover_artifacts(&date_dir(&backup_dir)).is_empty());
        assert_eq!(ctx.monitor.summary().failed, 1);
    }

    #[tokio::test]
    async fn encryption_publishes_ciphertext_and_shreds_plaintext() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        let (mut ctx, _backup_dir) = context(runtime, true);
        ctx.encryptor = Some(Encryptor::with_key([0u8; 32]));
        let mut config = (*ctx.config).clone();
        config.encryption.enabled = true;
        ctx.config = Arc::new(config);
        let container = postgres_container("vault");

        let published = backup_container(&ctx, &container).await.expect("backup");
        assert!(published.to_string_lossy().ends_with(".sql.gz.encrypted"));
        let bytes = std::fs::read(&published).expect("read");
        assert_eq!(&bytes[..4], b"BAKT");

        let plain = published.with_extension("");
        assert!(!Path::new(&plain).exists(), "plaintext must be removed");
    }

    #[tokio::test]
    async fn encrypt_label_without_key_is_rejected() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        let (ctx, _backup_dir) = context(runtime.clone(), true);
        let mut container = postgres_container("wants-crypto");
        container
            .labels
            .insert("baktainer.backup.encrypt".to_string(), "true".to_string());

        let err = backup_container(&ctx, &container).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(runtime.exec_call_count(), 0);
    }

    #[tokio::test]
    async fn backup_name_label_names_the_artifact() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        let (ctx, _backup_dir) = context(runtime, true);
        let mut container = postgres_container("container-name");
        container
            .labels
            .insert("baktainer.name".to_string(), "friendly".to_string());

        let published = backup_container(&ctx, &container).await.expect("backup");
        let file_name = published.file_name().expect("name").to_string_lossy().into_owned();
        assert!(file_name.starts_with("friendly-"));
        assert_eq!(ctx.monitor.per_container("friendly").len(), 1);
    }

    #[test]
    fn validate_candidate_legacy_path() {
        let registry = StrategyRegistry::with_builtin();
        let container = postgres_container("legacy");
        let labels = validate_candidate(&container, None, &registry).expect("valid");
        assert_eq!(labels.engine, "postgres");
        assert_eq!(labels.user.as_deref(), Some("postgres"));

        let mut bad = postgres_container("legacy");
        bad.labels
            .insert(labels::LABEL_ENGINE.to_string(), "db2".to_string());
        let err = validate_candidate(&bad, None, &registry).unwrap_err();
        assert!(err.to_string().contains("not supported"));

        let mut sqlite = postgres_container("legacy");
        sqlite
            .labels
            .insert(labels::LABEL_ENGINE.to_string(), "sqlite".to_string());
        sqlite.labels.remove("baktainer.db.user");
        sqlite.labels.remove("baktainer.db.password");
        assert!(validate_candidate(&sqlite, None, &registry).is_ok());
    }

    #[test]
    fn retry_policy_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }
}
