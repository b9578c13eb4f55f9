use crate::docker::discovery;
use crate::error::Error;
use crate::notify::BackupEvent;
use crate::orchestrator::{backup_container, BackupContext};
use crate::pool::WorkerPool;
use crate::storage::rotation::{Rotation, RotationResult};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::time::sleep;

/// Outcome of one scheduler firing, kept for the status surface.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CycleResult {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub discovered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: Option<String>,
    pub rotation: Option<RotationResult>,
}

pub type SharedCycle = Arc<Mutex<Option<CycleResult>>>;

pub fn shared_cycle() -> SharedCycle {
    Arc::new(Mutex::new(None))
}

/// Single-threaded cron loop. One firing runs exactly one cycle; cycle N+1
/// never starts before cycle N (including its rotation) has finished.
pub struct Scheduler {
    ctx: Arc<BackupContext>,
    rotation: Arc<Rotation>,
    last_cycle: SharedCycle,
}

impl Scheduler {
    pub fn new(ctx: Arc<BackupContext>, rotation: Arc<Rotation>, last_cycle: SharedCycle) -> Self {
        Self {
            ctx,
            rotation,
            last_cycle,
        }
    }

    pub async fn run(&self) {
        let schedule = parse_schedule(&self.ctx.config.cron_schedule);
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                tracing::error!("cron schedule has no upcoming fire time, scheduler exiting");
                return;
            };
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tracing::info!(next_fire = %next, "scheduler sleeping until next cycle");
            sleep(wait).await;
            self.run_cycle().await;
        }
    }

    /// One full cycle: pre-flight probe, discovery, fan-out, join, rotation,
    /// summary. A single container failure never terminates the cycle.
    pub async fn run_cycle(&self) -> CycleResult {
        let started = std::time::Instant::now();
        let mut result = CycleResult {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        if let Err(err) = self.preflight().await {
            let message = format!("pre-flight runtime probe failed: {err}");
            tracing::error!("{message}");
            self.ctx
                .notifier
                .dispatch(&BackupEvent::Health {
                    healthy: false,
                    message: message.clone(),
                    directory: Some(self.ctx.config.backup_dir.display().to_string()),
                    available_space: self.ctx.probe.free_space(&self.ctx.config.backup_dir),
                })
                .await;
            result.aborted = Some(message);
            result.duration_seconds = started.elapsed().as_secs_f64();
            self.store(result.clone());
            return result;
        }

        let containers = match discovery::discover(self.ctx.runtime.as_ref()).await {
            Ok(containers) => containers,
            Err(err) => {
                let message = format!("container discovery failed: {err}");
                tracing::error!("{message}");
                result.aborted = Some(message);
                result.duration_seconds = started.elapsed().as_secs_f64();
                self.store(result.clone());
                return result;
            }
        };
        result.discovered = containers.len();

        let pool = WorkerPool::new(self.ctx.config.threads);
        let mut handles = Vec::with_capacity(containers.len());
        for container in containers {
            let ctx = self.ctx.clone();
            let name = container.name.clone();
            let handle = pool
                .submit(async move { backup_container(&ctx, &container).await })
                .await;
            handles.push((name, handle));
        }

        let mut total_bytes = 0u64;
        for (name, handle) in handles {
            match handle.join().await {
                Ok(path) => {
                    result.succeeded += 1;
                    if let Ok(metadata) = tokio::fs::metadata(&path).await {
                        total_bytes += metadata.len();
                    }
                }
                Err(err) => {
                    result.failed += 1;
                    tracing::debug!(container = %name, error = %err, "container backup settled with error");
                }
            }
        }
        pool.shutdown().await;

        if self.rotation.enabled() {
            result.rotation = Some(self.rotation.run().await);
        }

        result.duration_seconds = started.elapsed().as_secs_f64();
        let summary = self.ctx.monitor.summary();
        tracing::info!(
            discovered = result.discovered,
            succeeded = result.succeeded,
            failed = result.failed,
            duration_seconds = result.duration_seconds,
            success_rate = summary.success_rate,
            total_data = summary.total_data,
            "backup cycle finished"
        );
        self.ctx
            .notifier
            .dispatch(&BackupEvent::Summary {
                total: result.discovered as u64,
                succeeded: result.succeeded as u64,
                failed: result.failed as u64,
                duration_seconds: result.duration_seconds,
                total_bytes,
            })
            .await;

        self.store(result.clone());
        result
    }

    async fn preflight(&self) -> Result<(), Error> {
        let version = self.ctx.runtime.version().await?;
        tracing::debug!(
            version = %version.version,
            api_version = %version.api_version,
            "runtime pre-flight probe ok"
        );
        Ok(())
    }

    fn store(&self, result: CycleResult) {
        let mut last = self.last_cycle.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(result);
    }
}

/// The configured expression is 5-field cron; the cron crate wants seconds
/// in front. Unparseable input falls back to daily-at-midnight, logged.
pub fn parse_schedule(expr: &str) -> Schedule {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    match Schedule::from_str(&normalized) {
        Ok(schedule) => schedule,
        Err(err) => {
            tracing::warn!(
                schedule = expr,
                error = %err,
                "invalid cron expression, falling back to daily at midnight"
            );
            Schedule::from_str("0 0 0 * * *").expect("default schedule parses")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_schedule, shared_cycle, Scheduler};
    use crate::docker::{Container, ContainerState};
    use crate::error::Error;
    use crate::monitor::Monitor;
    use crate::notify::Notifier;
    use crate::orchestrator::{BackupContext, RetryPolicy};
    use crate::storage::rotation::Rotation;
    use crate::strategy::StrategyRegistry;
    use crate::test_support::{base_config, MockRuntime};
    use crate::util::volume::SpaceProbe;
    use chrono::Utc;
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

    fn build_scheduler(runtime: Arc<MockRuntime>) -> (Scheduler, super::SharedCycle, PathBuf) {
        let backup_dir = std::env::temp_dir().join(format!("bt-sched-{}", Uuid::new_v4()));
        let mut config = base_config();
        config.backup_dir = backup_dir.clone();
        config.threads = 2;
        let probe: Arc<dyn SpaceProbe> = Arc::new(PlentyProbe);
        let rotation = Arc::new(Rotation::new(
            backup_dir.clone(),
            config.rotation.clone(),
            probe.clone(),
        ));
        let notifier = Arc::new(Notifier::from_config(&config.notify));
        let ctx = Arc::new(BackupContext {
            config: Arc::new(config),
            runtime,
            registry: Arc::new(StrategyRegistry::with_builtin()),
            monitor: Arc::new(Monitor::new()),
            notifier,
            encryptor: None,
            probe,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        });
        let cycle = shared_cycle();
        (Scheduler::new(ctx, rotation, cycle.clone()), cycle, backup_dir)
    }

    #[test]
    fn five_field_expressions_are_normalized() {
        let schedule = parse_schedule("0 0 * * *");
        let next = schedule.upcoming(Utc).next().expect("next");
        assert_eq!(next.time().format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn bad_expressions_fall_back_to_daily() {
        let schedule = parse_schedule("not a cron line");
        let next = schedule.upcoming(Utc).next().expect("next");
        assert_eq!(next.time().format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[tokio::test]
    async fn cycle_backs_up_all_discovered_containers() {
        let runtime = Arc::new(MockRuntime::new(vec![
            postgres_container("app"),
            postgres_container("web"),
        ]));
        let (scheduler, cycle, _dir) = build_scheduler(runtime);

        let result = scheduler.run_cycle().await;
        assert_eq!(result.discovered, 2);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 0);
        assert!(result.aborted.is_none());
        assert!(result.rotation.is_some());

        let stored = cycle.lock().expect("lock").clone().expect("stored");
        assert_eq!(stored.succeeded, 2);
    }

    #[tokio::test]
    async fn one_bad_container_does_not_kill_the_cycle() {
        let mut stopped = postgres_container("stopped");
        stopped.state = ContainerState::Stopped;
        let runtime = Arc::new(MockRuntime::new(vec![postgres_container("ok"), stopped]));
        let (scheduler, _cycle, _dir) = build_scheduler(runtime);

        let result = scheduler.run_cycle().await;
        assert_eq!(result.discovered, 2);
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
    }

    #[tokio::test]
    async fn unhealthy_runtime_aborts_without_touching_containers() {
        let runtime = Arc::new(MockRuntime::new(vec![postgres_container("app")]));
        runtime.fail_next_version(Error::Runtime("docker unreachable".into()));
        let (scheduler, cycle, _dir) = build_scheduler(runtime.clone());

        let result = scheduler.run_cycle().await;
        assert!(result.aborted.is_some());
        assert_eq!(result.discovered, 0);
        assert_eq!(runtime.exec_call_count(), 0);
        assert!(cycle.lock().expect("lock").is_some());
    }

    #[tokio::test]
    async fn discovery_failure_aborts_the_cycle_but_not_the_process() {
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        runtime.fail_next_list(Error::RuntimeTimeout("list timed out".into()));
        let (scheduler, _cycle, _dir) = build_scheduler(runtime);

        let result = scheduler.run_cycle().await;
        assert!(result
            .aborted
            .as_deref()
            .expect("aborted")
            .contains("discovery failed"));

        // a later cycle succeeds once the runtime recovers
        let result = scheduler.run_cycle().await;
        assert!(result.aborted.is_none());
    }
}
