use baktainer_core::api;
use baktainer_core::docker::client::DockerClient;
use baktainer_core::docker::ContainerRuntime;
use baktainer_core::monitor::Monitor;
use baktainer_core::notify::Notifier;
use baktainer_core::orchestrator::{BackupContext, RetryPolicy};
use baktainer_core::scheduler::{shared_cycle, Scheduler};
use baktainer_core::storage::encryption::Encryptor;
use baktainer_core::storage::rotation::Rotation;
use baktainer_core::strategy::StrategyRegistry;
use baktainer_core::util::config::Config;
use baktainer_core::util::usage::{self, CliAction};
use baktainer_core::util::volume::{AutoProbe, SpaceProbe};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let action = usage::cli_action(APP_VERSION);
    if action == CliAction::Exit {
        return Ok(());
    }

    init_tracing();
    let config = Config::load()?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerClient::connect(&config)?);
    let version = runtime.version().await?;
    tracing::info!(
        version = %version.version,
        api_version = %version.api_version,
        endpoint = %config.docker_url,
        "connected to container runtime"
    );

    let encryptor = Encryptor::from_config(&config.encryption)?;
    if let Some(encryptor) = &encryptor {
        encryptor.verify_key(&std::env::temp_dir()).await?;
        tracing::info!(key_fingerprint = %encryptor.key_fingerprint(), "encryption key verified");
    }

    let config = Arc::new(config);
    let probe: Arc<dyn SpaceProbe> = Arc::new(AutoProbe::default());
    let notifier = Arc::new(Notifier::from_config(&config.notify));
    let monitor = Arc::new(Monitor::with_notifier(notifier.clone()));
    let rotation = Arc::new(Rotation::new(
        config.backup_dir.clone(),
        config.rotation.clone(),
        probe.clone(),
    ));
    let last_cycle = shared_cycle();

    let ctx = Arc::new(BackupContext {
        config: config.clone(),
        runtime: runtime.clone(),
        registry: Arc::new(StrategyRegistry::with_builtin()),
        monitor: monitor.clone(),
        notifier,
        encryptor,
        probe: probe.clone(),
        retry: RetryPolicy::default(),
    });
    let scheduler = Scheduler::new(ctx, rotation.clone(), last_cycle.clone());

    if config.health.enabled {
        let state = api::ApiState {
            config: config.clone(),
            monitor,
            rotation,
            runtime,
            probe,
            last_cycle,
            started_at: chrono::Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(err) = api::serve(state).await {
                tracing::error!(error = %err, "health server exited");
            }
        });
    }

    match action {
        CliAction::RunOnce => {
            let result = scheduler.run_cycle().await;
            tracing::info!(
                succeeded = result.succeeded,
                failed = result.failed,
                "one-shot cycle finished"
            );
        }
        CliAction::RunScheduler => {
            tokio::select! {
                _ = scheduler.run() => {},
                _ = wait_for_shutdown() => {
                    tracing::info!("shutdown signal received");
                }
            }
        }
        CliAction::Exit => unreachable!("handled above"),
    }
    Ok(())
}

/// Resolves on SIGINT or, on unix, SIGTERM. The scheduler is cancelled at
/// its next sleep boundary; a cycle in flight is not interrupted mid-write.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("BT_LOG_LEVEL").unwrap_or_default()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
