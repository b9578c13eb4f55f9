use crate::docker::{Container, ContainerRuntime};
use crate::error::Result;
use crate::labels;

/// Enumerate the runtime and keep the containers that opted into backups.
///
/// A malformed candidate is skipped with a log line; a runtime-level failure
/// propagates and aborts the cycle (the scheduler loop itself survives).
pub async fn discover(runtime: &dyn ContainerRuntime) -> Result<Vec<Container>> {
    let containers = runtime.list_containers().await?;
    let total = containers.len();
    let mut eligible = Vec::new();
    for container in containers {
        if container.name.is_empty() {
            tracing::warn!(id = %container.short_id(), "skipping container without a name");
            continue;
        }
        if container.labels.is_empty() {
            continue;
        }
        if !labels::backup_enabled(&container.labels) {
            continue;
        }
        tracing::debug!(
            container = %container.name,
            state = container.state.as_str(),
            "discovered backup candidate"
        );
        eligible.push(container);
    }
    tracing::info!(total, eligible = eligible.len(), "container discovery finished");
    Ok(eligible)
}
