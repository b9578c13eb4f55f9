use crate::docker::ContainerRuntime;
use crate::error::{Error, Result};
use crate::monitor::{ExportFormat, Monitor};
use crate::scheduler::SharedCycle;
use crate::storage::rotation::Rotation;
use crate::util::config::Config;
use crate::util::volume::SpaceProbe;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Read-only projection of engine state for operators. Nothing here can
/// mutate the engine.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub monitor: Arc<Monitor>,
    pub rotation: Arc<Rotation>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub probe: Arc<dyn SpaceProbe>,
    pub last_cycle: SharedCycle,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/containers", get(containers))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: ApiState) -> Result<()> {
    let address = format!("{}:{}", state.config.health.bind, state.config.health.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|err| Error::Config(format!("health server cannot bind {address}: {err}")))?;
    tracing::info!(address = %address, "health server listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|err| Error::Io(std::io::Error::other(format!("health server failed: {err}"))))
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let docker = state.runtime.version().await;
    let free = state.probe.free_space(&state.config.backup_dir);
    let last_cycle = state
        .last_cycle
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let healthy = docker.is_ok();
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "docker": match &docker {
            Ok(version) => json!({
                "reachable": true,
                "version": version.version,
                "api_version": version.api_version,
            }),
            Err(err) => json!({ "reachable": false, "error": err.to_string() }),
        },
        "backup_dir": {
            "path": state.config.backup_dir.display().to_string(),
            "free_bytes": free,
        },
        "last_cycle": last_cycle,
    });
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    format: Option<String>,
}

async fn status(
    State(state): State<ApiState>,
    Query(query): Query<StatusQuery>,
) -> axum::response::Response {
    if let Some(format) = query.format.as_deref() {
        let Some(format) = ExportFormat::parse(format) else {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "format must be json or csv" })),
            )
                .into_response();
        };
        let body = state.monitor.export(format);
        let content_type = match format {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        };
        return ([("content-type", content_type)], body).into_response();
    }

    let last_cycle = state
        .last_cycle
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let body = json!({
        "summary": state.monitor.summary(),
        "recent": state.monitor.recent(20),
        "failures": state.monitor.failures(10),
        "alerts": state.monitor.alerts(),
        "in_flight": state.monitor.in_flight_names(),
        "last_cycle": last_cycle,
        "artifacts": state.rotation.statistics().await,
    });
    Json(body).into_response()
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let summary = state.monitor.summary();
    let body = format!(
        "baktainer_backups_total {}\n\
         baktainer_backups_successful {}\n\
         baktainer_backups_failed {}\n\
         baktainer_backup_success_rate {}\n\
         baktainer_backup_avg_duration_seconds {}\n\
         baktainer_backup_avg_size_bytes {}\n\
         baktainer_backup_total_bytes {}\n\
         baktainer_alerts_active {}\n\
         baktainer_backups_in_flight {}\n",
        summary.total,
        summary.successful,
        summary.failed,
        summary.success_rate,
        summary.avg_duration,
        summary.avg_size,
        summary.total_data,
        summary.active_alerts,
        state.monitor.in_flight_count(),
    );
    ([("content-type", "text/plain; version=0.0.4")], body)
}

async fn containers(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.rotation.statistics().await;
    let body = json!({
        "containers": stats.per_container,
        "dates": stats.per_date,
        "total_count": stats.total_count,
        "total_size": stats.total_size,
        "in_flight": state.monitor.in_flight_names(),
    });
    Json(body)
}

#[cfg(test)]
mod tests {
    use super::{router, ApiState};
    use crate::error::Error;
    use crate::monitor::Monitor;
    use crate::scheduler::shared_cycle;
    use crate::storage::rotation::Rotation;
    use crate::test_support::{base_config, MockRuntime};
    use crate::util::volume::SpaceProbe;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::oneshot;
    use uuid::Uuid;

    struct PlentyProbe;

    impl SpaceProbe for PlentyProbe {
        fn free_space(&self, _path: &Path) -> Option<u64> {
            Some(50 * (1 << 30))
        }

        fn capacity(&self, _path: &Path) -> Option<u64> {
            Some(100 * (1 << 30))
        }
    }

    struct RunningApi {
        base_url: String,
        state: ApiState,
        runtime: Arc<MockRuntime>,
        shutdown: Option<oneshot::Sender<()>>,
        task: tokio::task::JoinHandle<()>,
    }

    impl RunningApi {
        async fn shutdown(mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
            let _ = self.task.await;
        }
    }

    async fn start_api() -> RunningApi {
        let mut config = base_config();
        config.backup_dir = std::env::temp_dir().join(format!("bt-api-{}", Uuid::new_v4()));
        let config = Arc::new(config);
        let runtime = Arc::new(MockRuntime::new(Vec::new()));
        let probe: Arc<dyn SpaceProbe> = Arc::new(PlentyProbe);
        let state = ApiState {
            config: config.clone(),
            monitor: Arc::new(Monitor::new()),
            rotation: Arc::new(Rotation::new(
                config.backup_dir.clone(),
                config.rotation.clone(),
                probe.clone(),
            )),
            runtime: runtime.clone(),
            probe,
            last_cycle: shared_cycle(),
            started_at: Utc::now(),
        };
        let app = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        RunningApi {
            base_url: format!("http://{addr}"),
            state,
            runtime,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    #[tokio::test]
    async fn health_reports_runtime_and_disk() {
        let api = start_api().await;
        let response = reqwest::get(format!("{}/health", api.base_url))
            .await
            .expect("get");
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["docker"]["reachable"], true);
        assert_eq!(body["docker"]["version"], "24.0.7");
        assert!(body["backup_dir"]["free_bytes"].as_u64().expect("free") > 0);
        api.shutdown().await;
    }

    #[tokio::test]
    async fn health_degrades_when_runtime_is_down() {
        let api = start_api().await;
        api.runtime
            .fail_next_version(Error::Runtime("docker unreachable".into()));
        let response = reqwest::get(format!("{}/health", api.base_url))
            .await
            .expect("get");
        assert_eq!(response.status(), 503);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["docker"]["reachable"], false);
        api.shutdown().await;
    }

    #[tokio::test]
    async fn status_serves_summary_and_csv_export() {
        let api = start_api().await;
        api.state
            .monitor
            .complete("app", Path::new("/b/app-1.sql"), Some(4096))
            .await;

        let response = reqwest::get(format!("{}/status", api.base_url))
            .await
            .expect("get");
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["summary"]["total"], 1);
        assert_eq!(body["recent"][0]["container_name"], "app");

        let response = reqwest::get(format!("{}/status?format=csv", api.base_url))
            .await
            .expect("get");
        assert_eq!(
            response.headers()["content-type"].to_str().expect("header"),
            "text/csv"
        );
        let text = response.text().await.expect("text");
        assert!(text.starts_with("container_name,"));

        let response = reqwest::get(format!("{}/status?format=xml", api.base_url))
            .await
            .expect("get");
        assert_eq!(response.status(), 400);
        api.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_exposition_is_plain_text() {
        let api = start_api().await;
        api.state.monitor.fail("db", "boom").await;
        let response = reqwest::get(format!("{}/metrics", api.base_url))
            .await
            .expect("get");
        let text = response.text().await.expect("text");
        assert!(text.contains("baktainer_backups_total 1"));
        assert!(text.contains("baktainer_backups_failed 1"));
        api.shutdown().await;
    }

    #[tokio::test]
    async fn containers_endpoint_lists_aggregates() {
        let api = start_api().await;
        let response = reqwest::get(format!("{}/containers", api.base_url))
            .await
            .expect("get");
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["total_count"], 0);
        assert!(body["containers"].as_array().expect("array").is_empty());
        api.shutdown().await;
    }
}
