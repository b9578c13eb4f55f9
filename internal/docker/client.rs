use crate::docker::{
    canonical_name, Container, ContainerRuntime, ContainerState, RuntimeVersion, StderrBuffer,
};
use crate::error::{Error, Result};
use crate::strategy::BackupCommand;
use crate::util::config::{Config, TlsConfig};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// bollard-backed Docker Engine API client.
#[derive(Debug)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Build a client for the configured endpoint. The connection itself is
    /// lazy; call [`ContainerRuntime::version`] to prove reachability.
    pub fn connect(config: &Config) -> Result<Self> {
        let url = config.docker_url.as_str();
        let docker = if config.tls.enabled {
            let material = TlsMaterial::prepare(&config.tls)?;
            Docker::connect_with_ssl(
                url,
                &material.key,
                &material.cert,
                &material.ca,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )
        } else if url.starts_with("unix://") {
            Docker::connect_with_unix(url, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(url, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        };
        docker
            .map(|docker| Self { docker })
            .map_err(map_runtime_error)
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(&self) -> Result<Vec<Container>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_runtime_error)?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id.filter(|id| !id.is_empty()) else {
                tracing::warn!("skipping container summary without an id");
                continue;
            };
            let name = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|raw| canonical_name(raw))
                .unwrap_or_else(|| id.clone());
            containers.push(Container {
                id,
                name,
                labels: summary.labels.unwrap_or_default(),
                state: summary
                    .state
                    .as_deref()
                    .map(ContainerState::parse)
                    .unwrap_or(ContainerState::Other("unknown".into())),
            });
        }
        Ok(containers)
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &BackupCommand,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut StderrBuffer,
    ) -> Result<()> {
        command.validate()?;
        let create = CreateExecOptions::<String> {
            cmd: Some(command.cmd.clone()),
            env: Some(command.env.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container_id, create)
            .await
            .map_err(map_runtime_error)?;

        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(map_runtime_error)?;
        match started {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(map_runtime_error)? {
                        bollard::container::LogOutput::StdOut { message } => {
                            stdout.write_all(&message).await?;
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.push(&message);
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(Error::Runtime("exec unexpectedly started detached".into()));
            }
        }
        stdout.flush().await?;

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(map_runtime_error)?;
        match inspect.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(Error::Runtime(format!(
                "dump command exited with status {code}: {}",
                stderr.tail()
            ))),
        }
    }

    async fn version(&self) -> Result<RuntimeVersion> {
        let version = self.docker.version().await.map_err(map_runtime_error)?;
        Ok(RuntimeVersion {
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
        })
    }
}

fn map_runtime_error(err: bollard::errors::Error) -> Error {
    match err {
        bollard::errors::Error::RequestTimeoutError => {
            Error::RuntimeTimeout("docker request timed out".into())
        }
        other => Error::Runtime(format!("docker request failed: {other}")),
    }
}

struct TlsMaterial {
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

impl TlsMaterial {
    /// Resolve each TLS input to a file on disk. Inline PEM values are
    /// materialized into private temp files so bollard can read them.
    fn prepare(tls: &TlsConfig) -> Result<Self> {
        Ok(Self {
            ca: material_path("ca", tls.ca.as_deref())?,
            cert: material_path("cert", tls.cert.as_deref())?,
            key: material_path("key", tls.key.as_deref())?,
        })
    }
}

fn material_path(label: &str, value: Option<&str>) -> Result<PathBuf> {
    let Some(value) = value else {
        return Err(Error::Config(format!("TLS {label} material is missing")));
    };
    if value.contains("-----BEGIN") {
        let path = std::env::temp_dir().join(format!("bt-tls-{label}-{}.pem", Uuid::new_v4()));
        std::fs::write(&path, value.as_bytes())
            .map_err(|err| Error::Config(format!("cannot materialize TLS {label}: {err}")))?;
        return Ok(path);
    }
    let path = Path::new(value);
    if !path.is_file() {
        return Err(Error::Config(format!(
            "TLS {label} file {value} does not exist"
        )));
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::{map_runtime_error, material_path, DockerClient};
    use crate::error::Error;
    use crate::util::config::{Config, TlsConfig};
    use uuid::Uuid;

    fn base_config() -> Config {
        crate::test_support::base_config()
    }

    #[test]
    fn connect_accepts_unix_and_tcp_urls() {
        let mut config = base_config();
        config.docker_url = "unix:///var/run/docker.sock".into();
        assert!(DockerClient::connect(&config).is_ok());

        config.docker_url = "tcp://127.0.0.1:2375".into();
        assert!(DockerClient::connect(&config).is_ok());
    }

    #[test]
    fn connect_with_tls_requires_material_files() {
        let mut config = base_config();
        config.docker_url = "https://127.0.0.1:2376".into();
        config.tls = TlsConfig {
            enabled: true,
            ca: Some("/definitely/not/here/ca.pem".into()),
            cert: Some("/definitely/not/here/cert.pem".into()),
            key: Some("/definitely/not/here/key.pem".into()),
        };
        let err = DockerClient::connect(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn inline_pem_is_materialized() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let path = material_path("cert", Some(pem)).expect("materialize");
        let body = std::fs::read_to_string(&path).expect("read");
        assert_eq!(body, pem);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_material_is_a_config_error() {
        assert!(matches!(
            material_path("ca", None).unwrap_err(),
            Error::Config(_)
        ));
        let missing = format!("/tmp/bt-missing-{}.pem", Uuid::new_v4());
        assert!(matches!(
            material_path("ca", Some(&missing)).unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn timeout_errors_map_to_runtime_timeout() {
        let err = map_runtime_error(bollard::errors::Error::RequestTimeoutError);
        assert!(matches!(err, Error::RuntimeTimeout(_)));
    }
}
