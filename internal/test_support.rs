use crate::docker::{Container, ContainerRuntime, RuntimeVersion, StderrBuffer};
use crate::error::{Error, Result};
use crate::strategy::BackupCommand;
use crate::util::config::{
    Config, EncryptionConfig, HealthConfig, LogLevel, NotifyConfig, RotationConfig, TlsConfig,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A deterministic config that never touches the process environment.
pub fn base_config() -> Config {
    Config {
        docker_url: "unix:///var/run/docker.sock".into(),
        cron_schedule: "0 0 * * *".into(),
        threads: 2,
        log_level: LogLevel::Info,
        backup_dir: std::env::temp_dir(),
        compress: true,
        tls: TlsConfig {
            enabled: false,
            ca: None,
            cert: None,
            key: None,
        },
        rotation: RotationConfig {
            enabled: true,
            retention_days: 30,
            retention_count: 0,
            min_free_space_gb: 0,
        },
        encryption: EncryptionConfig {
            enabled: false,
            key: None,
            key_file: None,
            passphrase: None,
        },
        notify: NotifyConfig {
            channels: Vec::new(),
            on_success: false,
            on_failure: true,
            on_warning: true,
            on_health: true,
            on_summary: false,
            webhook_url: None,
            slack_webhook_url: None,
            discord_webhook_url: None,
            teams_webhook_url: None,
        },
        health: HealthConfig {
            enabled: false,
            bind: "127.0.0.1".into(),
            port: 8080,
        },
    }
}

/// Scriptable in-memory runtime for discovery/orchestrator/scheduler tests.
pub struct MockRuntime {
    containers: Mutex<Vec<Container>>,
    list_failures: Mutex<VecDeque<Error>>,
    exec_failures: Mutex<VecDeque<Error>>,
    version_failures: Mutex<VecDeque<Error>>,
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
    pub exec_calls: AtomicUsize,
}

impl MockRuntime {
    pub fn new(containers: Vec<Container>) -> Self {
        Self {
            containers: Mutex::new(containers),
            list_failures: Mutex::new(VecDeque::new()),
            exec_failures: Mutex::new(VecDeque::new()),
            version_failures: Mutex::new(VecDeque::new()),
            stdout: Mutex::new(b"-- PostgreSQL database dump\nCREATE TABLE t();\n".to_vec()),
            stderr: Mutex::new(Vec::new()),
            exec_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_stdout(&self, bytes: &[u8]) {
        *self.stdout.lock().expect("stdout lock") = bytes.to_vec();
    }

    pub fn set_stderr(&self, bytes: &[u8]) {
        *self.stderr.lock().expect("stderr lock") = bytes.to_vec();
    }

    pub fn fail_next_list(&self, err: Error) {
        self.list_failures.lock().expect("list lock").push_back(err);
    }

    pub fn fail_next_exec(&self, err: Error) {
        self.exec_failures.lock().expect("exec lock").push_back(err);
    }

    pub fn fail_next_version(&self, err: Error) {
        self.version_failures
            .lock()
            .expect("version lock")
            .push_back(err);
    }

    pub fn exec_call_count(&self) -> usize {
        self.exec_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> Result<Vec<Container>> {
        if let Some(err) = self.list_failures.lock().expect("list lock").pop_front() {
            return Err(err);
        }
        Ok(self.containers.lock().expect("containers lock").clone())
    }

    async fn exec(
        &self,
        _container_id: &str,
        command: &BackupCommand,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut StderrBuffer,
    ) -> Result<()> {
        command.validate()?;
        self.exec_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.exec_failures.lock().expect("exec lock").pop_front() {
            return Err(err);
        }
        let body = self.stdout.lock().expect("stdout lock").clone();
        stdout.write_all(&body).await?;
        stdout.flush().await?;
        let noise = self.stderr.lock().expect("stderr lock").clone();
        if !noise.is_empty() {
            stderr.push(&noise);
        }
        Ok(())
    }

    async fn version(&self) -> Result<RuntimeVersion> {
        if let Some(err) = self.version_failures.lock().expect("version lock").pop_front() {
            return Err(err);
        }
        Ok(RuntimeVersion {
            version: "24.0.7".into(),
            api_version: "1.43".into(),
        })
    }
}
