use crate::error::Result;
use crate::strategy::BackupCommand;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::AsyncWrite;

pub mod client;
pub mod discovery;

/// Stderr accumulated during an exec, bounded so a chatty dump tool cannot
/// grow memory without limit. Overflow is flushed to the log.
pub const STDERR_FLUSH_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Other(String),
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "exited" | "created" | "dead" | "removing" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_running(&self) -> bool {
        *self == Self::Running
    }
}

/// Immutable descriptor of a runtime container, valid for one cycle.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub state: ContainerState,
}

impl Container {
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        &self.id[..end]
    }
}

/// Docker names arrive as `/name`; the canonical display name drops the
/// leading separator.
pub fn canonical_name(raw: &str) -> String {
    raw.trim_start_matches('/').to_string()
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeVersion {
    pub version: String,
    pub api_version: String,
}

#[derive(Debug)]
pub struct StderrBuffer {
    container: String,
    buf: Vec<u8>,
    flushed_bytes: usize,
}

impl StderrBuffer {
    pub fn new(container: &str) -> Self {
        Self {
            container: container.to_string(),
            buf: Vec::new(),
            flushed_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > STDERR_FLUSH_BYTES {
            tracing::warn!(
                container = %self.container,
                bytes = self.buf.len(),
                stderr = %String::from_utf8_lossy(&self.buf),
                "dump stderr overflow, flushing"
            );
            self.flushed_bytes += self.buf.len();
            self.buf.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.flushed_bytes == 0
    }

    /// Last retained stderr, for error messages.
    pub fn tail(&self) -> String {
        String::from_utf8_lossy(&self.buf).trim().to_string()
    }
}

/// The container-runtime capability the engine consumes. The bollard-backed
/// implementation lives in [`client`]; tests substitute their own.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Enumerate all containers, including stopped ones.
    async fn list_containers(&self) -> Result<Vec<Container>>;

    /// Run a command inside a container, streaming stdout into `stdout` and
    /// stderr into `stderr`. Blocks until the process finishes; a non-zero
    /// exit status is an error.
    async fn exec(
        &self,
        container_id: &str,
        command: &BackupCommand,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut StderrBuffer,
    ) -> Result<()>;

    /// Engine version, used as the pre-flight health probe.
    async fn version(&self) -> Result<RuntimeVersion>;
}

#[cfg(test)]
mod tests {
    use super::{canonical_name, Container, ContainerState, StderrBuffer, STDERR_FLUSH_BYTES};
    use std::collections::HashMap;

    #[test]
    fn state_parsing() {
        assert_eq!(ContainerState::parse("running"), ContainerState::Running);
        assert_eq!(ContainerState::parse("Exited"), ContainerState::Stopped);
        assert_eq!(ContainerState::parse("created"), ContainerState::Stopped);
        assert_eq!(
            ContainerState::parse("restarting"),
            ContainerState::Other("restarting".into())
        );
        assert!(ContainerState::Running.is_running());
        assert!(!ContainerState::Stopped.is_running());
        assert_eq!(ContainerState::Other("paused".into()).as_str(), "paused");
    }

    #[test]
    fn names_lose_their_leading_separator() {
        assert_eq!(canonical_name("/myapp-db"), "myapp-db");
        assert_eq!(canonical_name("plain"), "plain");
    }

    #[test]
    fn short_id_truncates() {
        let container = Container {
            id: "0123456789abcdef0123".into(),
            name: "db".into(),
            labels: HashMap::new(),
            state: ContainerState::Running,
        };
        assert_eq!(container.short_id(), "0123456789ab");
    }

    #[test]
    fn stderr_buffer_bounds_memory() {
        let mut buffer = StderrBuffer::new("db");
        assert!(buffer.is_empty());
        buffer.push(b"warning: deprecated flag\n");
        assert_eq!(buffer.tail(), "warning: deprecated flag");
        assert!(!buffer.is_empty());

        buffer.push(&vec![b'x'; STDERR_FLUSH_BYTES + 1]);
        assert_eq!(buffer.tail(), "");
        assert!(!buffer.is_empty(), "flushed bytes still count as output");
    }
}
