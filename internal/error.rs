use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the backup engine.
///
/// The retry policy keys off [`Error::is_retryable`]: transport and disk
/// problems may clear up on a later attempt, everything else terminates the
/// container's pipeline immediately.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("unsupported engine: {0}")]
    UnsupportedEngine(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("container runtime timeout: {0}")]
    RuntimeTimeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("artifact integrity error: {0}")]
    Integrity(String),

    #[error("worker pool is shut down")]
    PoolClosed,
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Runtime(_) | Error::RuntimeTimeout(_) | Error::Io(_)
        )
    }

    /// Short kind tag used in log lines and notification payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::Security(_) => "security",
            Error::UnsupportedEngine(_) => "unsupported_engine",
            Error::Runtime(_) => "runtime",
            Error::RuntimeTimeout(_) => "runtime_timeout",
            Error::Io(_) => "io",
            Error::Encryption(_) => "encryption",
            Error::Integrity(_) => "integrity",
            Error::PoolClosed => "pool_closed",
        }
    }
}
