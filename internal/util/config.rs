use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub enabled: bool,
    pub retention_days: u32,
    pub retention_count: u32,
    pub min_free_space_gb: u64,
}

#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub key: Option<String>,
    pub key_file: Option<PathBuf>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub channels: Vec<String>,
    pub on_success: bool,
    pub on_failure: bool,
    pub on_warning: bool,
    pub on_health: bool,
    pub on_summary: bool,
    pub webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub teams_webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

/// Immutable process configuration, loaded once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub docker_url: String,
    pub cron_schedule: String,
    pub threads: usize,
    pub log_level: LogLevel,
    pub backup_dir: PathBuf,
    pub compress: bool,
    pub tls: TlsConfig,
    pub rotation: RotationConfig,
    pub encryption: EncryptionConfig,
    pub notify: NotifyConfig,
    pub health: HealthConfig,
}

pub const DEFAULT_DOCKER_URL: &str = "unix:///var/run/docker.sock";
pub const DEFAULT_CRON: &str = "0 0 * * *";

impl Config {
    pub fn load() -> Result<Self> {
        let core = CoreConfig::from_env()?;
        let tls = TlsConfig::from_env()?;
        let rotation = RotationConfig::from_env()?;
        let encryption = EncryptionConfig::from_env()?;
        let notify = NotifyConfig::from_env()?;
        let health = HealthConfig::from_env()?;
        Ok(Self {
            docker_url: core.docker_url,
            cron_schedule: core.cron_schedule,
            threads: core.threads,
            log_level: core.log_level,
            backup_dir: core.backup_dir,
            compress: core.compress,
            tls,
            rotation,
            encryption,
            notify,
            health,
        })
    }
}

struct CoreConfig {
    docker_url: String,
    cron_schedule: String,
    threads: usize,
    log_level: LogLevel,
    backup_dir: PathBuf,
    compress: bool,
}

impl CoreConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            docker_url: load_docker_url()?,
            cron_schedule: load_cron_schedule()?,
            threads: load_threads()?,
            log_level: load_log_level()?,
            backup_dir: load_backup_dir()?,
            compress: parse_bool_env("BT_COMPRESS", true)?,
        })
    }
}

impl TlsConfig {
    fn from_env() -> Result<Self> {
        let enabled = parse_bool_env("BT_SSL", false)?;
        let ca = read_optional_env("BT_CA");
        let cert = read_optional_env("BT_CERT");
        let key = read_optional_env("BT_KEY");
        if enabled && (ca.is_none() || cert.is_none() || key.is_none()) {
            return Err(Error::Config(
                "BT_CA, BT_CERT and BT_KEY are required when BT_SSL=true".into(),
            ));
        }
        Ok(Self {
            enabled,
            ca,
            cert,
            key,
        })
    }
}

impl RotationConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            enabled: parse_bool_env("BT_ROTATION_ENABLED", true)?,
            retention_days: parse_ranged_env("BT_RETENTION_DAYS", 30u32, 0, 365)?,
            retention_count: parse_ranged_env("BT_RETENTION_COUNT", 0u32, 0, 1000)?,
            min_free_space_gb: parse_ranged_env("BT_MIN_FREE_SPACE_GB", 10u64, 0, 1000)?,
        })
    }
}

impl EncryptionConfig {
    fn from_env() -> Result<Self> {
        let enabled = parse_bool_env("BT_ENCRYPTION_ENABLED", false)?;
        let key = read_optional_env("BT_ENCRYPTION_KEY");
        let key_file = read_optional_env("BT_ENCRYPTION_KEY_FILE").map(PathBuf::from);
        let passphrase = read_optional_env("BT_ENCRYPTION_PASSPHRASE");
        if enabled {
            let sources = usize::from(key.is_some())
                + usize::from(key_file.is_some())
                + usize::from(passphrase.is_some());
            if sources != 1 {
                return Err(Error::Config(
                    "exactly one of BT_ENCRYPTION_KEY, BT_ENCRYPTION_KEY_FILE or \
                     BT_ENCRYPTION_PASSPHRASE must be set when BT_ENCRYPTION_ENABLED=true"
                        .into(),
                ));
            }
        }
        Ok(Self {
            enabled,
            key,
            key_file,
            passphrase,
        })
    }
}

impl NotifyConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            channels: split_csv_env("BT_NOTIFICATION_CHANNELS"),
            on_success: parse_bool_env("BT_NOTIFY_SUCCESS", false)?,
            on_failure: parse_bool_env("BT_NOTIFY_FAILURES", true)?,
            on_warning: parse_bool_env("BT_NOTIFY_WARNINGS", true)?,
            on_health: parse_bool_env("BT_NOTIFY_HEALTH", true)?,
            on_summary: parse_bool_env("BT_NOTIFY_SUMMARY", false)?,
            webhook_url: read_optional_env("BT_WEBHOOK_URL"),
            slack_webhook_url: read_optional_env("BT_SLACK_WEBHOOK_URL"),
            discord_webhook_url: read_optional_env("BT_DISCORD_WEBHOOK_URL"),
            teams_webhook_url: read_optional_env("BT_TEAMS_WEBHOOK_URL"),
        })
    }
}

impl HealthConfig {
    fn from_env() -> Result<Self> {
        let port = parse_ranged_env("BT_HEALTH_PORT", 8080u32, 1, 65535)? as u16;
        Ok(Self {
            enabled: parse_bool_env("BT_HEALTH_SERVER_ENABLED", false)?,
            bind: env_or_default("BT_HEALTH_BIND", "0.0.0.0"),
            port,
        })
    }
}

fn load_docker_url() -> Result<String> {
    let url = env_or_default("BT_DOCKER_URL", DEFAULT_DOCKER_URL);
    let valid = ["unix://", "tcp://", "http://", "https://"]
        .iter()
        .any(|scheme| url.starts_with(scheme));
    if !valid {
        return Err(Error::Config(format!(
            "BT_DOCKER_URL must begin with unix://, tcp://, http:// or https:// (got '{url}')"
        )));
    }
    Ok(url)
}

fn load_cron_schedule() -> Result<String> {
    let schedule = env_or_default("BT_CRON", DEFAULT_CRON);
    if schedule.split_whitespace().count() != 5 {
        return Err(Error::Config(format!(
            "BT_CRON must have exactly 5 whitespace-separated fields (got '{schedule}')"
        )));
    }
    Ok(schedule)
}

fn load_threads() -> Result<usize> {
    parse_ranged_env("BT_THREADS", 4u32, 1, 50).map(|value| value as usize)
}

fn load_log_level() -> Result<LogLevel> {
    let raw = env_or_default("BT_LOG_LEVEL", "info");
    LogLevel::parse(&raw).ok_or_else(|| {
        Error::Config(format!(
            "BT_LOG_LEVEL must be debug, info, warn or error (got '{raw}')"
        ))
    })
}

fn load_backup_dir() -> Result<PathBuf> {
    let dir = PathBuf::from(env_or_default("BT_BACKUP_DIR", "/backups"));
    if !dir.is_absolute() {
        return Err(Error::Config(format!(
            "BT_BACKUP_DIR must be an absolute path (got '{}')",
            dir.display()
        )));
    }
    Ok(dir)
}

fn env_or_default(key: &str, default_value: &str) -> String {
    env::var(key).unwrap_or_else(|_| default_value.to_string())
}

fn read_optional_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_csv_env(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}

pub fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_bool_env(key: &str, default_value: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => parse_bool_value(&raw)
            .ok_or_else(|| Error::Config(format!("{key} must be a boolean (got '{raw}')"))),
        Err(_) => Ok(default_value),
    }
}

fn parse_ranged_env<T>(key: &str, default_value: T, min: T, max: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let Ok(raw) = env::var(key) else {
        return Ok(default_value);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be an integer (got '{raw}')")))?;
    if value < min || value > max {
        return Err(Error::Config(format!(
            "{key} must be between {min} and {max} (got {value})"
        )));
    }
    Ok(value)
}
