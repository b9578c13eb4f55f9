use crate::util::config::parse_bool_value;
use std::collections::HashMap;

pub const LABEL_NAMESPACE: &str = "baktainer.";

pub const LABEL_BACKUP: &str = "baktainer.backup";
pub const LABEL_NAME: &str = "baktainer.name";
pub const LABEL_ENGINE: &str = "baktainer.db.engine";
pub const LABEL_DB_NAME: &str = "baktainer.db.name";
pub const LABEL_DB_USER: &str = "baktainer.db.user";
pub const LABEL_DB_PASSWORD: &str = "baktainer.db.password";
pub const LABEL_DB_ALL: &str = "baktainer.db.all";
pub const LABEL_COMPRESS: &str = "baktainer.backup.compress";
pub const LABEL_ENCRYPT: &str = "baktainer.backup.encrypt";
pub const LABEL_RETENTION_DAYS: &str = "baktainer.backup.retention.days";
pub const LABEL_RETENTION_COUNT: &str = "baktainer.backup.retention.count";
pub const LABEL_PRIORITY: &str = "baktainer.backup.priority";

const ENGINES: &[&str] = &["mysql", "mariadb", "postgres", "postgresql", "sqlite"];
const ENGINES_WITH_ALL: &[&str] = &["postgres", "postgresql"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Bool,
    Int,
    Str,
    Enum(&'static [&'static str]),
}

/// One row of the declarative label table.
pub struct LabelSpec {
    pub key: &'static str,
    pub kind: LabelKind,
    pub required: bool,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub max_len: Option<usize>,
    pub name_pattern: bool,
    pub description: &'static str,
}

/// The label surface this service owns. Unknown `baktainer.*` keys warn,
/// keys outside the namespace are ignored.
pub static LABEL_TABLE: &[LabelSpec] = &[
    LabelSpec {
        key: LABEL_BACKUP,
        kind: LabelKind::Bool,
        required: true,
        min: None,
        max: None,
        max_len: None,
        name_pattern: false,
        description: "opt the container into scheduled backups",
    },
    LabelSpec {
        key: LABEL_ENGINE,
        kind: LabelKind::Enum(ENGINES),
        required: true,
        min: None,
        max: None,
        max_len: None,
        name_pattern: false,
        description: "database engine used to pick the dump command",
    },
    LabelSpec {
        key: LABEL_DB_NAME,
        kind: LabelKind::Str,
        required: true,
        min: None,
        max: None,
        max_len: Some(64),
        name_pattern: true,
        description: "database to dump (or sqlite file path)",
    },
    LabelSpec {
        key: LABEL_DB_USER,
        kind: LabelKind::Str,
        required: false,
        min: None,
        max: None,
        max_len: None,
        name_pattern: false,
        description: "database user, required unless engine=sqlite",
    },
    LabelSpec {
        key: LABEL_DB_PASSWORD,
        kind: LabelKind::Str,
        required: false,
        min: None,
        max: None,
        max_len: None,
        name_pattern: false,
        description: "database password, required unless engine=sqlite",
    },
    LabelSpec {
        key: LABEL_NAME,
        kind: LabelKind::Str,
        required: false,
        min: None,
        max: None,
        max_len: Some(64),
        name_pattern: true,
        description: "artifact base name, defaults to the container name",
    },
    LabelSpec {
        key: LABEL_DB_ALL,
        kind: LabelKind::Bool,
        required: false,
        min: None,
        max: None,
        max_len: None,
        name_pattern: false,
        description: "dump the whole server instead of one database",
    },
    LabelSpec {
        key: LABEL_COMPRESS,
        kind: LabelKind::Bool,
        required: false,
        min: None,
        max: None,
        max_len: None,
        name_pattern: false,
        description: "per-container gzip override",
    },
    LabelSpec {
        key: LABEL_ENCRYPT,
        kind: LabelKind::Bool,
        required: false,
        min: None,
        max: None,
        max_len: None,
        name_pattern: false,
        description: "per-container encryption override",
    },
    LabelSpec {
        key: LABEL_RETENTION_DAYS,
        kind: LabelKind::Int,
        required: false,
        min: Some(1),
        max: Some(3650),
        max_len: None,
        name_pattern: false,
        description: "per-container retention age override",
    },
    LabelSpec {
        key: LABEL_RETENTION_COUNT,
        kind: LabelKind::Int,
        required: false,
        min: Some(0),
        max: Some(1000),
        max_len: None,
        name_pattern: false,
        description: "per-container retention count override",
    },
    LabelSpec {
        key: LABEL_PRIORITY,
        kind: LabelKind::Enum(&["low", "normal", "high", "critical"]),
        required: false,
        min: None,
        max: None,
        max_len: None,
        name_pattern: false,
        description: "informational backup priority",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Normalized backup metadata for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLabels {
    pub engine: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub backup_name: Option<String>,
    pub all_databases: bool,
    pub compress: Option<bool>,
    pub encrypt: Option<bool>,
    pub retention_days: Option<u32>,
    pub retention_count: Option<u32>,
    pub priority: Priority,
}

#[derive(Debug, Clone)]
pub struct LabelVerdict {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub normalized: Option<BackupLabels>,
}

impl LabelVerdict {
    fn invalid(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            warnings,
            normalized: None,
        }
    }
}

/// Whether the container opted in at all. Coercion failures count as "no".
pub fn backup_enabled(labels: &HashMap<String, String>) -> bool {
    labels
        .get(LABEL_BACKUP)
        .and_then(|value| parse_bool_value(value))
        .unwrap_or(false)
}

/// Validate and normalize a container's `baktainer.*` labels.
///
/// `encryption_configured` gates the `baktainer.backup.encrypt=true` label:
/// asking for encryption without a configured key is an error, not a warning.
pub fn validate(labels: &HashMap<String, String>, encryption_configured: bool) -> LabelVerdict {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    warn_unknown_keys(labels, &mut warnings);
    for spec in LABEL_TABLE {
        check_spec(labels, spec, &mut errors);
    }

    let engine = labels.get(LABEL_ENGINE).map(|value| value.trim().to_ascii_lowercase());
    if let Some(engine) = engine.as_deref() {
        check_credentials(labels, engine, &mut errors, &mut warnings);
        check_all_databases(labels, engine, &mut warnings);
    }
    check_retention_advisory(labels, &mut warnings);
    check_encrypt_requires_key(labels, encryption_configured, &mut errors);

    if !errors.is_empty() {
        return LabelVerdict::invalid(errors, warnings);
    }

    let normalized = normalize(labels);
    LabelVerdict {
        valid: true,
        errors,
        warnings,
        normalized: Some(normalized),
    }
}

fn warn_unknown_keys(labels: &HashMap<String, String>, warnings: &mut Vec<String>) {
    for key in labels.keys() {
        if !key.starts_with(LABEL_NAMESPACE) {
            continue;
        }
        if !LABEL_TABLE.iter().any(|spec| spec.key == key) {
            warnings.push(format!("unknown label '{key}' in the baktainer namespace"));
        }
    }
}

fn check_spec(labels: &HashMap<String, String>, spec: &LabelSpec, errors: &mut Vec<String>) {
    let Some(raw) = labels.get(spec.key) else {
        if spec.required {
            errors.push(format!("label '{}' is required ({})", spec.key, spec.description));
        }
        return;
    };
    let value = raw.trim();
    match spec.kind {
        LabelKind::Bool => {
            if parse_bool_value(value).is_none() {
                errors.push(format!("label '{}' must be a boolean (got '{value}')", spec.key));
            }
        }
        LabelKind::Int => check_int_spec(spec, value, errors),
        LabelKind::Str => check_str_spec(spec, value, errors),
        LabelKind::Enum(allowed) => {
            let lowered = value.to_ascii_lowercase();
            if !allowed.contains(&lowered.as_str()) {
                errors.push(format!(
                    "label '{}' must be one of {} (got '{value}')",
                    spec.key,
                    allowed.join(", ")
                ));
            }
        }
    }
}

fn check_int_spec(spec: &LabelSpec, value: &str, errors: &mut Vec<String>) {
    let Ok(parsed) = value.parse::<i64>() else {
        errors.push(format!("label '{}' must be an integer (got '{value}')", spec.key));
        return;
    };
    let below = spec.min.is_some_and(|min| parsed < min);
    let above = spec.max.is_some_and(|max| parsed > max);
    if below || above {
        errors.push(format!(
            "label '{}' must be between {} and {} (got {parsed})",
            spec.key,
            spec.min.unwrap_or(i64::MIN),
            spec.max.unwrap_or(i64::MAX)
        ));
    }
}

fn check_str_spec(spec: &LabelSpec, value: &str, errors: &mut Vec<String>) {
    if value.is_empty() {
        errors.push(format!("label '{}' must not be empty", spec.key));
        return;
    }
    if spec.max_len.is_some_and(|max| value.len() > max) {
        errors.push(format!(
            "label '{}' must be at most {} characters",
            spec.key,
            spec.max_len.unwrap_or(0)
        ));
    }
    // db.name doubles as a sqlite file path and as the "*" wildcard, both
    // of which step outside the identifier pattern.
    if spec.name_pattern && spec.key != LABEL_DB_NAME && !is_name_pattern(value) {
        errors.push(format!(
            "label '{}' may only contain letters, digits, '_' and '-'",
            spec.key
        ));
    }
}

fn is_name_pattern(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn check_credentials(
    labels: &HashMap<String, String>,
    engine: &str,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let has_user = labels.get(LABEL_DB_USER).is_some_and(|v| !v.trim().is_empty());
    let has_password = labels.get(LABEL_DB_PASSWORD).is_some_and(|v| !v.trim().is_empty());
    if engine == "sqlite" {
        if has_user || has_password || labels.contains_key(LABEL_DB_ALL) {
            warnings.push(
                "sqlite ignores baktainer.db.user, baktainer.db.password and baktainer.db.all"
                    .to_string(),
            );
        }
        return;
    }
    if !has_user {
        errors.push(format!("label '{LABEL_DB_USER}' is required for engine '{engine}'"));
    }
    if !has_password {
        errors.push(format!(
            "label '{LABEL_DB_PASSWORD}' is required for engine '{engine}'"
        ));
    }
}

fn check_all_databases(labels: &HashMap<String, String>, engine: &str, warnings: &mut Vec<String>) {
    let all = labels
        .get(LABEL_DB_ALL)
        .and_then(|value| parse_bool_value(value))
        .unwrap_or(false);
    if !all || !ENGINES_WITH_ALL.contains(&engine) {
        return;
    }
    let db_name = labels.get(LABEL_DB_NAME).map(String::as_str).unwrap_or("");
    if db_name != "*" {
        warnings.push(format!(
            "baktainer.db.all=true dumps every database; baktainer.db.name '{db_name}' is ignored \
             (set it to '*' to make that explicit)"
        ));
    }
}

fn check_retention_advisory(labels: &HashMap<String, String>, warnings: &mut Vec<String>) {
    let Some(days) = labels
        .get(LABEL_RETENTION_DAYS)
        .and_then(|value| value.trim().parse::<i64>().ok())
    else {
        return;
    };
    if (1..7).contains(&days) {
        warnings.push(format!(
            "retention of {days} days is below a week; deleted backups cannot be recovered"
        ));
    }
}

fn check_encrypt_requires_key(
    labels: &HashMap<String, String>,
    encryption_configured: bool,
    errors: &mut Vec<String>,
) {
    let wants_encrypt = labels
        .get(LABEL_ENCRYPT)
        .and_then(|value| parse_bool_value(value))
        .unwrap_or(false);
    if wants_encrypt && !encryption_configured {
        errors.push(format!(
            "label '{LABEL_ENCRYPT}=true' requires a configured encryption key"
        ));
    }
}

fn normalize(labels: &HashMap<String, String>) -> BackupLabels {
    let get = |key: &str| labels.get(key).map(|value| value.trim().to_string());
    let get_bool = |key: &str| labels.get(key).and_then(|value| parse_bool_value(value));
    BackupLabels {
        engine: get(LABEL_ENGINE).unwrap_or_default().to_ascii_lowercase(),
        database: get(LABEL_DB_NAME).unwrap_or_default(),
        user: get(LABEL_DB_USER).filter(|v| !v.is_empty()),
        password: get(LABEL_DB_PASSWORD).filter(|v| !v.is_empty()),
        backup_name: get(LABEL_NAME).filter(|v| !v.is_empty()),
        all_databases: get_bool(LABEL_DB_ALL).unwrap_or(false),
        compress: get_bool(LABEL_COMPRESS),
        encrypt: get_bool(LABEL_ENCRYPT),
        retention_days: get(LABEL_RETENTION_DAYS).and_then(|v| v.parse().ok()),
        retention_count: get(LABEL_RETENTION_COUNT).and_then(|v| v.parse().ok()),
        priority: get(LABEL_PRIORITY)
            .and_then(|v| Priority::parse(&v))
            .unwrap_or_default(),
    }
}
