use crate::error::{Error, Result};
use crate::labels::BackupLabels;
use std::collections::HashMap;
use std::sync::Arc;

/// Executables a dump command may start with. Everything else is rejected
/// before any process is created, whatever registered the strategy.
pub const COMMAND_WHITELIST: &[&str] =
    &["mysqldump", "pg_dump", "pg_dumpall", "sqlite3", "mongodump"];

const FORBIDDEN_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>',
];

/// A fully assembled in-container dump invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCommand {
    /// `KEY=VALUE` environment entries, in order.
    pub env: Vec<String>,
    /// argv tokens; the first one is the executable.
    pub cmd: Vec<String>,
}

impl BackupCommand {
    pub fn new(env: Vec<String>, cmd: Vec<String>) -> Result<Self> {
        let command = Self { env, cmd };
        command.validate()?;
        Ok(command)
    }

    pub fn validate(&self) -> Result<()> {
        let Some(executable) = self.cmd.first() else {
            return Err(Error::Security("empty command".into()));
        };
        if !COMMAND_WHITELIST.contains(&executable.as_str()) {
            return Err(Error::Security(format!(
                "Command '{executable}' is not allowed"
            )));
        }
        for arg in &self.cmd {
            check_argument(arg)?;
        }
        for entry in &self.env {
            check_argument(entry)?;
        }
        Ok(())
    }
}

fn check_argument(arg: &str) -> Result<()> {
    if let Some(bad) = arg.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(Error::Security(format!(
            "argument '{arg}' contains forbidden character '{bad}'"
        )));
    }
    if arg.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(Error::Security(format!(
            "argument '{arg}' contains control characters"
        )));
    }
    if arg.starts_with('/') {
        return Err(Error::Security(format!(
            "argument '{arg}' must not be an absolute path"
        )));
    }
    if arg.contains("..") {
        return Err(Error::Security(format!(
            "argument '{arg}' must not contain '..'"
        )));
    }
    Ok(())
}

/// Inputs a strategy needs to assemble its command.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub all_databases: bool,
}

impl DumpOptions {
    pub fn from_labels(labels: &BackupLabels) -> Self {
        Self {
            database: Some(labels.database.clone()).filter(|v| !v.is_empty()),
            user: labels.user.clone(),
            password: labels.password.clone(),
            all_databases: labels.all_databases,
        }
    }

    fn require(&self, field: Option<&String>, name: &str, engine: &str) -> Result<String> {
        field
            .map(String::to_owned)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::Validation(format!("engine '{engine}' requires {name}")))
    }
}

/// One engine's dump-command generator plus its content heuristics.
pub trait DumpStrategy: Send + Sync + std::fmt::Debug {
    fn engine(&self) -> &'static str;
    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand>;
    /// Lowercase tokens expected somewhere in the first lines of a dump.
    fn sniff_tokens(&self) -> &'static [&'static str];
}

#[derive(Debug)]
pub struct MysqlStrategy {
    engine: &'static str,
    tokens: &'static [&'static str],
}

impl MysqlStrategy {
    pub fn mysql() -> Self {
        Self {
            engine: "mysql",
            tokens: &["mysql dump", "mysqldump", "create", "insert"],
        }
    }

    pub fn mariadb() -> Self {
        Self {
            engine: "mariadb",
            tokens: &["mariadb dump", "mysql dump", "mysqldump", "create", "insert"],
        }
    }
}

impl DumpStrategy for MysqlStrategy {
    fn engine(&self) -> &'static str {
        self.engine
    }

    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand> {
        let user = opts.require(opts.user.as_ref(), "a user", self.engine)?;
        let password = opts.require(opts.password.as_ref(), "a password", self.engine)?;
        let database = opts.require(opts.database.as_ref(), "a database", self.engine)?;
        BackupCommand::new(
            Vec::new(),
            vec![
                "mysqldump".into(),
                "-u".into(),
                user,
                format!("-p{password}"),
                database,
            ],
        )
    }

    fn sniff_tokens(&self) -> &'static [&'static str] {
        self.tokens
    }
}

#[derive(Debug)]
pub struct PostgresStrategy;

impl DumpStrategy for PostgresStrategy {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand> {
        let user = opts.require(opts.user.as_ref(), "a user", self.engine())?;
        let password = opts.require(opts.password.as_ref(), "a password", self.engine())?;
        let env = vec![format!("PGPASSWORD={password}")];
        if opts.all_databases {
            return BackupCommand::new(env, vec!["pg_dumpall".into(), "-U".into(), user]);
        }
        let database = opts.require(opts.database.as_ref(), "a database", self.engine())?;
        BackupCommand::new(
            env,
            vec!["pg_dump".into(), "-U".into(), user, "-d".into(), database],
        )
    }

    fn sniff_tokens(&self) -> &'static [&'static str] {
        &["postgresql database dump", "pg_dump", "create", "copy"]
    }
}

#[derive(Debug)]
pub struct SqliteStrategy;

impl DumpStrategy for SqliteStrategy {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand> {
        let database = opts.require(opts.database.as_ref(), "a database path", self.engine())?;
        BackupCommand::new(Vec::new(), vec!["sqlite3".into(), database, ".dump".into()])
    }

    fn sniff_tokens(&self) -> &'static [&'static str] {
        &["sqlite", "pragma", "create", "insert"]
    }
}

#[derive(Debug)]
pub struct MongoStrategy;

impl DumpStrategy for MongoStrategy {
    fn engine(&self) -> &'static str {
        "mongodb"
    }

    fn command(&self, opts: &DumpOptions) -> Result<BackupCommand> {
        let database = opts.require(opts.database.as_ref(), "a database", self.engine())?;
        let mut cmd = vec!["mongodump".into(), "--db".into(), database];
        if let (Some(user), Some(password)) = (opts.user.as_ref(), opts.password.as_ref()) {
            cmd.push("--username".into());
            cmd.push(user.clone());
            cmd.push("--password".into());
            cmd.push(password.clone());
        }
        BackupCommand::new(Vec::new(), cmd)
    }

    fn sniff_tokens(&self) -> &'static [&'static str] {
        &["mongodump", "bson", "collection"]
    }
}

/// Engine-name → strategy mapping. Registration is idempotent; later
/// registrations under the same name win, so callers can override at startup.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn DumpStrategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("mysql", Arc::new(MysqlStrategy::mysql()));
        registry.register("mariadb", Arc::new(MysqlStrategy::mariadb()));
        let postgres: Arc<dyn DumpStrategy> = Arc::new(PostgresStrategy);
        registry.register("postgres", postgres.clone());
        registry.register("postgresql", postgres);
        registry.register("sqlite", Arc::new(SqliteStrategy));
        registry.register("mongodb", Arc::new(MongoStrategy));
        registry
    }

    pub fn register(&mut self, engine: &str, strategy: Arc<dyn DumpStrategy>) {
        self.strategies
            .insert(engine.trim().to_ascii_lowercase(), strategy);
    }

    pub fn supports(&self, engine: &str) -> bool {
        self.strategies
            .contains_key(&engine.trim().to_ascii_lowercase())
    }

    pub fn lookup(&self, engine: &str) -> Result<Arc<dyn DumpStrategy>> {
        self.strategies
            .get(&engine.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnsupportedEngine(engine.trim().to_string()))
    }

    pub fn engines(&self) -> Vec<String> {
        let mut engines: Vec<String> = self.strategies.keys().cloned().collect();
        engines.sort();
        engines
    }
}

/// Warning-only content check over the first lines of a dump (lowercased).
pub fn sniff_matches(lines: &[String], tokens: &[&str]) -> bool {
    lines
        .iter()
        .any(|line| tokens.iter().any(|token| line.contains(token)))
}
