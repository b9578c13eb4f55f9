const USAGE: &str = "\
Baktainer — label-driven database backup for Docker containers

USAGE:
    baktainer [OPTIONS]

OPTIONS:
    -h, --help       Print this help message and exit
    -v, --version    Print version and exit
    -N, --now        Run one backup cycle immediately and exit

ENVIRONMENT VARIABLES (defaults shown):
    BT_DOCKER_URL                 Docker endpoint                  [unix:///var/run/docker.sock]
    BT_CRON                       5-field cron schedule            [0 0 * * *]
    BT_THREADS                    Concurrent backup workers (1-50) [4]
    BT_LOG_LEVEL                  debug | info | warn | error      [info]
    BT_BACKUP_DIR                 Artifact root (absolute path)    [/backups]
    BT_COMPRESS                   Gzip dumps                       [true]

TLS (Docker over https):
    BT_SSL                        Enable client TLS                [false]
    BT_CA, BT_CERT, BT_KEY        CA / client cert / client key (path or inline PEM)

ROTATION:
    BT_ROTATION_ENABLED           Apply retention after each cycle [true]
    BT_RETENTION_DAYS             Max artifact age in days (0-365) [30]
    BT_RETENTION_COUNT            Max artifacts per container, 0 = unlimited [0]
    BT_MIN_FREE_SPACE_GB          Free-space floor, 0 = disabled   [10]

ENCRYPTION (at rest, AES-256-GCM):
    BT_ENCRYPTION_ENABLED         Encrypt published artifacts      [false]
    BT_ENCRYPTION_KEY             Raw/hex/base64: key or derivation input
    BT_ENCRYPTION_KEY_FILE        File containing the key
    BT_ENCRYPTION_PASSPHRASE      Passphrase (PBKDF2-derived key)

NOTIFICATIONS:
    BT_NOTIFICATION_CHANNELS      Comma list: log,webhook,slack,discord,teams,email
    BT_NOTIFY_SUCCESS             [false]   BT_NOTIFY_FAILURES  [true]
    BT_NOTIFY_WARNINGS            [true]    BT_NOTIFY_HEALTH    [true]
    BT_NOTIFY_SUMMARY             [false]
    BT_WEBHOOK_URL / BT_SLACK_WEBHOOK_URL / BT_DISCORD_WEBHOOK_URL / BT_TEAMS_WEBHOOK_URL

OBSERVABILITY:
    BT_HEALTH_SERVER_ENABLED      Serve /health /status /metrics   [false]
    BT_HEALTH_BIND                Bind address                     [0.0.0.0]
    BT_HEALTH_PORT                Port                             [8080]

CONTAINER LABELS (on the databases to back up):
    baktainer.backup=true         required opt-in
    baktainer.db.engine           mysql | mariadb | postgres | postgresql | sqlite
    baktainer.db.name             database name (or sqlite file path)
    baktainer.db.user             required unless engine=sqlite
    baktainer.db.password         required unless engine=sqlite
    baktainer.name                artifact base name      [container name]
    baktainer.db.all              dump all databases      [false]
    baktainer.backup.compress     per-container override
    baktainer.backup.encrypt      per-container override
    baktainer.backup.retention.days / .retention.count / .priority
";

pub fn print_usage() {
    print!("{USAGE}");
}

pub fn print_version(version: &str) {
    println!("baktainer {version}");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliAction {
    Exit,
    RunOnce,
    RunScheduler,
}

fn cli_action_from_args(args: &[String], version: &str) -> CliAction {
    let mut run_once = false;
    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return CliAction::Exit;
            }
            "-v" | "--version" => {
                print_version(version);
                return CliAction::Exit;
            }
            "-N" | "--now" => run_once = true,
            _ => {}
        }
    }
    if run_once {
        CliAction::RunOnce
    } else {
        CliAction::RunScheduler
    }
}

/// Scan CLI args for the supported flags.
pub fn cli_action(version: &str) -> CliAction {
    let args: Vec<String> = std::env::args().skip(1).collect();
    cli_action_from_args(&args, version)
}
