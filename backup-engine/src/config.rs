use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// rsync over SSH, `du -sk` over an ssh2 session.
    Rsync,
    /// In-process mirror of paths mounted on this machine.
    Local,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub backup_root: PathBuf,
    pub plugin_dir: PathBuf,
    pub ssh_key_path: PathBuf,
    pub encryption_key: Option<String>,
    pub log_level: String,
    pub max_concurrent_global: usize,
    pub max_concurrent_per_host: usize,
    pub scheduler_tick: Duration,
    pub transport: TransportKind,
    pub task_result_ttl: Duration,
    /// Cron schedule of the retention purge over all incremental tasks. `None` disables it.
    pub purge_schedule: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));

        Self {
            port: env_parse("PORT", 8080),
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("backup-engine.db")),
            ssh_key_path: std::env::var("SSH_KEY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("keys").join("id_ed25519")),
            data_dir,
            backup_root: PathBuf::from(
                std::env::var("BACKUP_ROOT").unwrap_or_else(|_| "/mnt/backups".into()),
            ),
            plugin_dir: PathBuf::from(
                std::env::var("PLUGIN_DIR").unwrap_or_else(|_| "/app/plugins".into()),
            ),
            encryption_key: std::env::var("ENCRYPTION_KEY").ok().filter(|k| !k.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            max_concurrent_global: env_parse("MAX_CONCURRENT_GLOBAL", 4).max(1),
            max_concurrent_per_host: env_parse("MAX_CONCURRENT_PER_HOST", 2).max(1),
            scheduler_tick: Duration::from_secs(env_parse("SCHEDULER_TICK_SECS", 30).max(1)),
            transport: match std::env::var("TRANSPORT").as_deref() {
                Ok("local") => TransportKind::Local,
                _ => TransportKind::Rsync,
            },
            task_result_ttl: Duration::from_secs(env_parse("TASK_RESULT_TTL_SECS", 600)),
            purge_schedule: match std::env::var("PURGE_SCHEDULE") {
                Ok(s) if s.trim().is_empty() || s == "off" => None,
                Ok(s) => Some(s),
                Err(_) => Some("0 4 * * *".into()),
            },
        }
    }

    /// Configuration rooted in a scratch directory, used by tests and local tooling.
    pub fn for_root(root: &std::path::Path) -> Self {
        let data_dir = root.join("data");
        Self {
            port: 0,
            db_path: data_dir.join("backup-engine.db"),
            ssh_key_path: data_dir.join("keys").join("id_ed25519"),
            data_dir,
            backup_root: root.join("backups"),
            plugin_dir: root.join("plugins"),
            encryption_key: None,
            log_level: "debug".into(),
            max_concurrent_global: 4,
            max_concurrent_per_host: 2,
            scheduler_tick: Duration::from_secs(1),
            transport: TransportKind::Local,
            task_result_ttl: Duration::from_secs(600),
            purge_schedule: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
