use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{from_db_ts, never, to_db_ts};

/// Source path placeholder for a per-run local scratch directory.
pub const SESSION_TEMP_DIR: &str = "{{SESSION_TEMP_DIR}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "running" => Ok(BackupStatus::Running),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(anyhow::anyhow!("unknown backup status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHook {
    pub id: String,
    pub name: String,
    pub phase: HookPhase,
    pub enabled: bool,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupTask {
    pub id: String,
    pub host_id: String,
    pub path: String,
    pub destination: String,
    pub schedule: String,
    pub excludes: Vec<String>,
    pub incremental: bool,
    pub retention: i64,
    pub encrypted: bool,
    pub enabled: bool,
    pub hooks: Vec<BackupHook>,
    pub status: BackupStatus,
    pub last_run: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub size: String,
    pub created_at: String,
    pub updated_at: String,
}

impl BackupTask {
    pub fn has_run(&self) -> bool {
        self.last_run > never()
    }

    pub fn display_last_run(&self) -> String {
        if self.has_run() {
            self.last_run.format("%Y-%m-%d %H:%M:%S UTC").to_string()
        } else {
            "Never".into()
        }
    }

    pub fn uses_session_temp_dir(&self) -> bool {
        self.path == SESSION_TEMP_DIR
    }

    pub fn hooks_for(&self, phase: HookPhase) -> impl Iterator<Item = &BackupHook> {
        self.hooks.iter().filter(move |h| h.enabled && h.phase == phase)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSpec {
    pub name: String,
    pub phase: HookPhase,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupTaskRequest {
    pub host_id: String,
    pub path: String,
    pub destination: String,
    pub schedule: String,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub retention: i64,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
}

fn default_true() -> bool {
    true
}

fn conversion_err(e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_task(row: &Row) -> rusqlite::Result<BackupTask> {
    let excludes: String = row.get("excludes")?;
    let status: String = row.get("status")?;
    let last_run: String = row.get("last_run")?;
    let next_run_at: Option<String> = row.get("next_run_at")?;
    Ok(BackupTask {
        id: row.get("id")?,
        host_id: row.get("host_id")?,
        path: row.get("path")?,
        destination: row.get("destination")?,
        schedule: row.get("schedule")?,
        excludes: serde_json::from_str(&excludes).map_err(conversion_err)?,
        incremental: row.get("incremental")?,
        retention: row.get("retention")?,
        encrypted: row.get("encrypted")?,
        enabled: row.get("enabled")?,
        hooks: Vec::new(),
        status: status
            .parse()
            .map_err(|e: anyhow::Error| conversion_err(std::io::Error::other(e.to_string())))?,
        last_run: from_db_ts(&last_run)?,
        next_run_at: next_run_at.as_deref().map(from_db_ts).transpose()?,
        size: row.get("size")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_hook(row: &Row) -> rusqlite::Result<BackupHook> {
    let phase: String = row.get("phase")?;
    let params: String = row.get("params")?;
    Ok(BackupHook {
        id: row.get("id")?,
        name: row.get("name")?,
        phase: if phase == "post" { HookPhase::Post } else { HookPhase::Pre },
        enabled: row.get("enabled")?,
        params: serde_json::from_str(&params).map_err(conversion_err)?,
    })
}

fn load_hooks(conn: &Connection, task: &mut BackupTask) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_hooks WHERE backup_id = ? ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![task.id], row_to_hook)?;
    task.hooks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(())
}

fn query_tasks(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> anyhow::Result<Vec<BackupTask>> {
    let mut stmt = conn.prepare(sql)?;
    let mut tasks = stmt
        .query_map(args, row_to_task)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for task in &mut tasks {
        load_hooks(conn, task)?;
    }
    Ok(tasks)
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<BackupTask>> {
    query_tasks(conn, "SELECT * FROM backup_tasks ORDER BY created_at ASC", [])
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupTask>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_tasks WHERE id = ?")?;
    let Some(mut task) = stmt.query_row(params![id], row_to_task).optional()? else {
        return Ok(None);
    };
    load_hooks(conn, &mut task)?;
    Ok(Some(task))
}

pub fn find_by_host_id(conn: &Connection, host_id: &str) -> anyhow::Result<Vec<BackupTask>> {
    query_tasks(
        conn,
        "SELECT * FROM backup_tasks WHERE host_id = ? ORDER BY created_at ASC",
        params![host_id],
    )
}

/// Enabled tasks whose next fire time is at or before `now`, earliest first.
pub fn find_due(conn: &Connection, now: DateTime<Utc>) -> anyhow::Result<Vec<BackupTask>> {
    query_tasks(
        conn,
        "SELECT * FROM backup_tasks
         WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?
         ORDER BY next_run_at ASC",
        params![to_db_ts(now)],
    )
}

pub fn create(
    conn: &Connection,
    data: &CreateBackupTaskRequest,
    next_run_at: Option<DateTime<Utc>>,
) -> anyhow::Result<BackupTask> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let excludes_json = serde_json::to_string(&data.excludes)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO backup_tasks (id, host_id, path, destination, schedule, excludes, incremental, retention, encrypted, enabled, last_run, next_run_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            id,
            data.host_id,
            data.path,
            data.destination,
            data.schedule,
            excludes_json,
            data.incremental,
            data.retention,
            data.encrypted,
            data.enabled,
            to_db_ts(never()),
            next_run_at.map(to_db_ts),
            now,
            now,
        ],
    )?;
    for (position, hook) in data.hooks.iter().enumerate() {
        tx.execute(
            "INSERT INTO backup_hooks (id, backup_id, position, name, phase, enabled, params)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                id,
                position as i64,
                hook.name,
                hook.phase.as_str(),
                hook.enabled,
                serde_json::to_string(&hook.params)?,
            ],
        )?;
    }
    tx.commit()?;

    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created backup task"))
}

pub fn update_status(conn: &Connection, id: &str, status: BackupStatus) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_tasks SET status = ?, updated_at = datetime('now') WHERE id = ?",
        params![status.as_str(), id],
    )?;
    Ok(changes > 0)
}

/// Successful run: status `completed`, `last_run` and `size` refreshed.
pub fn record_success(
    conn: &Connection,
    id: &str,
    finished_at: DateTime<Utc>,
    size: &str,
) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_tasks SET status = 'completed', last_run = ?, size = ?, updated_at = datetime('now') WHERE id = ?",
        params![to_db_ts(finished_at), size, id],
    )?;
    Ok(changes > 0)
}

pub fn set_next_run(
    conn: &Connection,
    id: &str,
    next_run_at: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE backup_tasks SET next_run_at = ? WHERE id = ?",
        params![next_run_at.map(to_db_ts), id],
    )?;
    Ok(())
}

pub fn set_enabled(
    conn: &Connection,
    id: &str,
    enabled: bool,
    next_run_at: Option<DateTime<Utc>>,
) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE backup_tasks SET enabled = ?, next_run_at = ?, updated_at = datetime('now') WHERE id = ?",
        params![enabled, next_run_at.map(to_db_ts), id],
    )?;
    Ok(changes > 0)
}

/// Tasks left `running` by a previous process never finished; they go back to `pending`.
pub fn reset_stale_running(conn: &Connection) -> anyhow::Result<usize> {
    Ok(conn.execute(
        "UPDATE backup_tasks SET status = 'pending', updated_at = datetime('now') WHERE status = 'running'",
        [],
    )?)
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM backup_tasks WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use crate::models::host::{self, CreateHostRequest};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup() -> (TempDir, crate::db::connection::DbPool, String) {
        let tmp = TempDir::new().unwrap();
        let pool = create_pool(tmp.path().join("test.db").to_str().unwrap()).unwrap();
        migrate(&pool, tmp.path()).unwrap();
        let conn = pool.get().unwrap();
        let h = host::create(
            &conn,
            &CreateHostRequest {
                name: "Web".into(),
                hostname: "ssh-source".into(),
                user: "backup-test".into(),
                port: 22,
                is_workstation: false,
            },
        )
        .unwrap();
        (tmp, pool, h.id)
    }

    fn request(host_id: &str, destination: &str) -> CreateBackupTaskRequest {
        CreateBackupTaskRequest {
            host_id: host_id.into(),
            path: "/mnt/source_data".into(),
            destination: destination.into(),
            schedule: "0 0 * * *".into(),
            excludes: vec!["*.tmp".into()],
            incremental: false,
            retention: 0,
            encrypted: false,
            enabled: true,
            hooks: vec![
                HookSpec {
                    name: "dump".into(),
                    phase: HookPhase::Pre,
                    enabled: true,
                    params: BTreeMap::from([("db".to_string(), "app".to_string())]),
                },
                HookSpec {
                    name: "notify".into(),
                    phase: HookPhase::Post,
                    enabled: false,
                    params: BTreeMap::new(),
                },
            ],
        }
    }

    #[test]
    fn test_create_roundtrips_hooks_in_order() {
        let (_tmp, pool, host_id) = setup();
        let conn = pool.get().unwrap();
        let task = create(&conn, &request(&host_id, "site"), None).unwrap();

        assert_eq!(task.status, BackupStatus::Pending);
        assert!(!task.has_run());
        assert_eq!(task.display_last_run(), "Never");
        assert_eq!(task.excludes, vec!["*.tmp".to_string()]);
        assert_eq!(task.hooks.len(), 2);
        assert_eq!(task.hooks[0].name, "dump");
        assert_eq!(task.hooks[0].params.get("db").map(String::as_str), Some("app"));
        assert_eq!(task.hooks_for(HookPhase::Post).count(), 0);
        assert_eq!(task.hooks_for(HookPhase::Pre).count(), 1);
    }

    #[test]
    fn test_destination_unique_per_host() {
        let (_tmp, pool, host_id) = setup();
        let conn = pool.get().unwrap();
        create(&conn, &request(&host_id, "site"), None).unwrap();
        assert!(create(&conn, &request(&host_id, "site"), None).is_err());
    }

    #[test]
    fn test_find_due_respects_enabled_and_time() {
        let (_tmp, pool, host_id) = setup();
        let conn = pool.get().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let due = create(&conn, &request(&host_id, "a"), Some(t0)).unwrap();
        let later = create(&conn, &request(&host_id, "b"), Some(t0 + chrono::Duration::hours(1))).unwrap();
        let disabled = create(&conn, &request(&host_id, "c"), Some(t0)).unwrap();
        set_enabled(&conn, &disabled.id, false, None).unwrap();

        let ids: Vec<String> = find_due(&conn, t0).unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![due.id.clone()]);

        let ids: Vec<String> = find_due(&conn, t0 + chrono::Duration::hours(2))
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![due.id, later.id]);
    }

    #[test]
    fn test_record_success_updates_last_run() {
        let (_tmp, pool, host_id) = setup();
        let conn = pool.get().unwrap();
        let task = create(&conn, &request(&host_id, "site"), None).unwrap();
        let finished = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();

        assert!(record_success(&conn, &task.id, finished, "12KB").unwrap());
        let task = find_by_id(&conn, &task.id).unwrap().unwrap();
        assert_eq!(task.status, BackupStatus::Completed);
        assert_eq!(task.last_run, finished);
        assert_eq!(task.size, "12KB");
        assert_eq!(task.display_last_run(), "2024-05-01 12:30:00 UTC");
    }

    #[test]
    fn test_host_delete_cascades_and_failed_count() {
        let (_tmp, pool, host_id) = setup();
        let conn = pool.get().unwrap();
        let task = create(&conn, &request(&host_id, "site"), None).unwrap();
        update_status(&conn, &task.id, BackupStatus::Failed).unwrap();

        let h = host::find_by_id(&conn, &host_id).unwrap().unwrap();
        assert_eq!(h.failed_backups_count, 1);

        assert!(host::delete(&conn, &host_id).unwrap());
        assert!(find_by_id(&conn, &task.id).unwrap().is_none());
        let hooks: i64 = conn
            .query_row("SELECT COUNT(*) FROM backup_hooks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hooks, 0);
    }
}
