use crate::db::connection::DbPool;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  hostname TEXT NOT NULL,
  ssh_user TEXT NOT NULL,
  port INTEGER NOT NULL DEFAULT 22,
  path TEXT NOT NULL UNIQUE,
  is_workstation INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_tasks (
  id TEXT PRIMARY KEY,
  host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
  path TEXT NOT NULL,
  destination TEXT NOT NULL,
  schedule TEXT NOT NULL,
  excludes TEXT NOT NULL DEFAULT '[]',
  incremental INTEGER NOT NULL DEFAULT 0,
  retention INTEGER NOT NULL DEFAULT 0,
  encrypted INTEGER NOT NULL DEFAULT 0,
  enabled INTEGER NOT NULL DEFAULT 1,
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','completed','failed')),
  last_run TEXT NOT NULL DEFAULT '0001-01-01T00:00:00Z',
  next_run_at TEXT,
  size TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(host_id, destination)
);

CREATE TABLE IF NOT EXISTS backup_hooks (
  id TEXT PRIMARY KEY,
  backup_id TEXT NOT NULL REFERENCES backup_tasks(id) ON DELETE CASCADE,
  position INTEGER NOT NULL,
  name TEXT NOT NULL,
  phase TEXT NOT NULL CHECK(phase IN ('pre','post')),
  enabled INTEGER NOT NULL DEFAULT 1,
  params TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS backup_errors (
  id TEXT PRIMARY KEY,
  seq INTEGER NOT NULL,
  backup_id TEXT NOT NULL REFERENCES backup_tasks(id) ON DELETE CASCADE,
  job_id TEXT NOT NULL,
  error_message TEXT NOT NULL,
  occurred_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_tasks_host_id ON backup_tasks(host_id);
CREATE INDEX IF NOT EXISTS idx_backup_tasks_next_run ON backup_tasks(next_run_at);
CREATE INDEX IF NOT EXISTS idx_backup_hooks_backup_id ON backup_hooks(backup_id, position);
CREATE INDEX IF NOT EXISTS idx_backup_errors_backup_id ON backup_errors(backup_id, seq);
"#;

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
