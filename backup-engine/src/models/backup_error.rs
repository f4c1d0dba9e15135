use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{from_db_ts, to_db_ts};

/// Append-only; removed only in bulk per backup task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupError {
    pub id: String,
    pub backup_id: String,
    pub job_id: String,
    pub error_message: String,
    pub occurred_at: DateTime<Utc>,
}

fn row_to_error(row: &Row) -> rusqlite::Result<BackupError> {
    let occurred_at: String = row.get("occurred_at")?;
    Ok(BackupError {
        id: row.get("id")?,
        backup_id: row.get("backup_id")?,
        job_id: row.get("job_id")?,
        error_message: row.get("error_message")?,
        occurred_at: from_db_ts(&occurred_at)?,
    })
}

pub fn append(
    conn: &Connection,
    backup_id: &str,
    job_id: &str,
    error_message: &str,
    occurred_at: DateTime<Utc>,
) -> anyhow::Result<BackupError> {
    let id = Uuid::new_v4().to_string();
    // seq keeps occurrence order even when timestamps collide.
    conn.execute(
        "INSERT INTO backup_errors (id, seq, backup_id, job_id, error_message, occurred_at)
         VALUES (?1, (SELECT COALESCE(MAX(seq), 0) + 1 FROM backup_errors WHERE backup_id = ?2), ?2, ?3, ?4, ?5)",
        params![id, backup_id, job_id, error_message, to_db_ts(occurred_at)],
    )?;
    Ok(BackupError {
        id,
        backup_id: backup_id.to_string(),
        job_id: job_id.to_string(),
        error_message: error_message.to_string(),
        occurred_at,
    })
}

/// Page of errors in occurrence order. `page` is 1-based.
pub fn find_by_backup(
    conn: &Connection,
    backup_id: &str,
    page: u32,
    limit: u32,
) -> anyhow::Result<Vec<BackupError>> {
    let offset = page.saturating_sub(1) as i64 * limit as i64;
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_errors WHERE backup_id = ? ORDER BY seq ASC LIMIT ? OFFSET ?",
    )?;
    let rows = stmt.query_map(params![backup_id, limit as i64, offset], row_to_error)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_by_backup(conn: &Connection, backup_id: &str) -> anyhow::Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM backup_errors WHERE backup_id = ?",
        params![backup_id],
        |r| r.get(0),
    )?)
}

pub fn delete_by_backup(conn: &Connection, backup_id: &str) -> anyhow::Result<usize> {
    Ok(conn.execute(
        "DELETE FROM backup_errors WHERE backup_id = ?",
        params![backup_id],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::create_pool;
    use crate::db::migrate::migrate;
    use crate::models::backup_task::{self, CreateBackupTaskRequest};
    use crate::models::host::{self, CreateHostRequest};
    use tempfile::TempDir;

    #[test]
    fn test_append_paginate_and_clear() {
        let tmp = TempDir::new().unwrap();
        let pool = create_pool(tmp.path().join("test.db").to_str().unwrap()).unwrap();
        migrate(&pool, tmp.path()).unwrap();
        let conn = pool.get().unwrap();

        let h = host::create(
            &conn,
            &CreateHostRequest {
                name: "db".into(),
                hostname: "10.0.0.2".into(),
                user: "root".into(),
                port: 22,
                is_workstation: false,
            },
        )
        .unwrap();
        let task = backup_task::create(
            &conn,
            &CreateBackupTaskRequest {
                host_id: h.id.clone(),
                path: "/var/lib/db".into(),
                destination: "db".into(),
                schedule: "@daily".into(),
                excludes: vec![],
                incremental: false,
                retention: 0,
                encrypted: false,
                enabled: true,
                hooks: vec![],
            },
            None,
        )
        .unwrap();

        // Same timestamp on purpose: ordering must come from insertion order.
        let at = Utc::now();
        for i in 0..5 {
            append(&conn, &task.id, &format!("job-{i}"), &format!("error {i}"), at).unwrap();
        }
        assert_eq!(count_by_backup(&conn, &task.id).unwrap(), 5);

        let first = find_by_backup(&conn, &task.id, 1, 2).unwrap();
        let msgs: Vec<_> = first.iter().map(|e| e.error_message.as_str()).collect();
        assert_eq!(msgs, vec!["error 0", "error 1"]);

        let last = find_by_backup(&conn, &task.id, 3, 2).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].job_id, "job-4");

        assert_eq!(delete_by_backup(&conn, &task.id).unwrap(), 5);
        assert_eq!(count_by_backup(&conn, &task.id).unwrap(), 0);
    }
}
