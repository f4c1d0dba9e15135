use crate::error::CatalogError;
use crate::models::{backup_error, backup_error::BackupError, backup_task};
use crate::state::AppState;
use serde::Serialize;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPage {
    pub errors: Vec<BackupError>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

/// Appends an entry outside of a run, e.g. for maintenance failures.
pub async fn record_error(
    state: &Arc<AppState>,
    backup_id: &str,
    job_id: &str,
    message: &str,
) -> Result<BackupError, CatalogError> {
    let db = state.db.clone();
    let (bid, jid, msg) = (backup_id.to_string(), job_id.to_string(), message.to_string());
    let at = state.clock.now();
    let entry = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        if backup_task::find_by_id(&conn, &bid)?.is_none() {
            return Ok::<_, anyhow::Error>(None);
        }
        backup_error::append(&conn, &bid, &jid, &msg, at).map(Some)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    entry.ok_or_else(|| CatalogError::TaskNotFound(backup_id.to_string()))
}

/// One page of a task's errors in occurrence order. `page` starts at 1.
pub async fn list_backup_errors(
    state: &Arc<AppState>,
    backup_id: &str,
    page: u32,
    limit: u32,
) -> Result<ErrorPage, CatalogError> {
    let page = page.max(1);
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    let db = state.db.clone();
    let bid = backup_id.to_string();
    let found = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        if backup_task::find_by_id(&conn, &bid)?.is_none() {
            return Ok::<_, anyhow::Error>(None);
        }
        let errors = backup_error::find_by_backup(&conn, &bid, page, limit)?;
        let total = backup_error::count_by_backup(&conn, &bid)?;
        Ok(Some((errors, total)))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let (errors, total) = found.ok_or_else(|| CatalogError::TaskNotFound(backup_id.to_string()))?;
    Ok(ErrorPage {
        errors,
        total,
        page,
        limit,
    })
}

pub async fn clear_backup_errors(state: &Arc<AppState>, backup_id: &str) -> Result<usize, CatalogError> {
    let db = state.db.clone();
    let bid = backup_id.to_string();
    let cleared = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        if backup_task::find_by_id(&conn, &bid)?.is_none() {
            return Ok::<_, anyhow::Error>(None);
        }
        backup_error::delete_by_backup(&conn, &bid).map(Some)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??
    .ok_or_else(|| CatalogError::TaskNotFound(backup_id.to_string()))?;

    tracing::info!(backup_id = %backup_id, cleared, "Backup errors cleared");
    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[tokio::test]
    async fn test_record_list_clear() {
        let env = TestEnv::new();
        let host = env.host("Web", false);
        let task = env.task(TestEnv::request(&host.id, "/data", "site"));

        for n in 0..5 {
            record_error(&env.state, &task.id, "job-1", &format!("error {n}"))
                .await
                .unwrap();
        }

        let first = list_backup_errors(&env.state, &task.id, 1, 2).await.unwrap();
        assert_eq!(first.total, 5);
        let messages: Vec<&str> = first.errors.iter().map(|e| e.error_message.as_str()).collect();
        assert_eq!(messages, ["error 0", "error 1"]);

        let last = list_backup_errors(&env.state, &task.id, 3, 2).await.unwrap();
        assert_eq!(last.errors.len(), 1);
        assert_eq!(last.errors[0].error_message, "error 4");

        // Page 0 is treated as the first page.
        assert_eq!(list_backup_errors(&env.state, &task.id, 0, 2).await.unwrap().page, 1);

        assert_eq!(clear_backup_errors(&env.state, &task.id).await.unwrap(), 5);
        assert_eq!(list_backup_errors(&env.state, &task.id, 1, 20).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let env = TestEnv::new();
        assert!(matches!(
            list_backup_errors(&env.state, "nope", 1, 20).await,
            Err(CatalogError::TaskNotFound(_))
        ));
        assert!(matches!(
            record_error(&env.state, "nope", "j", "m").await,
            Err(CatalogError::TaskNotFound(_))
        ));
        assert!(matches!(
            clear_backup_errors(&env.state, "nope").await,
            Err(CatalogError::TaskNotFound(_))
        ));
    }
}
