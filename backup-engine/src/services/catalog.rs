use crate::error::CatalogError;
use crate::models::backup_task::{self, BackupTask, CreateBackupTaskRequest, SESSION_TEMP_DIR};
use crate::models::host::{self, CreateHostRequest, Host};
use crate::services::cron::{self, CronSchedule};
use crate::services::hooks;
use crate::services::versioning::{ENCRYPTED_SUFFIX, LATEST};
use crate::state::AppState;
use std::sync::Arc;

async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, CatalogError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
{
    let db = state.db.clone();
    let value = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        f(&*conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(value)
}

pub async fn create_host(state: &Arc<AppState>, req: CreateHostRequest) -> Result<Host, CatalogError> {
    if req.name.trim().is_empty() || req.hostname.trim().is_empty() || req.user.trim().is_empty() {
        return Err(CatalogError::Invalid("name, hostname and user are required".into()));
    }
    if req.port == 0 {
        return Err(CatalogError::Invalid("port must be between 1 and 65535".into()));
    }
    let slug = host::slugify(&req.name);
    if slug.is_empty() {
        return Err(CatalogError::Invalid(format!(
            "host name {:?} has no usable characters",
            req.name
        )));
    }

    let created = blocking(state, move |conn| {
        if host::find_all(conn)?.iter().any(|h| h.path == slug) {
            return Ok(None);
        }
        host::create(conn, &req).map(Some)
    })
    .await?;
    let host = created.ok_or_else(|| CatalogError::Conflict("A host with this name already exists".into()))?;
    tracing::info!(host_id = %host.id, path = %host.path, "Host created");
    Ok(host)
}

pub async fn list_hosts(state: &Arc<AppState>) -> Result<Vec<Host>, CatalogError> {
    blocking(state, host::find_all).await
}

pub async fn get_host(state: &Arc<AppState>, id: &str) -> Result<Host, CatalogError> {
    let hid = id.to_string();
    blocking(state, move |conn| host::find_by_id(conn, &hid))
        .await?
        .ok_or_else(|| CatalogError::HostNotFound(id.to_string()))
}

/// Removes the host and its tasks. Stored backups stay on disk.
pub async fn delete_host(state: &Arc<AppState>, id: &str) -> Result<(), CatalogError> {
    let hid = id.to_string();
    let task_ids = blocking(state, move |conn| {
        let tasks = backup_task::find_by_host_id(conn, &hid)?;
        if !host::delete(conn, &hid)? {
            return Ok(None);
        }
        Ok(Some(tasks.into_iter().map(|t| t.id).collect::<Vec<_>>()))
    })
    .await?
    .ok_or_else(|| CatalogError::HostNotFound(id.to_string()))?;

    for task_id in &task_ids {
        state.events.forget(task_id);
    }
    state.host_semaphores.remove(id);
    tracing::info!(host_id = %id, tasks = task_ids.len(), "Host deleted");
    Ok(())
}

/// A single path segment that cannot collide with version bookkeeping.
fn validate_destination(destination: &str) -> Result<(), CatalogError> {
    let bad = destination.is_empty()
        || destination.contains('/')
        || destination.contains('\0')
        || destination.starts_with('.')
        || destination == LATEST
        || destination.ends_with(ENCRYPTED_SUFFIX);
    if bad {
        return Err(CatalogError::Invalid(format!(
            "invalid destination {destination:?}: must be a plain directory name"
        )));
    }
    Ok(())
}

fn validate_source(path: &str) -> Result<(), CatalogError> {
    if path == SESSION_TEMP_DIR || path.starts_with('/') {
        Ok(())
    } else {
        Err(CatalogError::Invalid(format!(
            "source path {path:?} must be absolute or {SESSION_TEMP_DIR}"
        )))
    }
}

/// Validates, then persists. Nothing is stored when any check fails.
pub async fn create_backup_task(
    state: &Arc<AppState>,
    mut req: CreateBackupTaskRequest,
) -> Result<BackupTask, CatalogError> {
    let now = state.clock.now();
    let schedule = cron::validate(&req.schedule, now)?;
    req.schedule = schedule.expression().to_string();

    req.destination = req.destination.trim().to_string();
    validate_destination(&req.destination)?;
    validate_source(&req.path)?;
    if req.retention < 0 {
        return Err(CatalogError::Invalid("retention must not be negative".into()));
    }
    req.excludes = req
        .excludes
        .iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    for hook in &req.hooks {
        hooks::validate_name(&hook.name).map_err(|e| CatalogError::Invalid(e.to_string()))?;
    }
    if req.encrypted && state.master_key.is_none() {
        return Err(CatalogError::Invalid(
            "encrypted backups require ENCRYPTION_KEY to be configured".into(),
        ));
    }

    let next_run = if req.enabled { schedule.next_after(now) } else { None };
    let host_id = req.host_id.clone();
    enum Created {
        Task(BackupTask),
        NoHost,
        Duplicate,
    }
    let created = blocking(state, move |conn| {
        if host::find_by_id(conn, &req.host_id)?.is_none() {
            return Ok(Created::NoHost);
        }
        let taken = backup_task::find_by_host_id(conn, &req.host_id)?
            .iter()
            .any(|t| t.destination == req.destination);
        if taken {
            return Ok(Created::Duplicate);
        }
        backup_task::create(conn, &req, next_run).map(Created::Task)
    })
    .await?;

    match created {
        Created::Task(task) => {
            tracing::info!(backup_id = %task.id, host_id = %task.host_id, schedule = %task.schedule, next_run = ?task.next_run_at, "Backup task created");
            Ok(task)
        }
        Created::NoHost => Err(CatalogError::HostNotFound(host_id)),
        Created::Duplicate => Err(CatalogError::Conflict(
            "This host already has a backup with that destination".into(),
        )),
    }
}

pub async fn list_backup_tasks(state: &Arc<AppState>) -> Result<Vec<BackupTask>, CatalogError> {
    blocking(state, backup_task::find_all).await
}

pub async fn get_backup_task(state: &Arc<AppState>, id: &str) -> Result<BackupTask, CatalogError> {
    let tid = id.to_string();
    blocking(state, move |conn| backup_task::find_by_id(conn, &tid))
        .await?
        .ok_or_else(|| CatalogError::TaskNotFound(id.to_string()))
}

pub async fn list_host_tasks(
    state: &Arc<AppState>,
    host_id: &str,
) -> Result<Vec<BackupTask>, CatalogError> {
    let hid = host_id.to_string();
    blocking(state, move |conn| {
        if host::find_by_id(conn, &hid)?.is_none() {
            return Ok(None);
        }
        backup_task::find_by_host_id(conn, &hid).map(Some)
    })
    .await?
    .ok_or_else(|| CatalogError::HostNotFound(host_id.to_string()))
}

/// Deletes the task with its hooks and error log. A run in flight finishes but its
/// result is discarded.
pub async fn delete_backup_task(state: &Arc<AppState>, id: &str) -> Result<(), CatalogError> {
    let tid = id.to_string();
    if !blocking(state, move |conn| backup_task::delete(conn, &tid)).await? {
        return Err(CatalogError::TaskNotFound(id.to_string()));
    }
    state.events.forget(id);
    tracing::info!(backup_id = %id, "Backup task deleted");
    Ok(())
}

/// Enabling schedules the next fire from now; disabling clears it.
pub async fn set_task_enabled(
    state: &Arc<AppState>,
    id: &str,
    enabled: bool,
) -> Result<BackupTask, CatalogError> {
    let now = state.clock.now();
    let running = state.leases.is_running(id);
    let tid = id.to_string();
    blocking(state, move |conn| {
        let Some(task) = backup_task::find_by_id(conn, &tid)? else {
            return Ok(None);
        };
        // A running task is rescheduled when it finishes.
        let next_run = if enabled && !running {
            CronSchedule::parse(&task.schedule)
                .ok()
                .and_then(|s| s.next_after(now))
        } else {
            None
        };
        backup_task::set_enabled(conn, &tid, enabled, next_run)?;
        backup_task::find_by_id(conn, &tid)
    })
    .await?
    .ok_or_else(|| CatalogError::TaskNotFound(id.to_string()))
}
