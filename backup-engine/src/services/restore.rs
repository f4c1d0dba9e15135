use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::crypto::{self, MasterKey};
use crate::error::{CatalogError, CryptoError, RestoreError};
use crate::models::backup_task::{self, BackupTask};
use crate::models::{host, host::Host};
use crate::services::orchestrator::destination_path;
use crate::services::size_estimator::{TaskData, TaskResult};
use crate::services::versioning::{self, ENCRYPTED_SUFFIX};
use crate::state::AppState;
use crate::transfer::{LocalTransport, Transport};

/// Where restored content goes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestoreTarget {
    /// A directory on the engine's machine. It must not exist yet.
    Local { dir: PathBuf },
    /// `path` on a registered host, written through the configured transport.
    Host {
        #[serde(rename = "hostId")]
        host_id: String,
        path: String,
    },
}

/// What to restore. Defaults to the whole of the newest backup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestoreSelection {
    /// Version name of an incremental task; `latest` when absent.
    pub version: Option<String>,
    /// Path inside the backed up content.
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub backup_id: String,
    pub version: Option<String>,
    pub target: String,
    pub files: u64,
}

struct RestoreJob {
    task: BackupTask,
    host: Host,
    selection: RestoreSelection,
    target: RestoreTarget,
    target_host: Option<Host>,
    backup_root: PathBuf,
    transport: Arc<dyn Transport>,
    master_key: Option<MasterKey>,
}

/// A relative path with no `..`, `.` or root components.
pub(crate) fn checked_subpath(raw: &str) -> Result<PathBuf, CatalogError> {
    let trimmed = raw.trim().trim_start_matches('/');
    let path = PathBuf::from(trimmed);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(CatalogError::Invalid(format!("invalid path inside backup: {raw:?}")));
    }
    Ok(path)
}

/// The stored artifact a selection refers to: a plaintext directory or an archive.
pub(crate) fn locate_artifact(
    dest: &Path,
    task: &BackupTask,
    version: Option<&str>,
) -> Result<(PathBuf, Option<String>), RestoreError> {
    if !task.incremental {
        if let Some(v) = version {
            return Err(RestoreError::UnknownVersion(v.to_string()));
        }
        let artifact = if task.encrypted {
            dest.with_file_name(format!("{}{ENCRYPTED_SUFFIX}", task.destination))
        } else {
            dest.to_path_buf()
        };
        if !artifact.exists() {
            return Err(RestoreError::NothingToRestore);
        }
        return Ok((artifact, None));
    }

    let name = match version {
        Some(v) => v.to_string(),
        None => versioning::latest_target_name(dest)?.ok_or(RestoreError::NothingToRestore)?,
    };
    let found = versioning::list_versions(dest)?
        .into_iter()
        .find(|v| v.name == name)
        .ok_or_else(|| RestoreError::UnknownVersion(name.clone()))?;
    Ok((found.path, Some(found.name)))
}

fn count_files(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| !e.file_type().is_dir())
        .count() as u64
}

fn execute_restore(job: &RestoreJob) -> Result<RestoreSummary, RestoreError> {
    let task = &job.task;
    let dest = destination_path(&job.backup_root, &job.host, task);
    let (artifact, version) = locate_artifact(&dest, task, job.selection.version.as_deref())?;

    // Encrypted artifacts are unpacked into a scratch directory removed on return.
    let (root, _scratch) = if artifact.is_file() {
        let key = job.master_key.as_ref().ok_or(CryptoError::MissingKey)?;
        let dir = tempfile::Builder::new().prefix("backup-restore-").tempdir()?;
        let out = dir.path().join("content");
        crypto::extract_archive(&artifact, &out, &task.id, key)?;
        (out, Some(dir))
    } else {
        (artifact, None)
    };

    let content = versioning::resolve_content_root(&root, &task.path);
    let source = match job.selection.path.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(sub) => {
            let path = content.join(sub.trim().trim_start_matches('/'));
            if fs::symlink_metadata(&path).is_err() {
                return Err(RestoreError::PathNotFound(sub.to_string()));
            }
            path
        }
        None => content,
    };
    let files = count_files(&source);

    let (summary, target) = match &job.target {
        RestoreTarget::Host { path, .. } => {
            let target_host = job.target_host.as_ref().unwrap_or(&job.host);
            (
                job.transport.push(&source, target_host, path)?,
                format!("{}:{}", target_host.hostname, path),
            )
        }
        RestoreTarget::Local { dir } => {
            let target = dir.display().to_string();
            (LocalTransport::new().push(&source, &job.host, &target)?, target)
        }
    };
    for warning in &summary.warnings {
        tracing::warn!(backup_id = %task.id, warning = %warning, "Restore completed with warnings");
    }

    Ok(RestoreSummary {
        backup_id: task.id.clone(),
        version,
        target,
        files,
    })
}

/// Validates the request and starts the restore in the background. Progress is
/// reported through the task result store under the returned id.
pub async fn restore_backup(
    state: Arc<AppState>,
    backup_id: &str,
    selection: RestoreSelection,
    target: RestoreTarget,
) -> Result<String, CatalogError> {
    if let Some(p) = &selection.path {
        checked_subpath(p)?;
    }
    if let Some(v) = &selection.version {
        checked_subpath(v)?;
    }
    match &target {
        RestoreTarget::Local { dir } => {
            if !dir.is_absolute() {
                return Err(CatalogError::Invalid("restore directory must be absolute".into()));
            }
            if dir.exists() {
                return Err(CatalogError::Conflict(format!("{} already exists", dir.display())));
            }
        }
        RestoreTarget::Host { path, .. } => {
            if !path.starts_with('/') {
                return Err(CatalogError::Invalid("restore path must be absolute".into()));
            }
        }
    }

    let db = state.db.clone();
    let bid = backup_id.to_string();
    let target_host_id = match &target {
        RestoreTarget::Host { host_id, .. } => Some(host_id.clone()),
        RestoreTarget::Local { .. } => None,
    };
    let loaded = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let Some(task) = backup_task::find_by_id(&conn, &bid)? else {
            return Ok::<_, anyhow::Error>(Err(CatalogError::TaskNotFound(bid)));
        };
        let Some(host) = host::find_by_id(&conn, &task.host_id)? else {
            return Ok(Err(CatalogError::HostNotFound(task.host_id)));
        };
        let target_host = match target_host_id {
            Some(id) => match host::find_by_id(&conn, &id)? {
                Some(h) => Some(h),
                None => return Ok(Err(CatalogError::HostNotFound(id))),
            },
            None => None,
        };
        Ok(Ok((task, host, target_host)))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))???;
    let (task, host, target_host) = loaded;

    if task.encrypted && state.master_key.is_none() {
        return Err(CatalogError::Invalid(
            "backup is encrypted and ENCRYPTION_KEY is not configured".into(),
        ));
    }

    let task_id = Uuid::new_v4().to_string();
    state.task_results.put(&task_id, TaskResult::Pending);
    tracing::info!(task_id = %task_id, backup_id = %task.id, destination = ?target, "Restore accepted");

    let job = RestoreJob {
        task,
        host,
        selection,
        target,
        target_host,
        backup_root: state.config.backup_root.clone(),
        transport: state.transport.clone(),
        master_key: state.master_key.clone(),
    };
    let tid = task_id.clone();
    tokio::spawn(async move {
        let backup_id = job.task.id.clone();
        let outcome = tokio::task::spawn_blocking(move || execute_restore(&job)).await;
        let result = match outcome {
            Ok(Ok(summary)) => {
                tracing::info!(task_id = %tid, backup_id = %backup_id, files = summary.files, destination = %summary.target, "Restore completed");
                TaskResult::Completed {
                    data: TaskData::Restore(summary),
                }
            }
            Ok(Err(e)) => {
                tracing::error!(task_id = %tid, backup_id = %backup_id, error = %e, "Restore failed");
                TaskResult::Failed { error: e.to_string() }
            }
            Err(e) => TaskResult::Failed {
                error: format!("Restore worker panicked: {e}"),
            },
        };
        state.task_results.put(&tid, result);
    });

    Ok(task_id)
}
