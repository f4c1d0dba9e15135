use globset::{Glob, GlobMatcher};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::error::{CatalogError, RestoreError};
use crate::models::backup_task::{self, BackupTask};
use crate::models::host::{self, Host};
use crate::services::orchestrator::{destination_path, load_task_and_host};
use crate::services::restore::{checked_subpath, locate_artifact};
use crate::services::versioning;
use crate::state::AppState;

pub const MAX_SEARCH_RESULTS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub name: String,
    pub encrypted: bool,
    pub latest: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMatch {
    pub backup_id: String,
    pub host_name: String,
    /// Version holding the file; `None` for non-incremental backups.
    pub version: Option<String>,
    /// Path relative to the backed up content.
    pub path: String,
}

impl From<RestoreError> for CatalogError {
    fn from(e: RestoreError) -> Self {
        match e {
            RestoreError::NothingToRestore => CatalogError::NotFound("backup has not completed yet".into()),
            RestoreError::UnknownVersion(v) => CatalogError::NotFound(format!("version {v} not found")),
            RestoreError::PathNotFound(p) => CatalogError::NotFound(format!("path {p} not found in backup")),
            other => CatalogError::Store(anyhow::Error::new(other)),
        }
    }
}

/// Versions of an incremental task, oldest first. Empty for other tasks.
pub async fn list_backup_versions(
    state: &Arc<AppState>,
    backup_id: &str,
) -> Result<Vec<VersionInfo>, CatalogError> {
    let (task, host) = load_task_and_host(state, backup_id).await?;
    if !task.incremental {
        return Ok(Vec::new());
    }
    let dest = destination_path(&state.config.backup_root, &host, &task);
    let versions = tokio::task::spawn_blocking(move || {
        let latest = versioning::latest_target_name(&dest)?;
        let versions = versioning::list_versions(&dest)?
            .into_iter()
            .map(|v| VersionInfo {
                latest: latest.as_deref() == Some(v.name.as_str()),
                name: v.name,
                encrypted: v.encrypted,
            })
            .collect::<Vec<_>>();
        Ok::<_, io::Error>(versions)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?
    .map_err(anyhow::Error::from)?;
    Ok(versions)
}

/// Directory listing inside a plaintext backup, sorted by name.
pub async fn list_files(
    state: &Arc<AppState>,
    backup_id: &str,
    version: Option<&str>,
    path: Option<&str>,
) -> Result<Vec<FileEntry>, CatalogError> {
    let sub = match path.filter(|p| !p.trim().is_empty()) {
        Some(p) => checked_subpath(p)?,
        None => PathBuf::new(),
    };
    let (task, host) = load_task_and_host(state, backup_id).await?;
    if task.encrypted {
        return Err(CatalogError::Invalid(
            "encrypted backups cannot be browsed, restore them instead".into(),
        ));
    }
    let dest = destination_path(&state.config.backup_root, &host, &task);
    let version = version.map(str::to_string);
    tokio::task::spawn_blocking(move || {
        let (root, _) = locate_artifact(&dest, &task, version.as_deref())?;
        let dir = versioning::resolve_content_root(&root, &task.path).join(&sub);
        match fs::metadata(&dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(CatalogError::Invalid(format!("{} is not a directory", sub.display())));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CatalogError::NotFound(format!("path {} not found in backup", sub.display())));
            }
            _ => {}
        }
        read_entries(&dir).map_err(|e| CatalogError::Store(e.into()))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?
}

fn read_entries(dir: &Path) -> io::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Plaintext trees of a task with the version they belong to.
fn searchable_roots(dest: &Path, task: &BackupTask) -> io::Result<Vec<(Option<String>, PathBuf)>> {
    if task.encrypted {
        return Ok(Vec::new());
    }
    if !task.incremental {
        return Ok(if dest.is_dir() { vec![(None, dest.to_path_buf())] } else { Vec::new() });
    }
    Ok(versioning::list_versions(dest)?
        .into_iter()
        .filter(|v| !v.encrypted)
        .map(|v| (Some(v.name), v.path))
        .collect())
}

fn search_task(
    matcher: &GlobMatcher,
    dest: &Path,
    task: &BackupTask,
    host: &Host,
    limit: usize,
    out: &mut Vec<FileMatch>,
) -> io::Result<()> {
    for (version, root) in searchable_roots(dest, task)? {
        let content = versioning::resolve_content_root(&root, &task.path);
        for entry in WalkDir::new(&content).min_depth(1).follow_links(false) {
            let Ok(entry) = entry else { continue };
            if !matcher.is_match(Path::new(entry.file_name())) {
                continue;
            }
            let rel = entry.path().strip_prefix(&content).unwrap_or(entry.path());
            out.push(FileMatch {
                backup_id: task.id.clone(),
                host_name: host.name.clone(),
                version: version.clone(),
                path: rel.display().to_string(),
            });
            if out.len() >= limit {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Finds files whose name matches a glob (`*.sql`, `report-??.pdf`) across every
/// plaintext backup. Encrypted backups are not searched.
pub async fn search_files(
    state: &Arc<AppState>,
    pattern: &str,
    limit: usize,
) -> Result<Vec<FileMatch>, CatalogError> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(CatalogError::Invalid("search pattern is required".into()));
    }
    let matcher = Glob::new(pattern)
        .map_err(|e| CatalogError::Invalid(format!("invalid search pattern: {e}")))?
        .compile_matcher();
    let limit = limit.clamp(1, MAX_SEARCH_RESULTS);

    let db = state.db.clone();
    let backup_root = state.config.backup_root.clone();
    let found = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let tasks = backup_task::find_all(&conn)?;
        let hosts: HashMap<String, Host> = host::find_all(&conn)?
            .into_iter()
            .map(|h| (h.id.clone(), h))
            .collect();
        drop(conn);

        let mut found = Vec::new();
        for task in &tasks {
            let Some(host) = hosts.get(&task.host_id) else { continue };
            let dest = destination_path(&backup_root, host, task);
            if let Err(e) = search_task(&matcher, &dest, task, host, limit, &mut found) {
                tracing::warn!(backup_id = %task.id, error = %e, "Skipping unreadable backup during search");
            }
            if found.len() >= limit {
                break;
            }
        }
        Ok::<_, anyhow::Error>(found)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(found)
}
