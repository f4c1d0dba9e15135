use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::crypto::{self, MasterKey};
use crate::error::{CatalogError, CryptoError, HookError, RetentionPruneError, RunError};
use crate::models::backup_task::{self, BackupStatus, BackupTask};
use crate::models::{backup_error, host, host::Host};
use crate::services::cron::CronSchedule;
use crate::services::hooks::{self, HookContext, HookRegistry};
use crate::services::versioning::{self, LinkReport, ENCRYPTED_SUFFIX};
use crate::state::AppState;
use crate::transfer::{self, SyncRequest, SyncSource, SyncSummary, Transport};
use crate::ws::events::EngineEvent;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        size: String,
        artifact: String,
        links: Option<LinkReport>,
    },
    Failed {
        error: String,
    },
    /// Workstation host could not be reached; nothing recorded.
    Skipped {
        reason: String,
    },
    /// The task was deleted while running.
    Discarded,
}

struct ActiveRun {
    job_id: String,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

/// At most one active run per backup task.
#[derive(Clone, Default)]
pub struct RunLeases {
    inner: Arc<DashMap<String, ActiveRun>>,
}

impl RunLeases {
    /// Takes the lease for `backup_id`, or returns the job id and outcome channel of
    /// the run already holding it.
    fn try_acquire(
        &self,
        backup_id: &str,
    ) -> Result<RunLease, (String, watch::Receiver<Option<RunOutcome>>)> {
        match self.inner.entry(backup_id.to_string()) {
            Entry::Occupied(o) => Err((o.get().job_id.clone(), o.get().outcome.clone())),
            Entry::Vacant(v) => {
                let job_id = Uuid::new_v4().to_string();
                let (tx, rx) = watch::channel(None);
                v.insert(ActiveRun {
                    job_id: job_id.clone(),
                    outcome: rx,
                });
                Ok(RunLease {
                    leases: self.clone(),
                    backup_id: backup_id.to_string(),
                    job_id,
                    tx,
                })
            }
        }
    }

    pub fn is_running(&self, backup_id: &str) -> bool {
        self.inner.contains_key(backup_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.len()
    }
}

/// Released on drop, including when the run's task panics.
struct RunLease {
    leases: RunLeases,
    backup_id: String,
    job_id: String,
    tx: watch::Sender<Option<RunOutcome>>,
}

impl RunLease {
    fn subscribe(&self) -> watch::Receiver<Option<RunOutcome>> {
        self.tx.subscribe()
    }

    fn complete(self, outcome: RunOutcome) {
        self.release();
        self.tx.send_replace(Some(outcome));
    }

    fn release(&self) {
        self.leases
            .inner
            .remove_if(&self.backup_id, |_, run| run.job_id == self.job_id);
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTicket {
    pub backup_id: String,
    pub job_id: String,
    /// False when the trigger was coalesced into a run already in progress.
    pub accepted: bool,
}

pub struct RunHandle {
    pub backup_id: String,
    pub job_id: String,
    pub accepted: bool,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl RunHandle {
    pub fn ticket(&self) -> RunTicket {
        RunTicket {
            backup_id: self.backup_id.clone(),
            job_id: self.job_id.clone(),
            accepted: self.accepted,
        }
    }

    /// Resolves once the run has finished.
    pub async fn wait(mut self) -> RunOutcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(v) => v.clone().unwrap_or(RunOutcome::Discarded),
            Err(_) => RunOutcome::Failed {
                error: "Backup worker stopped unexpectedly".into(),
            },
        }
    }
}

/// Everything a run needs, detached from the async world.
struct RunContext {
    task: BackupTask,
    host: Host,
    job_id: String,
    started_at: DateTime<Utc>,
    backup_root: PathBuf,
    transport: Arc<dyn Transport>,
    hooks: Arc<HookRegistry>,
    master_key: Option<MasterKey>,
}

#[derive(Debug)]
struct RunSuccess {
    artifact: PathBuf,
    size_kb: u64,
    links: Option<LinkReport>,
    post_hook_errors: Vec<HookError>,
    prune_errors: Vec<RetentionPruneError>,
}

/// `backupRoot/hostPath/destination`
pub fn destination_path(backup_root: &Path, host: &Host, task: &BackupTask) -> PathBuf {
    backup_root.join(&host.path).join(&task.destination)
}

fn archive_name(base: &str) -> String {
    format!("{base}{ENCRYPTED_SUFFIX}")
}

fn encrypt_and_remove(
    dir: &Path,
    archive: &Path,
    backup_id: &str,
    key: &MasterKey,
) -> Result<(), RunError> {
    crypto::encrypt_directory(dir, archive, backup_id, key).map_err(RunError::Encryption)?;
    fs::remove_dir_all(dir).map_err(|e| RunError::Encryption(CryptoError::Io(e)))?;
    Ok(())
}

fn discard_partial(dir: &Path, name: &str) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(name = %name, error = %e, "Failed to remove incomplete backup");
        }
    }
}

fn log_warnings(task: &BackupTask, summary: &SyncSummary) {
    for warning in &summary.warnings {
        tracing::warn!(backup_id = %task.id, warning = %warning, "Transfer completed with warnings");
    }
}

/// The blocking body of a run: pre hooks, transfer, versioning, encryption, post hooks.
fn execute_run(ctx: &RunContext) -> Result<RunSuccess, RunError> {
    let task = &ctx.task;
    let dest = destination_path(&ctx.backup_root, &ctx.host, task);

    let key = match (task.encrypted, &ctx.master_key) {
        (true, Some(k)) => Some(k),
        (true, None) => return Err(RunError::Encryption(CryptoError::MissingKey)),
        (false, _) => None,
    };

    let session = if task.uses_session_temp_dir() {
        Some(
            tempfile::Builder::new()
                .prefix("backup-session-")
                .tempdir()
                .map_err(RunError::Prepare)?,
        )
    } else {
        None
    };
    // Incremental runs hand hooks the new version directory so their output is versioned.
    let version = if task.incremental {
        // Only a plaintext predecessor can serve as link source.
        let previous = versioning::current_latest(&dest)
            .map_err(RunError::Prepare)?
            .filter(|p| p.is_dir());
        let (name, dir) =
            versioning::allocate_version_dir(&dest, ctx.started_at).map_err(RunError::Prepare)?;
        Some((name, dir, previous))
    } else {
        None
    };
    let hook_ctx = HookContext {
        backup_dest: version.as_ref().map_or_else(|| dest.clone(), |(_, dir, _)| dir.clone()),
        session_temp_dir: session.as_ref().map(|s| s.path().to_path_buf()),
    };

    let pre = match hooks::run_pre_hooks(&ctx.hooks, task, &hook_ctx) {
        Ok(n) => n,
        Err(e) => {
            match &version {
                Some((name, dir, _)) => discard_partial(dir, name),
                None if key.is_some() => discard_partial(&dest, &task.destination),
                None => {}
            }
            return Err(RunError::PreHook(e));
        }
    };
    if pre > 0 {
        tracing::info!(backup_id = %task.id, job_id = %ctx.job_id, count = pre, "Pre-backup hooks completed");
    }

    let source = match &session {
        Some(dir) => SyncSource::Local(dir.path().to_path_buf()),
        None => SyncSource::Remote {
            host: ctx.host.clone(),
            path: task.path.clone(),
        },
    };

    let mut links = None;
    let mut prune_errors = Vec::new();
    let artifact = if let Some((version, version_dir, previous)) = version {
        tracing::info!(backup_id = %task.id, version = %version, link_dest = ?previous, "Starting incremental transfer");

        let synced = ctx.transport.sync(&SyncRequest {
            source,
            excludes: &task.excludes,
            dest: &version_dir,
            link_dest: previous.as_deref(),
        });
        match synced {
            Ok(summary) => log_warnings(task, &summary),
            Err(e) => {
                // `latest` still points at the previous version.
                discard_partial(&version_dir, &version);
                return Err(RunError::Transfer(e));
            }
        }

        if let Some(prev) = &previous {
            match versioning::verify_hardlinks(prev, &version_dir) {
                Ok(report) => {
                    if !report.is_deduplicated() {
                        tracing::warn!(
                            backup_id = %task.id,
                            version = %version,
                            unlinked = report.unlinked_unchanged,
                            "Unchanged files were copied instead of hardlinked"
                        );
                    }
                    links = Some(report);
                }
                Err(e) => tracing::warn!(backup_id = %task.id, error = %e, "Hardlink verification failed"),
            }
        }

        let target = match key {
            Some(key) => {
                let name = archive_name(&version);
                if let Err(e) = encrypt_and_remove(&version_dir, &dest.join(&name), &task.id, key) {
                    discard_partial(&version_dir, &version);
                    return Err(e);
                }
                name
            }
            None => version,
        };
        versioning::swap_latest(&dest, &target).map_err(RunError::Versioning)?;

        let report = versioning::prune(&dest, task.retention);
        if !report.removed.is_empty() {
            tracing::info!(backup_id = %task.id, removed = ?report.removed, "Pruned old versions");
        }
        prune_errors = report.errors;
        dest.join(target)
    } else {
        fs::create_dir_all(&dest).map_err(RunError::Prepare)?;
        let synced = ctx.transport.sync(&SyncRequest {
            source,
            excludes: &task.excludes,
            dest: &dest,
            link_dest: None,
        });
        let summary = match synced {
            Ok(summary) => summary,
            Err(e) => {
                // No plaintext copy may outlive a run of an encrypted task.
                if key.is_some() {
                    discard_partial(&dest, &task.destination);
                }
                return Err(RunError::Transfer(e));
            }
        };
        log_warnings(task, &summary);

        match key {
            Some(key) => {
                let archive = dest.with_file_name(archive_name(&task.destination));
                if let Err(e) = encrypt_and_remove(&dest, &archive, &task.id, key) {
                    discard_partial(&dest, &task.destination);
                    return Err(e);
                }
                archive
            }
            None => dest.clone(),
        }
    };

    let post_hook_errors = hooks::run_post_hooks(&ctx.hooks, task, &hook_ctx);

    let size_kb = match transfer::local_disk_usage_kb(&artifact) {
        Ok(kb) => kb,
        Err(e) => {
            tracing::warn!(artifact = %artifact.display(), error = %e, "Failed to measure backup size");
            0
        }
    };

    Ok(RunSuccess {
        artifact,
        size_kb,
        links,
        post_hook_errors,
        prune_errors,
    })
}

pub(crate) async fn load_task_and_host(
    state: &AppState,
    backup_id: &str,
) -> Result<(BackupTask, Host), CatalogError> {
    let db = state.db.clone();
    let id = backup_id.to_string();
    let found = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let Some(task) = backup_task::find_by_id(&conn, &id)? else {
            return Ok::<_, anyhow::Error>(None);
        };
        let host = host::find_by_id(&conn, &task.host_id)?;
        Ok(host.map(|h| (task, h)))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    found.ok_or_else(|| CatalogError::TaskNotFound(backup_id.to_string()))
}

/// Starts a run of the task, or joins the one already in progress.
///
/// Returns as soon as the run is accepted; the run itself waits for a worker slot.
pub async fn run_backup_task(
    state: Arc<AppState>,
    backup_id: &str,
) -> Result<RunHandle, CatalogError> {
    let (task, host) = load_task_and_host(&state, backup_id).await?;

    let lease = match state.leases.try_acquire(&task.id) {
        Ok(lease) => lease,
        Err((job_id, outcome)) => {
            tracing::info!(backup_id = %task.id, job_id = %job_id, "Backup already running, trigger coalesced");
            return Ok(RunHandle {
                backup_id: task.id,
                job_id,
                accepted: false,
                outcome,
            });
        }
    };

    // Not due again until this run finishes and reschedules.
    let db = state.db.clone();
    let tid = task.id.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup_task::set_next_run(&conn, &tid, None)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let handle = RunHandle {
        backup_id: task.id.clone(),
        job_id: lease.job_id.clone(),
        accepted: true,
        outcome: lease.subscribe(),
    };
    tracing::info!(backup_id = %task.id, job_id = %lease.job_id, host = %host.path, "Backup run accepted");

    state.run_queued();
    tokio::spawn(drive_run(state, task, host, lease));
    Ok(handle)
}

async fn drive_run(state: Arc<AppState>, task: BackupTask, host: Host, lease: RunLease) {
    let host_semaphore = state.get_host_semaphore(&host.id);
    // Host slot first, so a run queued behind a busy host holds no global slot.
    let permits = match host_semaphore.acquire_owned().await {
        Ok(per_host) => match state.global_semaphore.clone().acquire_owned().await {
            Ok(global) => Some((per_host, global)),
            Err(_) => None,
        },
        Err(_) => None,
    };
    state.run_started();
    let job_id = lease.job_id.clone();

    let result = match permits {
        None => Err("Worker pool closed".to_string()),
        Some(_permits) => {
            let db = state.db.clone();
            let tid = task.id.clone();
            let marked = tokio::task::spawn_blocking(move || {
                let conn = db.get()?;
                backup_task::update_status(&conn, &tid, BackupStatus::Running)
            })
            .await;
            if let Ok(Err(e)) | Err(e) = marked.map_err(anyhow::Error::from) {
                tracing::warn!(backup_id = %task.id, error = %e, "Failed to mark backup running");
            }

            let ctx = RunContext {
                task: task.clone(),
                host: host.clone(),
                job_id: job_id.clone(),
                started_at: state.clock.now(),
                backup_root: state.config.backup_root.clone(),
                transport: state.transport.clone(),
                hooks: state.hooks.clone(),
                master_key: state.master_key.clone(),
            };
            tokio::task::spawn_blocking(move || execute_run(&ctx))
                .await
                .map_err(|e| format!("Backup worker panicked: {e}"))
        }
    };
    state.run_finished();

    let outcome = match finish_run(&state, &task, &host, &job_id, result).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(backup_id = %task.id, job_id = %job_id, error = %e, "Failed to record backup result");
            RunOutcome::Failed { error: e.to_string() }
        }
    };
    lease.complete(outcome);
}

async fn finish_run(
    state: &Arc<AppState>,
    task: &BackupTask,
    host: &Host,
    job_id: &str,
    result: Result<Result<RunSuccess, RunError>, String>,
) -> anyhow::Result<RunOutcome> {
    let finished_at = state.clock.now();

    enum Verdict {
        Success(RunSuccess),
        Skip(String),
        Fail(String),
    }
    let verdict = match result {
        Ok(Ok(success)) => Verdict::Success(success),
        Ok(Err(e)) if e.is_transfer() && host.is_workstation => Verdict::Skip(e.to_string()),
        Ok(Err(e)) => Verdict::Fail(e.to_string()),
        Err(panic) => Verdict::Fail(panic),
    };

    let db = state.db.clone();
    let task_id = task.id.clone();
    let jid = job_id.to_string();
    let (verdict, still_exists) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        // Enable/disable may have happened during the run, so schedule from the current row.
        let Some(current) = backup_task::find_by_id(&conn, &task_id)? else {
            return Ok::<_, anyhow::Error>((verdict, false));
        };
        let next_run = if current.enabled {
            CronSchedule::parse(&current.schedule)
                .ok()
                .and_then(|s| s.next_after(finished_at))
        } else {
            None
        };
        match &verdict {
            Verdict::Success(s) => {
                backup_task::record_success(&conn, &task_id, finished_at, &transfer::format_size_kb(s.size_kb))?;
                for e in &s.post_hook_errors {
                    backup_error::append(&conn, &task_id, &jid, &format!("Post-backup hook failed: {e}"), finished_at)?;
                }
                for e in &s.prune_errors {
                    backup_error::append(&conn, &task_id, &jid, &e.to_string(), finished_at)?;
                }
            }
            Verdict::Skip(_) => {
                backup_task::update_status(&conn, &task_id, BackupStatus::Pending)?;
            }
            Verdict::Fail(message) => {
                backup_error::append(&conn, &task_id, &jid, message, finished_at)?;
                backup_task::update_status(&conn, &task_id, BackupStatus::Failed)?;
            }
        }
        backup_task::set_next_run(&conn, &task_id, next_run)?;
        Ok((verdict, true))
    })
    .await??;

    if !still_exists {
        tracing::info!(backup_id = %task.id, job_id = %job_id, "Backup task deleted during run, result discarded");
        return Ok(RunOutcome::Discarded);
    }

    let outcome = match verdict {
        Verdict::Success(s) => {
            let size = transfer::format_size_kb(s.size_kb);
            let artifact = s.artifact.display().to_string();
            for e in &s.post_hook_errors {
                tracing::warn!(backup_id = %task.id, job_id = %job_id, error = %e, "Post-backup hook failed");
            }
            for e in &s.prune_errors {
                tracing::warn!(backup_id = %task.id, job_id = %job_id, error = %e, "Retention pruning failed");
            }
            tracing::info!(backup_id = %task.id, job_id = %job_id, size = %size, artifact = %artifact, "Backup completed");
            state.events.publish(EngineEvent::BackupCompleted {
                backup_id: task.id.clone(),
                job_id: job_id.to_string(),
                host_id: host.id.clone(),
                host_name: host.name.clone(),
                source_path: task.path.clone(),
                size: size.clone(),
                artifact: artifact.clone(),
                links: s.links,
                occurred_at: finished_at,
            });
            RunOutcome::Completed {
                size,
                artifact,
                links: s.links,
            }
        }
        Verdict::Skip(reason) => {
            tracing::info!(backup_id = %task.id, job_id = %job_id, host = %host.path, reason = %reason, "Workstation unreachable, backup skipped");
            RunOutcome::Skipped { reason }
        }
        Verdict::Fail(error) => {
            tracing::error!(backup_id = %task.id, job_id = %job_id, error = %error, "Backup failed");
            state.events.publish(EngineEvent::BackupFailed {
                backup_id: task.id.clone(),
                job_id: job_id.to_string(),
                host_id: host.id.clone(),
                host_name: host.name.clone(),
                source_path: task.path.clone(),
                error_message: error.clone(),
                occurred_at: finished_at,
            });
            RunOutcome::Failed { error }
        }
    };
    Ok(outcome)
}

/// One independent run per task of the host.
pub async fn run_all_for_host(
    state: Arc<AppState>,
    host_id: &str,
) -> Result<Vec<RunHandle>, CatalogError> {
    let db = state.db.clone();
    let hid = host_id.to_string();
    let tasks = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        if host::find_by_id(&conn, &hid)?.is_none() {
            return Ok::<_, anyhow::Error>(None);
        }
        backup_task::find_by_host_id(&conn, &hid).map(Some)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??
    .ok_or_else(|| CatalogError::HostNotFound(host_id.to_string()))?;

    let mut handles = Vec::with_capacity(tasks.len());
    for task in tasks {
        match run_backup_task(state.clone(), &task.id).await {
            Ok(h) => handles.push(h),
            // Deleted between listing and triggering.
            Err(CatalogError::TaskNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(handles)
}
