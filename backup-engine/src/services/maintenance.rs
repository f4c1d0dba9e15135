use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{backup_error, backup_task, host};
use crate::services::orchestrator::destination_path;
use crate::services::versioning;
use crate::state::AppState;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeSummary {
    pub job_id: String,
    /// Incremental tasks with a retention that were checked.
    pub tasks: usize,
    /// Removed versions as `hostPath/destination/version`.
    pub removed: Vec<String>,
    pub errors: usize,
    /// Tasks left alone because a run held them; the run prunes on its own.
    pub skipped_running: usize,
}

/// Applies every incremental task's retention to what is on disk.
///
/// Versions can pile up when runs fail before pruning or when retention is lowered.
/// Failures are written to the task's error log.
pub async fn purge_expired_versions(state: &Arc<AppState>) -> anyhow::Result<PurgeSummary> {
    let job_id = format!("purge-{}", Uuid::new_v4());
    let db = state.db.clone();
    let (tasks, hosts) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let tasks = backup_task::find_all(&conn)?;
        let hosts: HashMap<String, host::Host> = host::find_all(&conn)?
            .into_iter()
            .map(|h| (h.id.clone(), h))
            .collect();
        Ok::<_, anyhow::Error>((tasks, hosts))
    })
    .await??;

    let mut summary = PurgeSummary {
        job_id: job_id.clone(),
        ..Default::default()
    };
    let mut candidates = Vec::new();
    for task in tasks.into_iter().filter(|t| t.incremental && t.retention > 0) {
        if state.leases.is_running(&task.id) {
            summary.skipped_running += 1;
            continue;
        }
        if let Some(host) = hosts.get(&task.host_id) {
            let dest = destination_path(&state.config.backup_root, host, &task);
            candidates.push((task, host.path.clone(), dest));
        }
    }
    summary.tasks = candidates.len();

    let db = state.db.clone();
    let now = state.clock.now();
    let jid = job_id.clone();
    let (removed, errors) = tokio::task::spawn_blocking(move || {
        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for (task, host_path, dest) in &candidates {
            let report = versioning::prune(dest, task.retention);
            for name in report.removed {
                tracing::info!(backup_id = %task.id, version = %name, "Purged expired version");
                removed.push(format!("{host_path}/{}/{name}", task.destination));
            }
            for e in report.errors {
                tracing::warn!(backup_id = %task.id, error = %e, "Purge failed");
                failures.push((task.id.clone(), e.to_string()));
            }
        }

        let conn = db.get()?;
        for (backup_id, message) in &failures {
            // The task may have been deleted meanwhile; its log went with it.
            if backup_task::find_by_id(&conn, backup_id)?.is_some() {
                backup_error::append(&conn, backup_id, &jid, message, now)?;
            }
        }
        Ok::<_, anyhow::Error>((removed, failures.len()))
    })
    .await??;

    summary.removed = removed;
    summary.errors = errors;
    tracing::info!(
        job_id = %job_id,
        tasks = summary.tasks,
        removed = summary.removed.len(),
        errors = summary.errors,
        "Retention purge finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::versioning::{allocate_version_dir, latest_target_name, list_versions, swap_latest};
    use crate::test_support::TestEnv;
    use chrono::{TimeZone, Utc};
    use std::fs;

    fn seed_versions(dest: &std::path::Path, count: u32) -> Vec<String> {
        let mut names = Vec::new();
        for s in 0..count {
            let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, s).unwrap();
            let (name, dir) = allocate_version_dir(dest, at).unwrap();
            fs::write(dir.join("f"), s.to_string()).unwrap();
            names.push(name);
        }
        swap_latest(dest, names.last().unwrap()).unwrap();
        names
    }

    #[tokio::test]
    async fn test_purge_applies_retention_per_task() {
        let env = TestEnv::new();
        let host = env.host("Web", false);

        let mut req = TestEnv::request(&host.id, "/data", "kept");
        req.incremental = true;
        req.retention = 2;
        env.task(req);
        let mut req = TestEnv::request(&host.id, "/data", "unlimited");
        req.incremental = true;
        env.task(req);

        let kept = env.backups().join("web/kept");
        let unlimited = env.backups().join("web/unlimited");
        let names = seed_versions(&kept, 4);
        seed_versions(&unlimited, 3);

        let summary = purge_expired_versions(&env.state).await.unwrap();
        assert_eq!(summary.tasks, 1);
        assert_eq!(
            summary.removed,
            vec![format!("web/kept/{}", names[0]), format!("web/kept/{}", names[1])]
        );
        assert_eq!(summary.errors, 0);

        let left: Vec<String> = list_versions(&kept).unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(left, names[2..].to_vec());
        assert_eq!(latest_target_name(&kept).unwrap(), Some(names[3].clone()));
        assert_eq!(list_versions(&unlimited).unwrap().len(), 3);

        // Nothing left to do on a second pass.
        assert!(purge_expired_versions(&env.state).await.unwrap().removed.is_empty());
    }

    #[tokio::test]
    async fn test_purge_ignores_tasks_without_versions() {
        let env = TestEnv::new();
        let host = env.host("Web", false);
        let mut req = TestEnv::request(&host.id, "/data", "never_ran");
        req.incremental = true;
        req.retention = 1;
        env.task(req);
        let mut full = TestEnv::request(&host.id, "/data", "full");
        full.retention = 1;
        env.task(full);

        let summary = purge_expired_versions(&env.state).await.unwrap();
        assert_eq!(summary.tasks, 1);
        assert!(summary.removed.is_empty());
        assert_eq!(summary.errors, 0);
    }
}
