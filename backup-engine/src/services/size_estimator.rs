use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::CatalogError;
use crate::models::host;
use crate::services::restore::RestoreSummary;
use crate::state::AppState;
use crate::transfer::format_size_kb;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeEstimate {
    pub size_kb: u64,
    pub size: String,
}

/// Payload of a completed background task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskData {
    Size(SizeEstimate),
    Restore(RestoreSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskResult {
    Pending,
    Completed { data: TaskData },
    Failed { error: String },
}

impl TaskResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskResult::Pending)
    }
}

/// Results of background tasks, forgotten `ttl` after their last update.
pub struct TaskResultStore {
    ttl: Duration,
    results: DashMap<String, (Instant, TaskResult)>,
}

impl TaskResultStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            results: DashMap::new(),
        }
    }

    pub fn put(&self, id: &str, result: TaskResult) {
        self.purge_expired();
        self.results.insert(id.to_string(), (Instant::now(), result));
    }

    pub fn get(&self, id: &str) -> Option<TaskResult> {
        let entry = self.results.get(id)?;
        let (updated, result) = entry.value();
        (updated.elapsed() < self.ttl).then(|| result.clone())
    }

    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.results.retain(|_, (updated, _)| updated.elapsed() < ttl);
    }
}

/// Starts a `du -sk` of `path` on the host and returns the task id to poll.
pub async fn measure_size(
    state: Arc<AppState>,
    host_id: &str,
    path: &str,
) -> Result<String, CatalogError> {
    let db = state.db.clone();
    let hid = host_id.to_string();
    let host = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        host::find_by_id(&conn, &hid)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??
    .ok_or_else(|| CatalogError::HostNotFound(host_id.to_string()))?;

    let task_id = Uuid::new_v4().to_string();
    state.task_results.put(&task_id, TaskResult::Pending);

    let tid = task_id.clone();
    let path = path.to_string();
    tokio::spawn(async move {
        let transport = state.transport.clone();
        let p = path.clone();
        let host_name = host.name.clone();
        let outcome = tokio::task::spawn_blocking(move || transport.disk_usage_kb(&host, &p)).await;
        let result = match outcome {
            Ok(Ok(kb)) => {
                tracing::info!(task_id = %tid, host = %host_name, path = %path, size_kb = kb, "Size estimation completed");
                TaskResult::Completed {
                    data: TaskData::Size(SizeEstimate {
                        size_kb: kb,
                        size: format_size_kb(kb),
                    }),
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(task_id = %tid, host = %host_name, path = %path, error = %e, "Size estimation failed");
                TaskResult::Failed { error: e.to_string() }
            }
            Err(e) => TaskResult::Failed { error: e.to_string() },
        };
        state.task_results.put(&tid, result);
    });

    Ok(task_id)
}

pub fn get_task_result(state: &AppState, task_id: &str) -> Option<TaskResult> {
    state.task_results.get(task_id)
}

/// Polls until the task reaches a terminal state or `timeout` passes. A timeout
/// returns the last seen (pending) state; the task keeps running.
pub async fn await_task_result(
    state: &AppState,
    task_id: &str,
    timeout: Duration,
) -> Option<TaskResult> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = get_task_result(state, task_id);
        match &current {
            Some(r) if r.is_terminal() => return current,
            None => return None,
            Some(_) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return current;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;
    use std::fs;

    #[test]
    fn test_store_ttl() {
        let store = TaskResultStore::new(Duration::from_millis(0));
        store.put("t", TaskResult::Pending);
        assert_eq!(store.get("t"), None);

        let store = TaskResultStore::new(Duration::from_secs(60));
        store.put("t", TaskResult::Failed { error: "x".into() });
        assert_eq!(store.get("t"), Some(TaskResult::Failed { error: "x".into() }));
    }

    #[test]
    fn test_result_wire_shape() {
        let v = serde_json::to_value(TaskResult::Completed {
            data: TaskData::Size(SizeEstimate {
                size_kb: 12,
                size: "12KB".into(),
            }),
        })
        .unwrap();
        assert_eq!(v["status"], "completed");
        assert_eq!(v["data"]["sizeKb"], 12);
        assert_eq!(serde_json::to_value(TaskResult::Pending).unwrap()["status"], "pending");
    }

    #[tokio::test]
    async fn test_measure_size_completes() {
        let env = TestEnv::new();
        let host = env.host("Web", false);
        let src = env.root().join("source_data");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.bin"), vec![1u8; 64 * 1024]).unwrap();

        let id = measure_size(env.state.clone(), &host.id, src.to_str().unwrap())
            .await
            .unwrap();
        let result = await_task_result(&env.state, &id, Duration::from_secs(30))
            .await
            .unwrap();
        match result {
            TaskResult::Completed { data: TaskData::Size(data) } => {
                assert!(data.size_kb >= 64);
                assert_eq!(data.size, format!("{}KB", data.size_kb));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_measure_size_failure_and_unknown_host() {
        let env = TestEnv::new();
        let host = env.host("Web", false);
        let id = measure_size(env.state.clone(), &host.id, "/no/such/dir")
            .await
            .unwrap();
        let result = await_task_result(&env.state, &id, Duration::from_secs(30)).await;
        assert!(matches!(result, Some(TaskResult::Failed { .. })));

        assert!(matches!(
            measure_size(env.state.clone(), "missing", "/").await,
            Err(CatalogError::HostNotFound(_))
        ));
        assert_eq!(get_task_result(&env.state, "unknown"), None);
    }
}
