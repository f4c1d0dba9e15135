use crate::error::CatalogError;
use crate::models::backup_task;
use crate::services::cron::CronSchedule;
use crate::services::maintenance::{self, PurgeSummary};
use crate::services::orchestrator::{self, RunHandle};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Fires due tasks. Due times live in `backup_tasks.next_run_at`; the clock comes from state.
pub struct BackupScheduler {
    state: Arc<AppState>,
}

impl BackupScheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Brings persisted due times in line with each task's schedule after a restart.
    ///
    /// A due time missed while the engine was down stays in the past and fires once
    /// on the first tick.
    pub async fn init_schedules(&self) -> anyhow::Result<usize> {
        let db = self.state.db.clone();
        let now = self.state.clock.now();
        let scheduled = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            let reset = backup_task::reset_stale_running(&conn)?;
            if reset > 0 {
                tracing::warn!(count = reset, "Reset backups left running by a previous process");
            }

            let mut scheduled = 0;
            for task in backup_task::find_all(&conn)? {
                if !task.enabled {
                    if task.next_run_at.is_some() {
                        backup_task::set_next_run(&conn, &task.id, None)?;
                    }
                    continue;
                }
                let schedule = match CronSchedule::parse(&task.schedule) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(backup_id = %task.id, error = %e, "Stored schedule is invalid, task will not fire");
                        backup_task::set_next_run(&conn, &task.id, None)?;
                        continue;
                    }
                };
                if task.next_run_at.is_none() {
                    backup_task::set_next_run(&conn, &task.id, schedule.next_after(now))?;
                }
                scheduled += 1;
            }
            Ok::<_, anyhow::Error>(scheduled)
        })
        .await??;

        tracing::info!(count = scheduled, "Cron schedules initialized");
        Ok(scheduled)
    }

    /// Submits every task due at the clock's current time. Each becomes an independent run.
    pub async fn tick(&self) -> anyhow::Result<Vec<RunHandle>> {
        let db = self.state.db.clone();
        let now = self.state.clock.now();
        let due = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup_task::find_due(&conn, now)
        })
        .await??;

        let mut handles = Vec::with_capacity(due.len());
        for task in due {
            tracing::info!(backup_id = %task.id, schedule = %task.schedule, "Starting scheduled backup");
            match orchestrator::run_backup_task(self.state.clone(), &task.id).await {
                Ok(handle) => handles.push(handle),
                Err(CatalogError::TaskNotFound(_)) => {}
                Err(e) => {
                    tracing::error!(backup_id = %task.id, error = %e, "Failed to submit scheduled backup");
                }
            }
        }
        Ok(handles)
    }

    /// The configured retention purge schedule, if any and valid.
    pub fn purge_schedule(&self) -> Option<CronSchedule> {
        let expr = self.state.config.purge_schedule.as_deref()?;
        match CronSchedule::parse(expr) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = %e, "Invalid purge schedule, retention purge disabled");
                None
            }
        }
    }

    /// Starts the retention purge in the background when `next` has passed, and
    /// moves `next` to the following fire time.
    pub fn purge_if_due(
        &self,
        schedule: &CronSchedule,
        next: &mut Option<DateTime<Utc>>,
    ) -> Option<JoinHandle<anyhow::Result<PurgeSummary>>> {
        let now = self.state.clock.now();
        match *next {
            Some(at) if at <= now => {}
            _ => return None,
        }
        *next = schedule.next_after(now);
        tracing::info!(next = ?next, "Starting scheduled retention purge");
        let state = self.state.clone();
        Some(tokio::spawn(async move {
            let summary = maintenance::purge_expired_versions(&state).await;
            if let Err(e) = &summary {
                tracing::error!(error = %e, "Retention purge failed");
            }
            summary
        }))
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.state.config.scheduler_tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let purge = self.purge_schedule();
            let mut next_purge = purge
                .as_ref()
                .and_then(|s| s.next_after(self.state.clock.now()));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            tracing::error!(error = %e, "Scheduler tick failed");
                        }
                        if let Some(schedule) = &purge {
                            self.purge_if_due(schedule, &mut next_purge);
                        }
                    }
                }
            }
            tracing::info!("Scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup_task::BackupStatus;
    use crate::services::clock::{Clock, ManualClock};
    use crate::services::orchestrator::RunOutcome;
    use crate::services::versioning;
    use crate::test_support::{GatedTransport, TestEnv};
    use chrono::{TimeZone, Utc};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 15, 23, 58, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_task_fires_only_when_due() {
        let clock = clock();
        let (gated, release) = GatedTransport::new();
        let env = TestEnv::build(|_| {}, |s| s.with_clock(clock.clone()).with_transport(gated.clone()));
        let host = env.host("Web", false);
        let src = env.source("source_data", &[("a.txt", "alpha")]);
        let mut req = TestEnv::request(&host.id, src.to_str().unwrap(), "site");
        req.schedule = "0 0 * * *".into();
        let task = env.task(req);
        assert_eq!(
            task.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap())
        );

        let scheduler = BackupScheduler::new(env.state.clone());
        assert!(scheduler.tick().await.unwrap().is_empty());

        clock.advance(chrono::Duration::minutes(1));
        assert!(scheduler.tick().await.unwrap().is_empty());

        clock.advance(chrono::Duration::minutes(1));
        let handles = scheduler.tick().await.unwrap();
        assert_eq!(handles.len(), 1);

        // Finishing later than scheduled: the next fire is computed from completion.
        gated.started(1).await;
        clock.advance(chrono::Duration::hours(3));
        release.send(()).unwrap();
        for h in handles {
            assert!(matches!(h.wait().await, RunOutcome::Completed { .. }));
        }
        let stored = env.reload(&task.id).unwrap();
        assert_eq!(stored.status, BackupStatus::Completed);
        assert_eq!(stored.last_run, Utc.with_ymd_and_hms(2024, 3, 16, 3, 0, 0).unwrap());
        assert_eq!(
            stored.next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 17, 0, 0, 0).unwrap())
        );
        assert!(scheduler.tick().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_due_tasks_run_independently() {
        let clock = clock();
        let env = TestEnv::build(|_| {}, |s| s.with_clock(clock.clone()));
        let web = env.host("Web", false);
        let db = env.host("Db", false);
        let src = env.source("source_data", &[("a.txt", "alpha")]);
        let path = src.to_str().unwrap();
        env.task(TestEnv::request(&web.id, path, "site"));
        env.task(TestEnv::request(&db.id, path, "site"));
        let mut disabled = TestEnv::request(&web.id, path, "off");
        disabled.enabled = false;
        env.task(disabled);

        clock.advance(chrono::Duration::hours(3));
        let handles = BackupScheduler::new(env.state.clone()).tick().await.unwrap();
        assert_eq!(handles.len(), 2);
        for h in handles {
            assert!(matches!(h.wait().await, RunOutcome::Completed { .. }));
        }
        assert!(env.backups().join("web/site/source_data/a.txt").is_file());
        assert!(env.backups().join("db/site/source_data/a.txt").is_file());
        assert!(!env.backups().join("web/off").exists());
    }

    #[tokio::test]
    async fn test_manual_and_scheduled_triggers_coalesce() {
        let clock = clock();
        let (gated, release) = GatedTransport::new();
        let env = TestEnv::build(|_| {}, |s| s.with_clock(clock.clone()).with_transport(gated.clone()));
        let host = env.host("Web", false);
        let src = env.source("source_data", &[("a.txt", "alpha")]);
        let task = env.task(TestEnv::request(&host.id, src.to_str().unwrap(), "site"));
        let scheduler = BackupScheduler::new(env.state.clone());

        clock.advance(chrono::Duration::hours(3));
        let manual = orchestrator::run_backup_task(env.state.clone(), &task.id).await.unwrap();
        gated.started(1).await;

        // The running task is no longer due, and another manual trigger joins the run.
        assert!(scheduler.tick().await.unwrap().is_empty());
        let again = orchestrator::run_backup_task(env.state.clone(), &task.id).await.unwrap();
        assert!(!again.accepted);

        release.send(()).unwrap();
        manual.wait().await;
        again.wait().await;
        assert_eq!(gated.calls(), 1);
    }

    #[tokio::test]
    async fn test_init_schedules_repairs_state() {
        let clock = clock();
        let env = TestEnv::build(|_| {}, |s| s.with_clock(clock.clone()));
        let host = env.host("Web", false);
        let running = env.task(TestEnv::request(&host.id, "/data", "a"));
        let unscheduled = env.task(TestEnv::request(&host.id, "/data", "b"));
        let mut req = TestEnv::request(&host.id, "/data", "c");
        req.enabled = false;
        let disabled = env.task(req);
        {
            let conn = env.state.db.get().unwrap();
            backup_task::update_status(&conn, &running.id, BackupStatus::Running).unwrap();
            backup_task::set_next_run(&conn, &unscheduled.id, None).unwrap();
            backup_task::set_next_run(&conn, &disabled.id, Some(clock.now())).unwrap();
        }

        let count = BackupScheduler::new(env.state.clone()).init_schedules().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(env.reload(&running.id).unwrap().status, BackupStatus::Pending);
        assert_eq!(
            env.reload(&unscheduled.id).unwrap().next_run_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 16, 2, 0, 0).unwrap())
        );
        assert_eq!(env.reload(&disabled.id).unwrap().next_run_at, None);
    }

    #[tokio::test]
    async fn test_purge_fires_on_its_schedule() {
        let clock = clock();
        let env = TestEnv::build(
            |c| c.purge_schedule = Some("0 4 * * *".into()),
            |s| s.with_clock(clock.clone()),
        );
        let host = env.host("Web", false);
        let mut req = TestEnv::request(&host.id, "/data", "site");
        req.incremental = true;
        req.retention = 1;
        env.task(req);
        let dest = env.backups().join("web/site");
        for s in 0..3 {
            let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, s).unwrap();
            let (name, _) = versioning::allocate_version_dir(&dest, at).unwrap();
            versioning::swap_latest(&dest, &name).unwrap();
        }

        let scheduler = BackupScheduler::new(env.state.clone());
        let schedule = scheduler.purge_schedule().unwrap();
        let mut next = schedule.next_after(clock.now());
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2024, 3, 16, 4, 0, 0).unwrap()));
        assert!(scheduler.purge_if_due(&schedule, &mut next).is_none());

        clock.advance(chrono::Duration::hours(5));
        let summary = scheduler
            .purge_if_due(&schedule, &mut next)
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.removed.len(), 2);
        assert_eq!(versioning::list_versions(&dest).unwrap().len(), 1);
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2024, 3, 17, 4, 0, 0).unwrap()));
        assert!(scheduler.purge_if_due(&schedule, &mut next).is_none());
    }

    #[tokio::test]
    async fn test_invalid_purge_schedule_disables_purge() {
        let env = TestEnv::build(|c| c.purge_schedule = Some("every night".into()), |s| s);
        assert!(BackupScheduler::new(env.state.clone()).purge_schedule().is_none());
        let env = TestEnv::new();
        assert!(BackupScheduler::new(env.state.clone()).purge_schedule().is_none());
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let env = TestEnv::new();
        let cancel = CancellationToken::new();
        let handle = BackupScheduler::new(env.state.clone()).start(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
