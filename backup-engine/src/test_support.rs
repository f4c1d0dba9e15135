use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::config::AppConfig;
use crate::error::TransferError;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::models::backup_task::{self, BackupTask, CreateBackupTaskRequest};
use crate::models::host::{self, CreateHostRequest, Host};
use crate::services::cron::CronSchedule;
use crate::state::AppState;
use crate::transfer::{LocalTransport, SyncRequest, SyncSummary, Transport};

pub const TEST_KEY: &str = "test-master-key";

/// A complete engine rooted in a scratch directory, using the local transport.
pub struct TestEnv {
    tmp: TempDir,
    pub state: Arc<AppState>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::build(|_| {}, |s| s)
    }

    pub fn with_encryption() -> Self {
        Self::build(|c| c.encryption_key = Some(TEST_KEY.into()), |s| s)
    }

    pub fn build(
        configure: impl FnOnce(&mut AppConfig),
        customize: impl FnOnce(AppState) -> AppState,
    ) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = AppConfig::for_root(tmp.path());
        configure(&mut config);
        fs::create_dir_all(&config.data_dir).unwrap();
        let pool = create_pool(config.db_path.to_str().unwrap()).unwrap();
        migrate(&pool, &config.data_dir).unwrap();
        let state = customize(AppState::new(pool, config).unwrap());
        Self {
            tmp,
            state: Arc::new(state),
        }
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn backups(&self) -> &Path {
        &self.state.config.backup_root
    }

    /// Creates `<root>/<rel>` with the given files.
    pub fn source(&self, rel: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = self.root().join(rel);
        fs::create_dir_all(&dir).unwrap();
        for (name, body) in files {
            let path = dir.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        dir
    }

    pub fn write_hook(&self, name: &str, body: &str) {
        let dir = &self.state.config.plugin_dir;
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(format!("{name}.sh")), body).unwrap();
    }

    pub fn host(&self, name: &str, is_workstation: bool) -> Host {
        let conn = self.state.db.get().unwrap();
        host::create(
            &conn,
            &CreateHostRequest {
                name: name.into(),
                hostname: "localhost".into(),
                user: "backup".into(),
                port: 22,
                is_workstation,
            },
        )
        .unwrap()
    }

    pub fn request(host_id: &str, path: &str, destination: &str) -> CreateBackupTaskRequest {
        CreateBackupTaskRequest {
            host_id: host_id.into(),
            path: path.into(),
            destination: destination.into(),
            schedule: "0 2 * * *".into(),
            excludes: Vec::new(),
            incremental: false,
            retention: 0,
            encrypted: false,
            enabled: true,
            hooks: Vec::new(),
        }
    }

    pub fn task(&self, req: CreateBackupTaskRequest) -> BackupTask {
        let next_run = if req.enabled {
            CronSchedule::parse(&req.schedule)
                .unwrap()
                .next_after(self.state.clock.now())
        } else {
            None
        };
        let conn = self.state.db.get().unwrap();
        backup_task::create(&conn, &req, next_run).unwrap()
    }

    pub fn reload(&self, id: &str) -> Option<BackupTask> {
        let conn = self.state.db.get().unwrap();
        backup_task::find_by_id(&conn, id).unwrap()
    }
}

/// Local transport whose transfers block until released, for observing runs mid-flight.
pub struct GatedTransport {
    inner: LocalTransport,
    gate: Mutex<mpsc::Receiver<()>>,
    pub calls: AtomicUsize,
}

impl GatedTransport {
    /// Each `()` sent releases one transfer; dropping the sender releases all.
    pub fn new() -> (Arc<Self>, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let transport = Arc::new(Self {
            inner: LocalTransport::new(),
            gate: Mutex::new(rx),
            calls: AtomicUsize::new(0),
        });
        (transport, tx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Waits until `n` transfers have started.
    pub async fn started(&self, n: usize) {
        for _ in 0..500 {
            if self.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} transfers, saw {}", self.calls());
    }
}

impl Transport for GatedTransport {
    fn sync(
        &self,
        req: &SyncRequest<'_>,
    ) -> Result<SyncSummary, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.gate.lock().unwrap().recv();
        self.inner.sync(req)
    }

    fn push(&self, source: &Path, host: &Host, target: &str) -> Result<SyncSummary, TransferError> {
        self.inner.push(source, host, target)
    }

    fn disk_usage_kb(&self, host: &Host, path: &str) -> Result<u64, TransferError> {
        self.inner.disk_usage_kb(host, path)
    }
}
