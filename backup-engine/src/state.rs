use crate::config::{AppConfig, TransportKind};
use crate::crypto::MasterKey;
use crate::db::connection::DbPool;
use crate::services::clock::{Clock, SystemClock};
use crate::services::hooks::HookRegistry;
use crate::services::orchestrator::RunLeases;
use crate::services::size_estimator::TaskResultStore;
use crate::transfer::{LocalTransport, RsyncTransport, Transport};
use crate::ws::events::{EngineEvent, EventBus};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Worker pool occupancy, published as `worker_stats_updated`.
#[derive(Debug, Default)]
pub struct WorkerStats {
    active: AtomicUsize,
    queued: AtomicUsize,
}

impl WorkerStats {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub events: EventBus,
    pub leases: RunLeases,
    pub global_semaphore: Arc<Semaphore>,
    pub host_semaphores: DashMap<String, Arc<Semaphore>>,
    pub transport: Arc<dyn Transport>,
    pub hooks: Arc<HookRegistry>,
    /// Loaded once at startup and never changed.
    pub master_key: Option<MasterKey>,
    pub clock: Arc<dyn Clock>,
    pub task_results: TaskResultStore,
    pub stats: WorkerStats,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig) -> anyhow::Result<Self> {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Rsync => Arc::new(RsyncTransport::new(config.ssh_key_path.clone())),
            TransportKind::Local => Arc::new(LocalTransport::new()),
        };
        let hooks = Arc::new(HookRegistry::load(&config.plugin_dir)?);
        let master_key = match &config.encryption_key {
            Some(k) => Some(MasterKey::new(k.as_bytes())?),
            None => {
                tracing::warn!("ENCRYPTION_KEY not set, encrypted backups are disabled");
                None
            }
        };
        Ok(Self {
            global_semaphore: Arc::new(Semaphore::new(config.max_concurrent_global)),
            task_results: TaskResultStore::new(config.task_result_ttl),
            db,
            config,
            events: EventBus::new(),
            leases: RunLeases::default(),
            host_semaphores: DashMap::new(),
            transport,
            hooks,
            master_key,
            clock: Arc::new(SystemClock),
            stats: WorkerStats::default(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn get_host_semaphore(&self, host_id: &str) -> Arc<Semaphore> {
        self.host_semaphores
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrent_per_host)))
            .clone()
    }

    pub fn run_queued(&self) {
        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        self.publish_stats();
    }

    pub fn run_started(&self) {
        self.stats.queued.fetch_sub(1, Ordering::SeqCst);
        self.stats.active.fetch_add(1, Ordering::SeqCst);
        self.publish_stats();
    }

    pub fn run_finished(&self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.publish_stats();
    }

    fn publish_stats(&self) {
        self.events.publish(EngineEvent::WorkerStatsUpdated {
            active: self.stats.active(),
            queued: self.stats.queued(),
            capacity: self.config.max_concurrent_global,
        });
    }
}
