//! The PACS client operation fabric: five cooperating managers over one
//! durable job model.
//!
//! [`System`] owns the managers and wires them together: the node manager
//! keeps the peer registry healthy, the job manager runs every piece of
//! asynchronous work, and the routing, prefetch, and sync managers turn
//! arriving studies, worklist entries, and schedules into jobs. All
//! persistence goes through `client-sql`; all wire traffic goes through
//! the `dimse` traits via per-peer connection pools.

pub mod audit;
pub mod jobs;
pub mod local;
mod pools;
pub mod prefetch;
pub mod routing;
pub mod sync;

mod nodes;

pub use audit::{AuditEvent, AuditSink, TracingAudit};
pub use jobs::{
    JobApiError, JobContext, JobError, JobHandler, JobManager, JobManagerConfig, JobStats,
};
pub use local::{LocalArchive, MemoryArchive};
pub use nodes::{NodeError, NodeManager, NodeManagerConfig};
pub use pools::Pools;
pub use prefetch::{PrefetchConfig, PrefetchError, PrefetchManager, WorklistEntry};
pub use routing::{RoutingError, RoutingManager, StudyArrival};
pub use sync::{SyncCycleHandler, SyncError, SyncManager, SyncSettings};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use client_sql::{
    JobRepository, NodeRepository, PrefetchHistoryRepository, PrefetchRuleRepository,
    RecentStudyRepository, RoutingRuleRepository, Store, SyncConfigRepository,
    SyncConflictRepository, SyncHistoryRepository,
};
use dimse::Connector;
use models::{JobKind, JobRecord, JobStatus};
use uuid::Uuid;

/// The narrow job-submission surface consumed by the routing, prefetch,
/// and sync managers. Implemented by the job manager's weak handle, which
/// keeps the ownership graph acyclic.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit_job(&self, job: JobRecord) -> Result<Uuid, JobApiError>;
    async fn wait_job(&self, job_id: Uuid, timeout: Duration) -> Result<JobRecord, JobApiError>;
    async fn cancel_job(&self, job_id: Uuid) -> Result<(), JobApiError>;
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Our AE title, presented on every association and used as the
    /// C-MOVE destination.
    pub calling_ae: String,
    /// Per-operation wire timeout handed to connectors.
    pub operation_timeout: Duration,
    pub pool: pool::PoolConfig,
    pub jobs: JobManagerConfig,
    pub nodes: NodeManagerConfig,
    pub prefetch: PrefetchConfig,
    pub sync: SyncSettings,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            calling_ae: "PACS-CLIENT".to_string(),
            operation_timeout: Duration::from_secs(30),
            pool: pool::PoolConfig::default(),
            jobs: JobManagerConfig::default(),
            nodes: NodeManagerConfig::default(),
            prefetch: PrefetchConfig::default(),
            sync: SyncSettings::default(),
        }
    }
}

/// The composed client subsystem.
pub struct System {
    store: Store,
    pools: Arc<Pools>,
    pub nodes: Arc<NodeManager>,
    pub jobs: Arc<JobManager>,
    pub routing: Arc<RoutingManager>,
    pub prefetch: Arc<PrefetchManager>,
    pub sync: Arc<SyncManager>,
}

impl System {
    pub fn new(
        store: Store,
        connector: Arc<dyn Connector>,
        local: Arc<dyn LocalArchive>,
        config: SystemConfig,
    ) -> Self {
        Self::with_audit(store, connector, local, config, Arc::new(TracingAudit))
    }

    pub fn with_audit(
        store: Store,
        connector: Arc<dyn Connector>,
        local: Arc<dyn LocalArchive>,
        config: SystemConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let pools = Arc::new(Pools::new(
            connector,
            NodeRepository::new(&store),
            config.pool.clone(),
            config.calling_ae.clone(),
            config.operation_timeout,
        ));

        let jobs = Arc::new(JobManager::new(
            config.jobs.clone(),
            JobRepository::new(&store),
            NodeRepository::new(&store),
            pools.clone(),
            audit.clone(),
        ));
        let submitter: Arc<dyn JobSubmitter> = Arc::new(jobs.handle());

        jobs.register_handler(JobKind::Echo, Arc::new(jobs::handlers::EchoHandler));
        jobs.register_handler(
            JobKind::Store,
            Arc::new(jobs::handlers::StoreHandler::new(local.clone())),
        );
        jobs.register_handler(
            JobKind::Forward,
            Arc::new(jobs::handlers::StoreHandler::new(local.clone())),
        );
        jobs.register_handler(
            JobKind::Retrieve,
            Arc::new(jobs::handlers::RetrieveHandler::new(config.calling_ae.clone())),
        );
        jobs.register_handler(
            JobKind::Prefetch,
            Arc::new(jobs::handlers::RetrieveHandler::new(config.calling_ae.clone())),
        );
        jobs.register_handler(JobKind::Query, Arc::new(jobs::handlers::QueryHandler));

        let cycle = Arc::new(SyncCycleHandler::new(
            SyncConfigRepository::new(&store),
            SyncConflictRepository::new(&store),
            SyncHistoryRepository::new(&store),
            submitter.clone(),
            pools.clone(),
            local.clone(),
            audit.clone(),
            config.sync.child_wait,
        ));
        jobs.register_handler(JobKind::SyncPull, cycle.clone());
        jobs.register_handler(JobKind::SyncPush, cycle);

        let nodes = Arc::new(NodeManager::new(
            config.nodes.clone(),
            NodeRepository::new(&store),
            JobRepository::new(&store),
            pools.clone(),
            audit.clone(),
        ));
        let routing = Arc::new(RoutingManager::new(
            RoutingRuleRepository::new(&store),
            RecentStudyRepository::new(&store),
            submitter.clone(),
        ));
        let prefetch = Arc::new(PrefetchManager::new(
            config.prefetch.clone(),
            PrefetchRuleRepository::new(&store),
            PrefetchHistoryRepository::new(&store),
            submitter.clone(),
            pools.clone(),
            local.clone(),
        ));
        let sync = Arc::new(SyncManager::new(
            config.sync.clone(),
            SyncConfigRepository::new(&store),
            SyncConflictRepository::new(&store),
            SyncHistoryRepository::new(&store),
            submitter,
            audit,
        ));

        // Prefetch history tracks its retrieve jobs to completion.
        {
            let prefetch = prefetch.clone();
            jobs.subscribe(move |job, _from, to| {
                if job.kind != JobKind::Prefetch {
                    return;
                }
                let finished = match to {
                    JobStatus::Completed => Some(true),
                    JobStatus::Failed if job.retry_count >= job.max_retries => Some(false),
                    JobStatus::Canceled => Some(false),
                    _ => None,
                };
                if let Some(succeeded) = finished {
                    let prefetch = prefetch.clone();
                    let job = job.clone();
                    tokio::spawn(async move {
                        prefetch.on_job_finished(&job, succeeded).await;
                    });
                }
            });
        }

        Self {
            store,
            pools,
            nodes,
            jobs,
            routing,
            prefetch,
            sync,
        }
    }

    /// Load caches, recover persisted jobs, and start every background
    /// loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.routing.reload_rules().await?;
        self.nodes.start().await?;
        self.jobs.start().await?;
        self.prefetch.start();
        self.sync.start();
        Ok(())
    }

    /// Stop the background loops, drain the workers, and close every
    /// peer pool.
    pub async fn shutdown(&self) {
        self.sync.shutdown().await;
        self.prefetch.shutdown().await;
        self.nodes.shutdown().await;
        self.jobs.shutdown().await;
        self.pools.shutdown_all().await;
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
