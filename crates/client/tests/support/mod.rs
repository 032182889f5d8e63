//! Shared harness: an in-memory store, a scripted peer, and a memory
//! archive wired into a full system.

use std::sync::Arc;
use std::time::Duration;

use client::{LocalArchive, MemoryArchive, System, SystemConfig};
use client_sql::Store;
use dimse::testing::ScriptedPeer;
use dimse::{tags, Dataset};
use models::{RemoteNode, StudySummary};
use resilience::RetryStrategy;

pub struct Harness {
    pub system: System,
    pub store: Store,
    pub peer: ScriptedPeer,
    pub archive: Arc<MemoryArchive>,
}

impl Harness {
    /// Build a system over fresh in-memory state. `tweak` adjusts the
    /// default test configuration (fast retries, small pools).
    pub async fn new(tweak: impl FnOnce(&mut SystemConfig)) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();

        let store = Store::open_in_memory().await.unwrap();
        let peer = ScriptedPeer::new();
        let archive = Arc::new(MemoryArchive::new());

        let mut config = SystemConfig::default();
        config.pool.min_size = 1;
        config.pool.max_size = 4;
        config.pool.borrow_timeout = Duration::from_secs(2);
        config.jobs.worker_count = 2;
        config.jobs.retry.strategy = RetryStrategy::Exponential;
        config.jobs.retry.initial_delay = Duration::from_millis(10);
        config.jobs.retry.max_delay = Duration::from_secs(1);
        config.nodes.health_interval = Duration::from_secs(3600);
        config.nodes.probe_timeout = Duration::from_millis(500);
        config.prefetch.schedule_tick = Duration::from_secs(3600);
        config.sync.schedule_tick = Duration::from_secs(3600);
        config.sync.child_wait = Duration::from_secs(5);
        tweak(&mut config);

        let system = System::new(
            store.clone(),
            Arc::new(peer.clone()),
            archive.clone() as Arc<dyn LocalArchive>,
            config,
        );
        Self {
            system,
            store,
            peer,
            archive,
        }
    }

    pub async fn register_peer(&self, node_id: &str, ae_title: &str) {
        self.system
            .nodes
            .register(RemoteNode::new(node_id, ae_title, "127.0.0.1", 11112))
            .await
            .unwrap();
    }

    /// Seed the local archive with a study of `n` single-tag instances.
    pub fn seed_local_study(&self, study_uid: &str, patient_id: &str, modality: &str, n: usize) {
        let instances: Vec<Dataset> = (0..n)
            .map(|i| {
                Dataset::new()
                    .with(tags::STUDY_INSTANCE_UID, study_uid)
                    .with(tags::SOP_INSTANCE_UID, format!("{study_uid}.{}", i + 1))
                    .with(tags::PATIENT_ID, patient_id)
                    .with(tags::MODALITY, modality)
            })
            .collect();
        self.archive.put_study(
            StudySummary {
                study_uid: study_uid.to_string(),
                patient_id: patient_id.to_string(),
                modality: modality.to_string(),
                instance_count: n as i64,
                last_modified: None,
            },
            instances,
        );
    }
}

/// Poll until `check` passes or the deadline expires.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
