//! Registry and health monitor of peer archives. The in-memory index
//! mirrors the node repository; only the health loop mutates status
//! fields.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use client_sql::{JobRepository, NodeRepository};
use models::{NodeStatus, RemoteNode};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditSink};
use crate::pools::Pools;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node {0} not found")]
    NotFound(String),
    #[error("node {0} already registered")]
    AlreadyRegistered(String),
    #[error("node {0} still has jobs referencing it")]
    InUse(String),
    #[error("invalid node: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] client_sql::Error),
}

#[derive(Debug, Clone)]
pub struct NodeManagerConfig {
    pub health_interval: Duration,
    /// Parallelism bound for `verify_all`.
    pub verify_parallelism: usize,
    /// Deadline for borrowing a probe connection.
    pub probe_timeout: Duration,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(60),
            verify_parallelism: 4,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

type StatusCallback = dyn Fn(&str, NodeStatus, NodeStatus) + Send + Sync;

struct NodesInner {
    config: NodeManagerConfig,
    repo: NodeRepository,
    jobs: JobRepository,
    pools: Arc<Pools>,
    index: RwLock<HashMap<String, RemoteNode>>,
    callbacks: StdRwLock<Vec<Arc<StatusCallback>>>,
    audit: Arc<dyn AuditSink>,
    shutdown: CancellationToken,
}

pub struct NodeManager {
    inner: Arc<NodesInner>,
    health_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl NodeManager {
    pub fn new(
        config: NodeManagerConfig,
        repo: NodeRepository,
        jobs: JobRepository,
        pools: Arc<Pools>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            inner: Arc::new(NodesInner {
                config,
                repo,
                jobs,
                pools,
                index: RwLock::new(HashMap::new()),
                callbacks: StdRwLock::new(Vec::new()),
                audit,
                shutdown: CancellationToken::new(),
            }),
            health_task: Mutex::new(None),
        }
    }

    /// Fill the index from the repository and start the health loop.
    pub async fn start(&self) -> Result<(), NodeError> {
        let nodes = self.inner.repo.find_all(None).await?;
        {
            let mut index = self.inner.index.write().await;
            index.clear();
            for node in nodes {
                index.insert(node.node_id.clone(), node);
            }
        }

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(inner.config.health_interval) => {}
                    _ = inner.shutdown.cancelled() => return,
                }
                verify_all_impl(&inner).await;
            }
        });
        *self.health_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.health_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn register(&self, node: RemoteNode) -> Result<(), NodeError> {
        validate(&node)?;
        if self.inner.index.read().await.contains_key(&node.node_id) {
            return Err(NodeError::AlreadyRegistered(node.node_id));
        }
        let mut node = node;
        node.status = NodeStatus::Unknown;
        node.created_at = client_sql::truncate_to_seconds(node.created_at);
        node.pk = self.inner.repo.save(&node).await?;
        tracing::info!(node_id = %node.node_id, ae_title = %node.ae_title, "node registered");
        self.inner
            .index
            .write()
            .await
            .insert(node.node_id.clone(), node);
        Ok(())
    }

    /// Update endpoint settings; health fields are preserved and the
    /// node's pool is invalidated so new settings take effect.
    pub async fn update(&self, node: RemoteNode) -> Result<(), NodeError> {
        validate(&node)?;
        let current = self
            .inner
            .repo
            .find_by_id(&node.node_id)
            .await?
            .ok_or_else(|| NodeError::NotFound(node.node_id.clone()))?;

        let mut node = node;
        node.pk = current.pk;
        node.status = current.status;
        node.last_verified = current.last_verified;
        node.last_error = current.last_error;
        node.created_at = current.created_at;
        self.inner.repo.save(&node).await?;
        self.inner
            .index
            .write()
            .await
            .insert(node.node_id.clone(), node.clone());
        self.inner.pools.invalidate(&node.node_id).await;
        Ok(())
    }

    /// Remove a node. Refused while any live job references it.
    pub async fn unregister(&self, node_id: &str) -> Result<(), NodeError> {
        if self
            .inner
            .repo
            .find_by_id(&node_id.to_string())
            .await?
            .is_none()
        {
            return Err(NodeError::NotFound(node_id.to_string()));
        }
        if self.inner.jobs.node_in_use(node_id).await? {
            return Err(NodeError::InUse(node_id.to_string()));
        }
        self.inner.repo.remove(&node_id.to_string()).await?;
        self.inner.index.write().await.remove(node_id);
        self.inner.pools.invalidate(node_id).await;
        tracing::info!(node_id, "node unregistered");
        Ok(())
    }

    pub async fn get(&self, node_id: &str) -> Option<RemoteNode> {
        self.inner.index.read().await.get(node_id).cloned()
    }

    pub async fn list(&self) -> Vec<RemoteNode> {
        let mut nodes: Vec<RemoteNode> = self.inner.index.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Probe one node with C-ECHO and record the outcome.
    pub async fn verify(&self, node_id: &str) -> Result<NodeStatus, NodeError> {
        verify_impl(&self.inner, node_id).await
    }

    /// Probe every registered node, bounded by `verify_parallelism`.
    pub async fn verify_all(&self) -> HashMap<String, NodeStatus> {
        verify_all_impl(&self.inner).await
    }

    /// Observe status changes. The callback is invoked only when the
    /// status actually changed, on the probing task.
    pub fn subscribe_status<F>(&self, callback: F)
    where
        F: Fn(&str, NodeStatus, NodeStatus) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .write()
            .unwrap()
            .push(Arc::new(callback));
    }
}

fn validate(node: &RemoteNode) -> Result<(), NodeError> {
    if node.node_id.is_empty() {
        return Err(NodeError::Validation("node_id must not be empty".into()));
    }
    if node.ae_title.is_empty() || node.ae_title.len() > 16 {
        return Err(NodeError::Validation(
            "ae_title must be 1..=16 characters".into(),
        ));
    }
    if node.host.is_empty() {
        return Err(NodeError::Validation("host must not be empty".into()));
    }
    if node.port == 0 {
        return Err(NodeError::Validation("port must be non-zero".into()));
    }
    Ok(())
}

async fn verify_impl(inner: &Arc<NodesInner>, node_id: &str) -> Result<NodeStatus, NodeError> {
    let old_status = inner
        .index
        .read()
        .await
        .get(node_id)
        .map(|n| n.status)
        .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;

    // A node we cannot reach at all is unreachable; a node that answers
    // the association but fails the echo is in error.
    enum Probe {
        NoChannel(String),
        EchoFailed(dimse::Error),
        Ok,
    }

    let probe = async {
        let pool = match inner.pools.for_node(node_id).await {
            Ok(pool) => pool,
            Err(fault) => return Probe::NoChannel(fault.to_string()),
        };
        let mut conn = match pool.borrow_with_timeout(inner.config.probe_timeout).await {
            Ok(conn) => conn,
            Err(err) => return Probe::NoChannel(err.to_string()),
        };
        match conn.echo().await {
            Ok(()) => Probe::Ok,
            Err(err) => Probe::EchoFailed(err),
        }
    };

    let (new_status, last_error) = match probe.await {
        Probe::Ok => (NodeStatus::Reachable, None),
        Probe::NoChannel(message) => (NodeStatus::Unreachable, Some(message)),
        Probe::EchoFailed(err) => (NodeStatus::Error, Some(err.to_string())),
    };

    let verified_at = Utc::now();
    inner
        .repo
        .update_health(node_id, new_status, verified_at, last_error.as_deref())
        .await?;
    {
        let mut index = inner.index.write().await;
        if let Some(node) = index.get_mut(node_id) {
            node.status = new_status;
            node.last_verified = Some(client_sql::truncate_to_seconds(verified_at));
            node.last_error = last_error.clone();
        }
    }

    if new_status != old_status {
        inner.audit.emit(AuditEvent::NodeStatusChanged {
            node_id,
            from: old_status,
            to: new_status,
        });
        let callbacks: Vec<Arc<StatusCallback>> = inner.callbacks.read().unwrap().clone();
        for callback in callbacks {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(node_id, old_status, new_status)
            }));
            if outcome.is_err() {
                tracing::error!(node_id, "node status callback panicked");
            }
        }
    }
    Ok(new_status)
}

async fn verify_all_impl(inner: &Arc<NodesInner>) -> HashMap<String, NodeStatus> {
    let node_ids: Vec<String> = inner.index.read().await.keys().cloned().collect();
    let semaphore = Arc::new(Semaphore::new(inner.config.verify_parallelism.max(1)));

    let probes = node_ids.into_iter().map(|node_id| {
        let inner = inner.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire_owned().await;
            let status = verify_impl(&inner, &node_id).await;
            (node_id, status)
        }
    });

    let mut results = HashMap::new();
    for (node_id, status) in futures::future::join_all(probes).await {
        match status {
            Ok(status) => {
                results.insert(node_id, status);
            }
            Err(err) => {
                tracing::warn!(node_id, error = %err, "node verification failed");
            }
        }
    }
    results
}
