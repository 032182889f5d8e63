//! Per-peer pool registry. Pools are created lazily the first time a job
//! or probe needs a peer, from the node's registered endpoint, and torn
//! down when the node is unregistered or the system shuts down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use client_sql::NodeRepository;
use dimse::{Connector, Target};
use models::Fault;
use pool::{Pool, PoolConfig};
use tokio::sync::RwLock;

pub struct Pools {
    connector: Arc<dyn Connector>,
    nodes: NodeRepository,
    config: PoolConfig,
    calling_ae: String,
    operation_timeout: Duration,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl Pools {
    pub fn new(
        connector: Arc<dyn Connector>,
        nodes: NodeRepository,
        config: PoolConfig,
        calling_ae: String,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            nodes,
            config,
            calling_ae,
            operation_timeout,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// The pool for a registered node, creating and initializing it on
    /// first use.
    pub async fn for_node(&self, node_id: &str) -> Result<Arc<Pool>, Fault> {
        if let Some(existing) = self.pools.read().await.get(node_id) {
            return Ok(existing.clone());
        }

        let node = self
            .nodes
            .find_by_id(&node_id.to_string())
            .await
            .map_err(|err| Fault::resource(format!("node lookup failed: {err}")))?
            .ok_or_else(|| Fault::validation(format!("unknown node {node_id}")))?;

        let mut pools = self.pools.write().await;
        // Another caller may have won the race while we were loading.
        if let Some(existing) = pools.get(node_id) {
            return Ok(existing.clone());
        }

        let target = Target::from_node(&node, &self.calling_ae, self.operation_timeout);
        let pool = Arc::new(Pool::new(
            target,
            self.connector.clone(),
            self.config.clone(),
        ));
        pool.initialize()
            .await
            .map_err(|err| Fault::transient(format!("pool initialization failed: {err}")))?;

        pools.insert(node_id.to_string(), pool.clone());
        Ok(pool)
    }

    /// Drop a node's pool (endpoint changed or node removed). The next use
    /// re-dials with fresh settings.
    pub async fn invalidate(&self, node_id: &str) {
        let removed = self.pools.write().await.remove(node_id);
        if let Some(pool) = removed {
            pool.shutdown().await;
        }
    }

    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<Pool>> = self.pools.write().await.drain().map(|(_, p)| p).collect();
        for pool in drained {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use client_sql::Store;
    use dimse::testing::ScriptedPeer;
    use models::RemoteNode;

    async fn fixture() -> (Pools, ScriptedPeer, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let nodes = NodeRepository::new(&store);
        nodes
            .save(&RemoteNode::new("peer-1", "PEER1", "127.0.0.1", 11112))
            .await
            .unwrap();
        let peer = ScriptedPeer::new();
        let pools = Pools::new(
            Arc::new(peer.clone()),
            NodeRepository::new(&store),
            PoolConfig {
                min_size: 1,
                ..PoolConfig::default()
            },
            "CLIENT".to_string(),
            Duration::from_secs(5),
        );
        (pools, peer, store)
    }

    #[tokio::test]
    async fn pools_are_created_once_per_node() {
        let (pools, peer, _store) = fixture().await;

        let a = pools.for_node("peer-1").await.unwrap();
        let b = pools.for_node("peer-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(peer.connect_calls(), 1);

        let missing = pools.for_node("nope").await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn invalidate_redials_on_next_use() {
        let (pools, peer, _store) = fixture().await;

        let _ = pools.for_node("peer-1").await.unwrap();
        pools.invalidate("peer-1").await;
        let _ = pools.for_node("peer-1").await.unwrap();
        assert_eq!(peer.connect_calls(), 2);
    }
}
