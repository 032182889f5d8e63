use chrono::{DateTime, Utc};
use models::{NodeCapabilities, NodeStatus, RemoteNode};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::repository::{
    format_opt_ts, format_ts, parse_opt_ts, parse_ts, EntityMapping, Repository, SqlValue,
};
use crate::{Error, Result, Store};

const TABLE: &str = "nodes";

pub struct NodeMapping;

impl EntityMapping for NodeMapping {
    type Entity = RemoteNode;
    type Key = String;

    const TABLE: &'static str = TABLE;
    const ID_COLUMN: &'static str = "node_id";

    fn columns() -> &'static [&'static str] {
        &[
            "node_id",
            "ae_title",
            "host",
            "port",
            "tls_profile",
            "capabilities_json",
            "status",
            "last_verified",
            "last_error",
            "created_at",
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<RemoteNode> {
        let status: String = row.try_get("status")?;
        let capabilities: String = row.try_get("capabilities_json")?;
        Ok(RemoteNode {
            pk: row.try_get("pk")?,
            node_id: row.try_get("node_id")?,
            ae_title: row.try_get("ae_title")?,
            host: row.try_get("host")?,
            port: row.try_get::<i64, _>("port")? as u16,
            tls_profile: row.try_get("tls_profile")?,
            capabilities: serde_json::from_str::<NodeCapabilities>(&capabilities)
                .map_err(|err| Error::malformed(TABLE, err))?,
            status: status.parse().map_err(|err| Error::malformed(TABLE, err))?,
            last_verified: parse_opt_ts(
                TABLE,
                row.try_get::<Option<String>, _>("last_verified")?.as_deref(),
            )?,
            last_error: row.try_get("last_error")?,
            created_at: parse_ts(TABLE, &row.try_get::<String, _>("created_at")?)?,
        })
    }

    fn to_values(node: &RemoteNode) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("node_id", node.node_id.clone().into()),
            ("ae_title", node.ae_title.clone().into()),
            ("host", node.host.clone().into()),
            ("port", (node.port as i64).into()),
            ("tls_profile", node.tls_profile.clone().into()),
            (
                "capabilities_json",
                serde_json::to_string(&node.capabilities)
                    .unwrap_or_else(|_| "{}".to_string())
                    .into(),
            ),
            ("status", node.status.as_str().into()),
            ("last_verified", format_opt_ts(node.last_verified)),
            ("last_error", node.last_error.clone().into()),
            ("created_at", format_ts(node.created_at).into()),
        ]
    }

    fn key(node: &RemoteNode) -> String {
        node.node_id.clone()
    }

    fn has_key(node: &RemoteNode) -> bool {
        !node.node_id.is_empty()
    }
}

#[derive(Clone)]
pub struct NodeRepository {
    base: Repository<NodeMapping>,
}

impl NodeRepository {
    pub fn new(store: &Store) -> Self {
        Self {
            base: Repository::new(store),
        }
    }

    /// Write the outcome of a health probe.
    pub async fn update_health(
        &self,
        node_id: &str,
        status: NodeStatus,
        verified_at: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE nodes SET status = ?2, last_verified = ?3, last_error = ?4 \
             WHERE node_id = ?1",
        )
        .bind(node_id)
        .bind(status.as_str())
        .bind(format_ts(verified_at))
        .bind(last_error)
        .execute(self.base.pool())
        .await?;
        Ok(())
    }
}

impl std::ops::Deref for NodeRepository {
    type Target = Repository<NodeMapping>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::truncate_to_seconds;

    #[tokio::test]
    async fn nodes_round_trip_and_update_health() {
        let store = Store::open_in_memory().await.unwrap();
        let repo = NodeRepository::new(&store);

        let mut node = RemoteNode::new("peer-1", "PEER1", "10.0.0.7", 11112);
        node.created_at = truncate_to_seconds(node.created_at);
        node.capabilities.transfer_syntaxes = vec!["1.2.840.10008.1.2.1".to_string()];

        let pk = repo.save(&node).await.unwrap();
        node.pk = pk;
        let found = repo
            .find_by_id(&"peer-1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, node);

        let verified_at = truncate_to_seconds(Utc::now());
        repo.update_health("peer-1", NodeStatus::Reachable, verified_at, None)
            .await
            .unwrap();
        let found = repo
            .find_by_id(&"peer-1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.status, NodeStatus::Reachable);
        assert_eq!(found.last_verified, Some(verified_at));

        assert!(repo.remove(&"peer-1".to_string()).await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 0);
    }
}
