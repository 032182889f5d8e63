use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

/// Health status of a remote node, as last observed by the node manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Never probed.
    Unknown,
    Reachable,
    Unreachable,
    /// Probe completed but the peer answered with an error.
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Reachable => "reachable",
            NodeStatus::Unreachable => "unreachable",
            NodeStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(NodeStatus::Unknown),
            "reachable" => Ok(NodeStatus::Reachable),
            "unreachable" => Ok(NodeStatus::Unreachable),
            "error" => Ok(NodeStatus::Error),
            other => Err(ParseEnumError::new("node status", other)),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DIMSE services a peer advertises, plus its preferred transfer syntaxes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub c_store: bool,
    pub c_find: bool,
    pub c_move: bool,
    pub c_echo: bool,
    /// Preferred transfer syntax UIDs, in negotiation order.
    #[serde(default)]
    pub transfer_syntaxes: Vec<String>,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            c_store: true,
            c_find: true,
            c_move: true,
            c_echo: true,
            transfer_syntaxes: Vec::new(),
        }
    }
}

/// A registered peer archive.
///
/// Created by an operator; the `status`, `last_verified`, and `last_error`
/// fields are owned by the node manager's health loop and must not be set
/// by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Surrogate key. Zero until the row is first persisted.
    #[serde(default)]
    pub pk: i64,
    /// Stable, operator-chosen identity.
    pub node_id: String,
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_profile: Option<String>,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RemoteNode {
    pub fn new(
        node_id: impl Into<String>,
        ae_title: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            pk: 0,
            node_id: node_id.into(),
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            tls_profile: None,
            capabilities: NodeCapabilities::default(),
            status: NodeStatus::Unknown,
            last_verified: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            NodeStatus::Unknown,
            NodeStatus::Reachable,
            NodeStatus::Unreachable,
            NodeStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<NodeStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn node_round_trips_through_json() {
        let mut node = RemoteNode::new("peer-1", "PEER1", "10.0.0.7", 11112);
        node.tls_profile = Some("strict".to_string());
        node.last_error = Some("association rejected".to_string());

        let json = serde_json::to_string(&node).unwrap();
        let back: RemoteNode = serde_json::from_str(&json).unwrap();
        assert_eq!(node, back);
    }
}
