use std::time::Duration;

use async_trait::async_trait;

use crate::{Dataset, Error};

/// Where and how to reach a peer for a new association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub ae_title: String,
    pub host: String,
    pub port: u16,
    /// Our own AE title, presented to the peer.
    pub calling_ae: String,
    pub operation_timeout: Duration,
    pub tls_profile: Option<String>,
}

impl Target {
    pub fn from_node(node: &models::RemoteNode, calling_ae: &str, timeout: Duration) -> Self {
        Self {
            ae_title: node.ae_title.clone(),
            host: node.host.clone(),
            port: node.port,
            calling_ae: calling_ae.to_string(),
            operation_timeout: timeout,
            tls_profile: node.tls_profile.clone(),
        }
    }
}

/// Progress of a C-MOVE, reported once per completed sub-operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveProgress {
    pub completed: u64,
    pub total: u64,
    pub current: Option<String>,
}

/// An established association with one peer.
///
/// The progress callbacks return `true` to continue; returning `false`
/// asks the implementation to stop at the next sub-operation boundary,
/// which surfaces as [`Error::Aborted`]. In-flight sub-operations are
/// allowed to finish.
#[async_trait]
pub trait Channel: Send {
    /// C-ECHO liveness probe.
    async fn echo(&mut self) -> Result<(), Error>;

    /// C-FIND: all datasets matching the query identifier.
    async fn find(&mut self, query: &Dataset) -> Result<Vec<Dataset>, Error>;

    /// C-MOVE the matched studies to `destination_ae`.
    async fn move_study(
        &mut self,
        destination_ae: &str,
        query: &Dataset,
        progress: &mut (dyn FnMut(MoveProgress) -> bool + Send),
    ) -> Result<(), Error>;

    /// C-STORE a single composite object.
    async fn store(
        &mut self,
        object: &Dataset,
        progress: &mut (dyn FnMut(u64, u64) -> bool + Send),
    ) -> Result<(), Error>;

    /// Whether the association is still usable.
    fn is_alive(&self) -> bool;

    /// Clear association-level state before the channel is reused.
    async fn reset(&mut self) -> Result<(), Error>;

    /// Stable identifier for logs and pool statistics.
    fn id(&self) -> &str;
}

/// Factory for new associations; one implementation per SCU stack.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Channel>, Error>;
}
