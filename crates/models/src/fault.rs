use serde::{Deserialize, Serialize};

/// Classification of a failure, shared by job handlers, the retry layer,
/// and persistence. Handlers translate raw wire errors into this taxonomy
/// before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Timeout, connection reset, association reject. Retryable.
    TransientNetwork,
    /// Protocol-level negative response from the peer. Terminal.
    RemoteRefusal,
    /// Malformed dataset or missing identifier. Terminal.
    DataError,
    /// Pool exhausted, repository unavailable, disk full. Retryable.
    LocalResource,
    /// Rejected at the API boundary; never reaches persistence.
    Validation,
    /// Cooperative cancellation. Not an error.
    Canceled,
}

impl FaultKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FaultKind::TransientNetwork | FaultKind::LocalResource)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::TransientNetwork => "transient_network",
            FaultKind::RemoteRefusal => "remote_refusal",
            FaultKind::DataError => "data_error",
            FaultKind::LocalResource => "local_resource",
            FaultKind::Validation => "validation",
            FaultKind::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure. The job record keeps `to_string()` of this as
/// `error_message`; `details` goes to `error_details` verbatim.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FaultKind::TransientNetwork, message)
    }

    pub fn refusal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::RemoteRefusal, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(FaultKind::DataError, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(FaultKind::LocalResource, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Validation, message)
    }

    pub fn canceled() -> Self {
        Self::new(FaultKind::Canceled, "canceled")
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryability_follows_kind() {
        assert!(Fault::transient("timeout").is_retryable());
        assert!(Fault::resource("pool exhausted").is_retryable());
        assert!(!Fault::refusal("access denied").is_retryable());
        assert!(!Fault::data("missing study uid").is_retryable());
        assert!(!Fault::canceled().is_retryable());
    }

    #[test]
    fn display_carries_kind_and_message() {
        let fault = Fault::transient("read timed out").with_details("peer 10.0.0.7:104");
        assert_eq!(fault.to_string(), "transient_network: read timed out");
    }
}
