//! The narrow DIMSE client surface the operation fabric consumes.
//!
//! Real SCU implementations (and the codec/transfer-syntax machinery under
//! them) live elsewhere; this crate defines only the traits the fabric
//! calls through, the dataset view those calls exchange, and the wire
//! error type handlers translate into the shared fault taxonomy.

mod channel;
mod dataset;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channel::{Channel, Connector, MoveProgress, Target};
pub use dataset::{tags, Dataset, Tag};

use models::{Fault, FaultKind};

/// Errors surfaced by DIMSE operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("association rejected: {0}")]
    AssociationRejected(String),
    #[error("association aborted: {0}")]
    Aborted(String),
    #[error("peer refused {operation}: status 0x{status:04x}")]
    Refused { operation: &'static str, status: u16 },
    #[error("unsupported SOP class: {0}")]
    UnsupportedSopClass(String),
    #[error("missing required identifier: {0}")]
    MissingIdentifier(&'static str),
    #[error("malformed dataset: {0}")]
    Malformed(String),
    #[error("channel is closed")]
    Closed,
}

impl Error {
    /// Classify into the shared taxonomy. Timeouts, resets, rejects, and
    /// aborts are transient; refusals and data problems are terminal.
    pub fn fault(&self) -> Fault {
        let kind = match self {
            Error::Timeout(_)
            | Error::ConnectionReset
            | Error::AssociationRejected(_)
            | Error::Aborted(_)
            | Error::Closed => FaultKind::TransientNetwork,
            Error::Refused { .. } | Error::UnsupportedSopClass(_) => FaultKind::RemoteRefusal,
            Error::MissingIdentifier(_) | Error::Malformed(_) => FaultKind::DataError,
        };
        Fault::new(kind, self.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(
            Error::Timeout("read".into()).fault().kind,
            FaultKind::TransientNetwork
        );
        assert_eq!(
            Error::Refused {
                operation: "c-store",
                status: 0xA700
            }
            .fault()
            .kind,
            FaultKind::RemoteRefusal
        );
        assert_eq!(
            Error::MissingIdentifier("study uid").fault().kind,
            FaultKind::DataError
        );
    }
}
