//! Domain Errors
//!
//! Error taxonomy shared by the replication pipeline and the read router.

use crate::domain::value_objects::{SequenceId, ServerName, TableName};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a sink refused an edit batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SinkError {
    /// The batch starts above `last_applied + 1`; the source must resend.
    #[error("sequence gap: expected {expected}, received {received}")]
    Gap {
        expected: SequenceId,
        received: SequenceId,
        last_applied: SequenceId,
    },
    /// Sequence ids inside the batch are not consecutive.
    #[error("batch is not contiguous at sequence {at}")]
    NotContiguous { at: SequenceId },
    #[error("batch checksum verification failed")]
    Checksum,
    #[error("batch addressed to region {0} which is not a secondary replica")]
    NotSecondary(String),
}

/// Failure signalled by the RPC transport or by the remote replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TransportError {
    #[error("request to {0} timed out")]
    Timeout(ServerName),
    #[error("connection to {server} failed: {reason}")]
    Connection { server: ServerName, reason: String },
    /// The server does not host the region; `moved_to` carries a moved hint if one is live.
    #[error("region {region} is not served by {server}")]
    RegionNotServed {
        region: String,
        server: ServerName,
        moved_to: Option<ServerName>,
    },
    #[error("sink rejected batch: {0}")]
    Rejected(SinkError),
    #[error("write rejected by {0}: not the primary replica")]
    NotPrimary(ServerName),
    #[error("remote error: {0}")]
    Remote(String),
}

impl TransportError {
    /// Timeouts and connection errors are worth retrying against the same target.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection { .. })
    }

    pub fn connection(server: &ServerName, reason: impl Into<String>) -> Self {
        Self::Connection {
            server: server.clone(),
            reason: reason.into(),
        }
    }
}

/// Failure reading the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalReadError {
    /// The segment holding `requested` was purged before it was consumed.
    #[error("wal segment lost: requested sequence {requested}, oldest available {first_available}")]
    SegmentLost {
        requested: SequenceId,
        first_available: SequenceId,
    },
}

/// Failure surfaced by the read router to its caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("read failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: TransportError,
    },
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("read cancelled")]
    Cancelled,
    #[error("no location known for region {0}")]
    NoLocation(String),
    #[error("table {0} has been deleted")]
    TableDeleted(TableName),
    #[error("no region of table {table} contains row {row}")]
    RegionNotFound { table: TableName, row: String },
    #[error("corrupt catalog row {row}: {reason}")]
    CorruptCatalogRow { row: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let server = ServerName::new("rs1", 16020);
        assert!(TransportError::Timeout(server.clone()).is_transient());
        assert!(TransportError::connection(&server, "refused").is_transient());
        assert!(!TransportError::RegionNotServed {
            region: "abc".into(),
            server: server.clone(),
            moved_to: None,
        }
        .is_transient());
        assert!(!TransportError::Rejected(SinkError::Checksum).is_transient());
    }

    #[test]
    fn test_error_messages() {
        let gap = SinkError::Gap {
            expected: 4,
            received: 9,
            last_applied: 3,
        };
        assert_eq!(gap.to_string(), "sequence gap: expected 4, received 9");

        let exhausted = ReadError::Exhausted {
            attempts: 3,
            last: TransportError::Timeout(ServerName::new("rs1", 1)),
        };
        assert!(exhausted.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_transport_error_wire_roundtrip() {
        let err = TransportError::RegionNotServed {
            region: "abcd1234".into(),
            server: ServerName::new("rs1", 16020),
            moved_to: Some(ServerName::new("rs2", 16020)),
        };
        let bytes = bincode::serialize(&err).unwrap();
        let decoded: TransportError = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, err);
    }
}
