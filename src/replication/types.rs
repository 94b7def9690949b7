//! Replication Types
//!
//! Edit batches and the messages exchanged between replicas.

use crate::domain::entities::{ReadRequest, ReadResponse, RegionReplica, WalEdit};
use crate::domain::errors::TransportError;
use crate::domain::value_objects::SequenceId;
use serde::{Deserialize, Serialize};

/// A contiguous run of WAL edits for one region, shipped as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditBatch {
    /// Encoded name of the region the edits belong to
    pub region: String,
    /// Edits in sequence order
    pub edits: Vec<WalEdit>,
    /// CRC32 checksum for integrity
    pub checksum: u32,
}

impl EditBatch {
    /// Create a new batch.
    pub fn new(region: impl Into<String>, edits: Vec<WalEdit>) -> Self {
        let checksum = Self::compute_checksum(&edits);
        Self {
            region: region.into(),
            edits,
            checksum,
        }
    }

    /// Verify the checksum.
    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(&self.edits)
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn first_sequence(&self) -> Option<SequenceId> {
        self.edits.first().map(|e| e.sequence_id)
    }

    pub fn last_sequence(&self) -> Option<SequenceId> {
        self.edits.last().map(|e| e.sequence_id)
    }

    /// Sequence id of the first edit that does not follow its predecessor by exactly one.
    pub fn discontinuity(&self) -> Option<SequenceId> {
        self.edits
            .windows(2)
            .find(|pair| pair[1].sequence_id != pair[0].sequence_id + 1)
            .map(|pair| pair[1].sequence_id)
    }

    fn compute_checksum(edits: &[WalEdit]) -> u32 {
        let bytes = bincode::serialize(edits).unwrap_or_default();
        crc32fast::hash(&bytes)
    }
}

/// Message types for replica communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Read against a hosted replica
    Read {
        replica: RegionReplica,
        request: ReadRequest,
    },
    /// Rows returned for a read
    ReadResult(ReadResponse),
    /// Edit batch for a secondary's sink
    Replicate {
        replica: RegionReplica,
        batch: EditBatch,
    },
    /// Sink acknowledgement
    Applied { last_applied: SequenceId },
    /// Any request failure
    Failure(TransportError),
    /// Ping for liveness
    Ping,
    /// Pong response
    Pong,
}

impl Message {
    /// Get the message type as a string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Read { .. } => "Read",
            Message::ReadResult(_) => "ReadResult",
            Message::Replicate { .. } => "Replicate",
            Message::Applied { .. } => "Applied",
            Message::Failure(_) => "Failure",
            Message::Ping => "Ping",
            Message::Pong => "Pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Mutation;

    fn edits(range: std::ops::RangeInclusive<u64>) -> Vec<WalEdit> {
        range
            .map(|seq| WalEdit::new(seq, vec![Mutation::put(format!("r{}", seq), "v")]))
            .collect()
    }

    #[test]
    fn test_batch_checksum() {
        let batch = EditBatch::new("abcd", edits(1..=3));
        assert!(batch.verify());
        assert_eq!(batch.first_sequence(), Some(1));
        assert_eq!(batch.last_sequence(), Some(3));
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_batch_checksum_fails_on_tamper() {
        let mut batch = EditBatch::new("abcd", edits(1..=2));
        batch.edits[0].mutations = vec![Mutation::delete("r1")];
        assert!(!batch.verify());
    }

    #[test]
    fn test_batch_discontinuity() {
        assert_eq!(EditBatch::new("r", edits(4..=8)).discontinuity(), None);

        let mut gappy = edits(1..=2);
        gappy.extend(edits(5..=6));
        assert_eq!(EditBatch::new("r", gappy).discontinuity(), Some(5));
    }

    #[test]
    fn test_empty_batch() {
        let batch = EditBatch::new("r", Vec::new());
        assert!(batch.is_empty());
        assert_eq!(batch.first_sequence(), None);
        assert_eq!(batch.discontinuity(), None);
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(Message::Ping.type_name(), "Ping");
        assert_eq!(Message::Applied { last_applied: 3 }.type_name(), "Applied");
    }
}
