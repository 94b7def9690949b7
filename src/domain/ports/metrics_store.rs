//! Metrics Store Port
//!
//! Defines the interface for the observable per-replica counters.

use crate::domain::entities::{ReplicaKey, ReplicationProgress};
use crate::domain::value_objects::SequenceId;

/// Store for per-replica counters.
///
/// Read counts are exposed so load distribution can be verified externally;
/// applied/shipped/acknowledged watermarks expose replication lag.
pub trait MetricsStore: Send + Sync {
    /// Count one read request served by a replica.
    fn record_read(&self, replica: &ReplicaKey);

    /// Total read requests served by a replica.
    fn read_count(&self, replica: &ReplicaKey) -> u64;

    /// Record the last sequence id applied on a replica. Never moves backwards.
    fn record_applied(&self, replica: &ReplicaKey, sequence_id: SequenceId);

    /// Last sequence id applied on a replica.
    fn last_applied(&self, replica: &ReplicaKey) -> SequenceId;

    /// Record the last sequence id handed to the transport for a secondary.
    fn record_shipped(&self, replica: &ReplicaKey, sequence_id: SequenceId);

    /// Record the last sequence id a secondary acknowledged.
    fn record_acknowledged(&self, replica: &ReplicaKey, sequence_id: SequenceId);

    /// Source-side progress for a secondary.
    fn progress(&self, replica: &ReplicaKey) -> ReplicationProgress;
}
