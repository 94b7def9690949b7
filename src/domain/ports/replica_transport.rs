//! Replica Transport Port
//!
//! Point-to-point RPC used by both replication shipping and client reads.

use crate::domain::entities::{ReadRequest, ReadResponse, RegionReplica};
use crate::domain::errors::TransportError;
use crate::domain::value_objects::{SequenceId, ServerName};
use crate::replication::EditBatch;
use async_trait::async_trait;

/// Reliable request/response delivery with timeout and connection-error signalling.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Issue a read against one replica hosted on `server`.
    async fn read(
        &self,
        server: &ServerName,
        replica: &RegionReplica,
        request: ReadRequest,
    ) -> Result<ReadResponse, TransportError>;

    /// Ship an edit batch to a secondary's sink.
    ///
    /// Returns the secondary's last-applied sequence id after the batch.
    async fn replicate(
        &self,
        server: &ServerName,
        replica: &RegionReplica,
        batch: EditBatch,
    ) -> Result<SequenceId, TransportError>;
}
