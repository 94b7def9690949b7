//! Region Server
//!
//! Hosts region replicas: serves reads, accepts primary writes, fronts the
//! replication sink, and leaves moved hints behind for regions that move away.

use crate::adapters::outbound::DashMapMovedHintStore;
use crate::application::HostedRegion;
use crate::domain::entities::{Mutation, ReadRequest, ReadResponse, RegionReplica, ReplicaKey};
use crate::domain::errors::TransportError;
use crate::domain::ports::{MetricsStore, MovedHintStore};
use crate::domain::value_objects::{SequenceId, ServerName};
use crate::replication::{EditBatch, Message, ReplicationSink};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// A server hosting region replicas.
pub struct RegionServer {
    name: ServerName,
    regions: DashMap<ReplicaKey, Arc<HostedRegion>>,
    moved: Arc<DashMapMovedHintStore>,
    sink: ReplicationSink,
    metrics: Arc<dyn MetricsStore>,
}

impl RegionServer {
    pub fn new(name: ServerName, metrics: Arc<dyn MetricsStore>, moved_hint_ttl: Duration) -> Self {
        Self {
            name,
            regions: DashMap::new(),
            moved: Arc::new(DashMapMovedHintStore::new(moved_hint_ttl)),
            sink: ReplicationSink::new(metrics.clone()),
            metrics,
        }
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn moved_hints(&self) -> &Arc<DashMapMovedHintStore> {
        &self.moved
    }

    /// Start serving a replica here.
    pub fn open_region(&self, region: Arc<HostedRegion>) {
        let key = region.key().clone();
        self.moved.remove(&key.to_string());
        tracing::info!("{} opened region replica {}", self.name, key);
        self.regions.insert(key, region);
    }

    /// Stop serving a replica, leaving a moved hint if it went to `moved_to`.
    pub fn close_region(
        &self,
        key: &ReplicaKey,
        moved_to: Option<ServerName>,
    ) -> Option<Arc<HostedRegion>> {
        let (_, region) = self.regions.remove(key)?;
        if let Some(destination) = moved_to {
            tracing::info!("{} closed {}, moved to {}", self.name, key, destination);
            self.moved.record(&key.to_string(), destination);
        } else {
            tracing::info!("{} closed {}", self.name, key);
        }
        Some(region)
    }

    pub fn hosted(&self, key: &ReplicaKey) -> Option<Arc<HostedRegion>> {
        self.regions.get(key).map(|e| e.value().clone())
    }

    /// Keys of every hosted replica, sorted.
    pub fn hosted_regions(&self) -> Vec<ReplicaKey> {
        let mut keys: Vec<ReplicaKey> = self.regions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn lookup(&self, replica: &RegionReplica) -> Result<Arc<HostedRegion>, TransportError> {
        let key = replica.key();
        self.hosted(&key).ok_or_else(|| TransportError::RegionNotServed {
            region: key.to_string(),
            server: self.name.clone(),
            moved_to: self.moved.get(&key.to_string()),
        })
    }

    /// Serve a read and count it against the replica.
    pub fn read(
        &self,
        replica: &RegionReplica,
        request: &ReadRequest,
    ) -> Result<ReadResponse, TransportError> {
        let region = self.lookup(replica)?;
        self.metrics.record_read(region.key());
        Ok(region.read(request))
    }

    /// Apply a replicated batch to a hosted secondary.
    pub fn replicate(
        &self,
        replica: &RegionReplica,
        batch: &EditBatch,
    ) -> Result<SequenceId, TransportError> {
        let region = self.lookup(replica)?;
        self.sink
            .apply(&region, batch)
            .map_err(TransportError::Rejected)
    }

    /// Write to a hosted primary.
    pub fn write(
        &self,
        replica: &RegionReplica,
        mutations: Vec<Mutation>,
    ) -> Result<SequenceId, TransportError> {
        let region = self.lookup(replica)?;
        region
            .write(mutations)
            .ok_or_else(|| TransportError::NotPrimary(self.name.clone()))
    }

    /// Answer one RPC message.
    pub fn handle(&self, message: Message) -> Message {
        match message {
            Message::Read { replica, request } => match self.read(&replica, &request) {
                Ok(response) => Message::ReadResult(response),
                Err(e) => Message::Failure(e),
            },
            Message::Replicate { replica, batch } => match self.replicate(&replica, &batch) {
                Ok(last_applied) => Message::Applied { last_applied },
                Err(e) => Message::Failure(e),
            },
            Message::Ping => Message::Pong,
            other => Message::Failure(TransportError::Remote(format!(
                "unexpected {} request",
                other.type_name()
            ))),
        }
    }
}

impl std::fmt::Debug for RegionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionServer")
            .field("name", &self.name)
            .field("regions", &self.regions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{DashMapMetricsStore, MemoryRegionStore, MemoryWal};
    use crate::domain::entities::{RegionInfo, WalEdit};
    use crate::domain::errors::SinkError;
    use crate::domain::value_objects::ReplicaId;

    fn server(n: u16) -> RegionServer {
        RegionServer::new(
            ServerName::new(format!("rs{}", n), 16020),
            Arc::new(DashMapMetricsStore::new()),
            Duration::from_secs(30),
        )
    }

    fn secondary() -> Arc<HostedRegion> {
        Arc::new(HostedRegion::secondary(
            RegionInfo::catalog().replica(ReplicaId(1)),
            Arc::new(MemoryRegionStore::new()),
        ))
    }

    #[test]
    fn test_read_counts_per_replica() {
        let rs = server(1);
        let region = secondary();
        let replica = region.replica().clone();
        rs.open_region(region);

        rs.read(&replica, &ReadRequest::get("x")).unwrap();
        rs.read(&replica, &ReadRequest::get("y")).unwrap();
        assert_eq!(rs.metrics.read_count(&replica.key()), 2);
    }

    #[test]
    fn test_unhosted_region_not_served() {
        let rs = server(1);
        let replica = RegionInfo::catalog().replica(ReplicaId(1));
        match rs.read(&replica, &ReadRequest::get("x")) {
            Err(TransportError::RegionNotServed { moved_to, server, .. }) => {
                assert_eq!(moved_to, None);
                assert_eq!(&server, rs.name());
            }
            other => panic!("expected RegionNotServed, got {:?}", other),
        }
        assert_eq!(rs.metrics.read_count(&replica.key()), 0);
    }

    #[test]
    fn test_close_leaves_moved_hint() {
        let rs = server(1);
        let region = secondary();
        let replica = region.replica().clone();
        rs.open_region(region);

        let destination = ServerName::new("rs2", 16020);
        assert!(rs.close_region(&replica.key(), Some(destination.clone())).is_some());
        match rs.read(&replica, &ReadRequest::get("x")) {
            Err(TransportError::RegionNotServed { moved_to, .. }) => {
                assert_eq!(moved_to, Some(destination))
            }
            other => panic!("expected RegionNotServed, got {:?}", other),
        }
    }

    #[test]
    fn test_reopen_clears_hint() {
        let rs = server(1);
        let region = secondary();
        let key = region.key().clone();
        rs.open_region(region);
        let closed = rs.close_region(&key, Some(ServerName::new("rs2", 1))).unwrap();
        rs.open_region(closed);
        assert!(rs.moved_hints().get(&key.to_string()).is_none());
    }

    #[test]
    fn test_replicate_and_reject() {
        let rs = server(1);
        let region = secondary();
        let replica = region.replica().clone();
        rs.open_region(region);

        let batch = EditBatch::new("c", vec![WalEdit::new(1, vec![Mutation::put("k", "v")])]);
        assert_eq!(rs.replicate(&replica, &batch).unwrap(), 1);

        let gap = EditBatch::new("c", vec![WalEdit::new(5, vec![Mutation::put("k", "v")])]);
        assert!(matches!(
            rs.replicate(&replica, &gap),
            Err(TransportError::Rejected(SinkError::Gap { .. }))
        ));
    }

    #[test]
    fn test_write_only_on_primary() {
        let rs = server(0);
        let primary = Arc::new(HostedRegion::primary(
            RegionInfo::catalog().replica(ReplicaId::PRIMARY),
            Arc::new(MemoryRegionStore::new()),
            Arc::new(MemoryWal::new()),
        ));
        let primary_replica = primary.replica().clone();
        let region = secondary();
        let secondary_replica = region.replica().clone();
        rs.open_region(primary);
        rs.open_region(region);

        assert_eq!(rs.write(&primary_replica, vec![Mutation::put("a", "1")]).unwrap(), 1);
        assert!(matches!(
            rs.write(&secondary_replica, vec![Mutation::put("a", "1")]),
            Err(TransportError::NotPrimary(_))
        ));
        assert_eq!(rs.hosted_regions().len(), 2);
    }

    #[test]
    fn test_handle_dispatch() {
        let rs = server(1);
        let region = secondary();
        let replica = region.replica().clone();
        rs.open_region(region);

        assert!(matches!(rs.handle(Message::Ping), Message::Pong));
        match rs.handle(Message::Read {
            replica: replica.clone(),
            request: ReadRequest::get("x"),
        }) {
            Message::ReadResult(response) => assert!(response.rows.is_empty()),
            other => panic!("unexpected {}", other.type_name()),
        }
        assert!(matches!(
            rs.handle(Message::Applied { last_applied: 1 }),
            Message::Failure(TransportError::Remote(_))
        ));
    }
}
