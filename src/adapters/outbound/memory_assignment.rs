//! In-Memory Region Assignment
//!
//! Implements RegionLocator with a DashMap of replica placements and a
//! broadcast channel of reassignment events.

use crate::domain::entities::{Reassignment, RegionInfo, RegionReplica, ReplicaKey};
use crate::domain::ports::RegionLocator;
use crate::domain::value_objects::{ReplicaId, ServerName};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// In-memory assignment service.
pub struct MemoryAssignment {
    placements: DashMap<ReplicaKey, ServerName>,
    replica_counts: DashMap<String, usize>,
    events: broadcast::Sender<Reassignment>,
}

impl MemoryAssignment {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            placements: DashMap::new(),
            replica_counts: DashMap::new(),
            events,
        }
    }

    /// Fix the replica count of a region.
    pub fn set_replica_count(&self, region: &RegionInfo, count: usize) {
        self.replica_counts.insert(region.encoded_name(), count);
    }

    /// Place a replica on `server`, publishing a reassignment if it moved.
    pub fn assign(&self, replica: &RegionReplica, server: ServerName) {
        let key = replica.key();
        let previous = self.placements.insert(key.clone(), server.clone());
        if previous.as_ref() == Some(&server) {
            return;
        }
        tracing::debug!(
            "assigned {} to {} (was {:?})",
            key,
            server,
            previous.as_ref().map(|s| s.to_string())
        );
        let _ = self.events.send(Reassignment {
            replica: key,
            from: previous,
            to: Some(server),
        });
    }

    /// Remove a replica's placement.
    pub fn unassign(&self, replica: &RegionReplica) {
        let key = replica.key();
        if let Some((_, previous)) = self.placements.remove(&key) {
            let _ = self.events.send(Reassignment {
                replica: key,
                from: Some(previous),
                to: None,
            });
        }
    }

    /// Current placement of a replica.
    pub fn placement(&self, replica: &RegionReplica) -> Option<ServerName> {
        self.placements.get(&replica.key()).map(|e| e.value().clone())
    }
}

impl Default for MemoryAssignment {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegionLocator for MemoryAssignment {
    async fn resolve(&self, region: &RegionInfo, replica: ReplicaId) -> Option<ServerName> {
        self.placement(&region.replica(replica))
    }

    async fn replica_count(&self, region: &RegionInfo) -> usize {
        self.replica_counts
            .get(&region.encoded_name())
            .map(|e| *e.value())
            .unwrap_or(1)
    }

    fn subscribe(&self) -> broadcast::Receiver<Reassignment> {
        self.events.subscribe()
    }
}
