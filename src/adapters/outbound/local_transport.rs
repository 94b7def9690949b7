//! In-Process Replica Transport
//!
//! Delivers RPCs straight to registered region servers in the same process,
//! with per-server fault injection for failure testing.

use crate::application::RegionServer;
use crate::domain::entities::{ReadRequest, ReadResponse, RegionReplica};
use crate::domain::errors::TransportError;
use crate::domain::ports::ReplicaTransport;
use crate::domain::value_objects::{SequenceId, ServerName};
use crate::replication::EditBatch;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Injected failure for one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connections are refused
    Down,
    /// Requests time out
    Timeout,
}

/// Transport that dispatches directly to in-process region servers.
#[derive(Default)]
pub struct LocalTransport {
    servers: DashMap<ServerName, Arc<RegionServer>>,
    faults: DashMap<ServerName, Fault>,
    requests: AtomicU64,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a server reachable under its own name.
    pub fn register(&self, server: Arc<RegionServer>) {
        self.servers.insert(server.name().clone(), server);
    }

    pub fn unregister(&self, name: &ServerName) -> Option<Arc<RegionServer>> {
        self.servers.remove(name).map(|(_, server)| server)
    }

    /// Refuse every request to `name` until healed.
    pub fn fail_server(&self, name: &ServerName) {
        self.inject(name, Fault::Down);
    }

    pub fn inject(&self, name: &ServerName, fault: Fault) {
        tracing::warn!("injecting {:?} fault for {}", fault, name);
        self.faults.insert(name.clone(), fault);
    }

    pub fn heal_server(&self, name: &ServerName) {
        if self.faults.remove(name).is_some() {
            tracing::info!("healed {}", name);
        }
    }

    /// Total requests attempted, faulted ones included.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn route(&self, name: &ServerName) -> Result<Arc<RegionServer>, TransportError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        match self.faults.get(name).map(|f| *f) {
            Some(Fault::Down) => return Err(TransportError::connection(name, "connection refused")),
            Some(Fault::Timeout) => return Err(TransportError::Timeout(name.clone())),
            None => {}
        }
        self.servers
            .get(name)
            .map(|s| s.value().clone())
            .ok_or_else(|| TransportError::connection(name, "unknown server"))
    }
}

#[async_trait]
impl ReplicaTransport for LocalTransport {
    async fn read(
        &self,
        server: &ServerName,
        replica: &RegionReplica,
        request: ReadRequest,
    ) -> Result<ReadResponse, TransportError> {
        self.route(server)?.read(replica, &request)
    }

    async fn replicate(
        &self,
        server: &ServerName,
        replica: &RegionReplica,
        batch: EditBatch,
    ) -> Result<SequenceId, TransportError> {
        self.route(server)?.replicate(replica, &batch)
    }
}
