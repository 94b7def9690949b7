//! Mini Cluster
//!
//! In-process cluster of region servers hosting the catalog region and its
//! replicas, wired to a live replication agent. Used by the binary and by the
//! integration tests.

use crate::adapters::inbound::RpcServer;
use crate::adapters::outbound::{
    DashMapLocationCache, DashMapMetricsStore, LocalTransport, MemoryAssignment,
    MemoryRegionStore, MemoryWal,
};
use crate::application::{
    table_rows, CatalogMutationPropagator, DeletedTables, HostedRegion, PropagationError,
    ReadRouter, RegionServer, RouterConfig,
};
use crate::domain::entities::{Mutation, RegionInfo, RegionLocation, Row};
use crate::domain::ports::{MetricsStore, RowScanner, WriteAheadLog};
use crate::domain::value_objects::{ReplicaId, SequenceId, ServerName, TableName};
use crate::infrastructure::{await_condition_async, ShutdownController, WaitError};
use crate::replication::{ConfigError, ReplicationAgent, ReplicationConfig, ReplicationEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Shape and tuning of a [`MiniCluster`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of region servers (default: 3)
    pub servers: usize,
    /// Replicas of the catalog region, primary included (default: 3)
    pub catalog_replicas: usize,
    /// First server port; server `i` listens on `base_port + i` (default: 16020)
    pub base_port: u16,
    pub replication: ReplicationConfig,
    pub router: RouterConfig,
    /// Lifetime of router location cache entries (default: 60s)
    pub location_ttl: Duration,
    /// Lifetime of server-side moved hints (default: 30s)
    pub moved_hint_ttl: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            servers: 3,
            catalog_replicas: 3,
            base_port: 16020,
            replication: ReplicationConfig::default(),
            router: RouterConfig::default(),
            location_ttl: Duration::from_secs(60),
            moved_hint_ttl: Duration::from_secs(30),
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn servers(mut self, servers: usize) -> Self {
        self.servers = servers;
        self
    }

    pub fn catalog_replicas(mut self, replicas: usize) -> Self {
        self.catalog_replicas = replicas;
        self
    }

    pub fn replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    pub fn router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    pub fn location_ttl(mut self, ttl: Duration) -> Self {
        self.location_ttl = ttl;
        self
    }

    pub fn moved_hint_ttl(mut self, ttl: Duration) -> Self {
        self.moved_hint_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers == 0 {
            return Err(ConfigError::ZeroServers);
        }
        if self.catalog_replicas == 0 {
            return Err(ConfigError::ZeroReplicaCount);
        }
        if self.location_ttl.is_zero() || self.moved_hint_ttl.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        self.replication.validate()?;
        self.router.validate()
    }

    /// Name of server `index`.
    pub fn server_name(&self, index: usize) -> ServerName {
        ServerName::new(
            format!("rs{}.local", index),
            self.base_port.saturating_add(index as u16),
        )
    }
}

/// A running in-process cluster.
///
/// Catalog replica `i` starts on server `i % servers`. The catalog primary
/// never moves; secondaries can be moved with
/// [`move_catalog_replica`](Self::move_catalog_replica).
pub struct MiniCluster {
    config: ClusterConfig,
    metrics: Arc<DashMapMetricsStore>,
    assignment: Arc<MemoryAssignment>,
    transport: Arc<LocalTransport>,
    servers: Vec<Arc<RegionServer>>,
    catalog_primary: Arc<HostedRegion>,
    catalog_wal: Arc<MemoryWal>,
    deleted: Arc<DeletedTables>,
    propagator: CatalogMutationPropagator,
    agent: ReplicationAgent,
    shutdown: ShutdownController,
}

impl MiniCluster {
    /// Open every catalog replica and start replicating. Must run inside a tokio runtime.
    pub async fn start(config: &ClusterConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let metrics = Arc::new(DashMapMetricsStore::new());
        let assignment = Arc::new(MemoryAssignment::new());
        let transport = Arc::new(LocalTransport::new());

        let servers: Vec<Arc<RegionServer>> = (0..config.servers)
            .map(|i| {
                let server = Arc::new(RegionServer::new(
                    config.server_name(i),
                    metrics.clone(),
                    config.moved_hint_ttl,
                ));
                server.moved_hints().start_gc(config.moved_hint_ttl);
                transport.register(server.clone());
                server
            })
            .collect();

        let catalog = RegionInfo::catalog();
        assignment.set_replica_count(&catalog, config.catalog_replicas);

        let catalog_wal = Arc::new(MemoryWal::new());
        let catalog_primary = Arc::new(HostedRegion::primary(
            catalog.replica(ReplicaId::PRIMARY),
            Arc::new(MemoryRegionStore::new()),
            catalog_wal.clone(),
        ));
        servers[0].open_region(catalog_primary.clone());
        assignment.assign(catalog_primary.replica(), servers[0].name().clone());

        for ordinal in 1..config.catalog_replicas {
            let replica = catalog.replica(ReplicaId(ordinal as u16));
            let host = &servers[ordinal % config.servers];
            host.open_region(Arc::new(HostedRegion::secondary(
                replica.clone(),
                Arc::new(MemoryRegionStore::new()),
            )));
            assignment.assign(&replica, host.name().clone());
        }

        let mut agent = ReplicationAgent::new(
            catalog_primary.clone(),
            config.catalog_replicas,
            config.replication.clone(),
            assignment.clone(),
            transport.clone(),
            metrics.clone(),
        )?;
        agent.start()?;

        let deleted = Arc::new(DeletedTables::new());
        let propagator = CatalogMutationPropagator::new(catalog_primary.clone(), deleted.clone());

        tracing::info!(
            "mini cluster started: servers={} catalog_replicas={} replication={}",
            config.servers,
            config.catalog_replicas,
            config.replication.enabled
        );

        Ok(Self {
            config: config.clone(),
            metrics,
            assignment,
            transport,
            servers,
            catalog_primary,
            catalog_wal,
            deleted,
            propagator,
            agent,
            shutdown: ShutdownController::new(),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn server(&self, index: usize) -> Option<&Arc<RegionServer>> {
        self.servers.get(index)
    }

    pub fn servers(&self) -> &[Arc<RegionServer>] {
        &self.servers
    }

    pub fn metrics(&self) -> &Arc<DashMapMetricsStore> {
        &self.metrics
    }

    pub fn assignment(&self) -> &Arc<MemoryAssignment> {
        &self.assignment
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn catalog_primary(&self) -> &Arc<HostedRegion> {
        &self.catalog_primary
    }

    pub fn propagator(&self) -> &CatalogMutationPropagator {
        &self.propagator
    }

    pub fn agent(&self) -> &ReplicationAgent {
        &self.agent
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// Replication events, available once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ReplicationEvent>> {
        self.agent.take_event_rx()
    }

    /// Router using the cluster's router settings and a fresh location cache.
    pub fn router(&self) -> Result<ReadRouter, ConfigError> {
        self.router_with(self.config.router.clone())
    }

    pub fn router_with(&self, config: RouterConfig) -> Result<ReadRouter, ConfigError> {
        let cache = Arc::new(DashMapLocationCache::new(self.config.location_ttl));
        cache.start_gc(self.config.location_ttl);
        ReadRouter::new(
            config,
            cache,
            self.assignment.clone(),
            self.transport.clone(),
            self.deleted.clone(),
        )
    }

    /// Register `table`, split at `splits`, with its regions spread over the servers.
    pub fn create_table(
        &self,
        table: &TableName,
        splits: &[&[u8]],
    ) -> Result<SequenceId, PropagationError> {
        let mut bounds: Vec<&[u8]> = Vec::with_capacity(splits.len() + 2);
        bounds.push(b"");
        bounds.extend_from_slice(splits);
        bounds.push(b"");

        let locations: Vec<RegionLocation> = bounds
            .windows(2)
            .enumerate()
            .map(|(i, range)| {
                RegionLocation::new(
                    RegionInfo::new(table.clone(), range[0], range[1], i as u64 + 1),
                    self.servers[i % self.servers.len()].name().clone(),
                )
            })
            .collect();
        self.propagator.register_table(table, &locations)
    }

    pub fn delete_table(&self, table: &TableName) -> Result<SequenceId, PropagationError> {
        self.propagator.drop_table(table)
    }

    /// Write raw mutations to the catalog primary.
    pub fn write_catalog(&self, mutations: Vec<Mutation>) -> Option<SequenceId> {
        self.catalog_primary.write(mutations)
    }

    /// The hosted catalog replica with ordinal `id`, wherever it lives now.
    pub fn catalog_replica(&self, id: ReplicaId) -> Option<Arc<HostedRegion>> {
        let replica = RegionInfo::catalog().replica(id);
        let server = self.assignment.placement(&replica)?;
        self.servers
            .iter()
            .find(|s| s.name() == &server)?
            .hosted(&replica.key())
    }

    /// Rows of one catalog replica, read straight from its store.
    pub fn scan_replica(&self, id: ReplicaId, table: Option<&TableName>) -> Vec<Row> {
        match (self.catalog_replica(id), table) {
            (Some(region), Some(table)) => table_rows(&region, table).collect(),
            (Some(region), None) => region.scanner().collect(),
            (None, _) => Vec::new(),
        }
    }

    /// Lazy scan of one catalog replica.
    pub fn replica_scanner(&self, id: ReplicaId) -> Option<RowScanner> {
        self.catalog_replica(id).map(|r| r.scanner())
    }

    /// Read count of every catalog replica, indexed by ordinal.
    pub fn read_counts(&self) -> Vec<u64> {
        (0..self.config.catalog_replicas)
            .map(|i| {
                self.metrics
                    .read_count(&RegionInfo::catalog().replica(ReplicaId(i as u16)).key())
            })
            .collect()
    }

    /// Whether every secondary has applied edits through `through`.
    pub fn is_replicated(&self, through: SequenceId) -> bool {
        (1..self.config.catalog_replicas).all(|i| {
            self.catalog_replica(ReplicaId(i as u16))
                .map(|r| r.last_applied() >= through)
                .unwrap_or(false)
        })
    }

    /// Wait until every secondary has applied edits through `through`.
    pub async fn wait_for_replication(
        &self,
        through: SequenceId,
        timeout: Duration,
    ) -> Result<Duration, WaitError> {
        await_condition_async(|| self.is_replicated(through), timeout, Duration::from_millis(10))
            .await
    }

    /// Move secondary `id` to server `to`, optionally leaving a moved hint behind.
    pub fn move_catalog_replica(
        &self,
        id: ReplicaId,
        to: usize,
        leave_hint: bool,
    ) -> anyhow::Result<ServerName> {
        if id.is_primary() {
            anyhow::bail!("the catalog primary cannot be moved");
        }
        let destination = self
            .servers
            .get(to)
            .ok_or_else(|| anyhow::anyhow!("no server with index {}", to))?;
        let replica = RegionInfo::catalog().replica(id);
        let current = self
            .assignment
            .placement(&replica)
            .ok_or_else(|| anyhow::anyhow!("replica {} is not assigned", replica))?;
        if &current == destination.name() {
            return Ok(current);
        }
        let source = self
            .servers
            .iter()
            .find(|s| s.name() == &current)
            .ok_or_else(|| anyhow::anyhow!("unknown server {}", current))?;

        let hint = leave_hint.then(|| destination.name().clone());
        let region = source
            .close_region(&replica.key(), hint)
            .ok_or_else(|| anyhow::anyhow!("{} does not host {}", current, replica))?;
        destination.open_region(region);
        self.assignment.assign(&replica, destination.name().clone());
        tracing::info!("moved {} from {} to {}", replica, current, destination.name());
        Ok(destination.name().clone())
    }

    /// Flush the store of one catalog replica.
    pub fn flush_catalog(&self, id: ReplicaId) -> bool {
        self.catalog_replica(id)
            .map(|r| r.store().flush())
            .is_some()
    }

    pub fn compact_catalog(&self, id: ReplicaId, major: bool) -> bool {
        self.catalog_replica(id)
            .map(|r| r.store().compact(major))
            .is_some()
    }

    /// Roll the catalog primary's WAL into the archive, then purge the
    /// archived segments every live secondary acknowledged. Returns the
    /// number of segments purged.
    pub fn roll_wal(&self) -> usize {
        self.catalog_wal.roll();
        self.agent.source().retire_acknowledged()
    }

    pub fn catalog_wal(&self) -> &Arc<MemoryWal> {
        &self.catalog_wal
    }

    /// Serve server `index` over TCP; returns the bound address.
    pub async fn serve(&self, index: usize, listen_addr: &str) -> anyhow::Result<SocketAddr> {
        let server = self
            .servers
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("no server with index {}", index))?
            .clone();
        let rpc = RpcServer::bind(server, listen_addr, self.shutdown.clone()).await?;
        let addr = rpc.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = rpc.run().await {
                tracing::error!("rpc server failed: {:?}", e);
            }
        });
        Ok(addr)
    }

    /// Stop replication and every RPC server.
    pub fn shutdown(&self) {
        self.agent.stop();
        self.shutdown.shutdown();
    }
}

impl Drop for MiniCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(ClusterConfig::default().validate().is_ok());
        assert_eq!(
            ClusterConfig::new().servers(0).validate(),
            Err(ConfigError::ZeroServers)
        );
        assert_eq!(
            ClusterConfig::new().catalog_replicas(0).validate(),
            Err(ConfigError::ZeroReplicaCount)
        );
    }

    #[test]
    fn test_server_names() {
        let config = ClusterConfig::default();
        assert_eq!(config.server_name(0).to_string(), "rs0.local:16020");
        assert_eq!(config.server_name(2).to_string(), "rs2.local:16022");
    }

    #[tokio::test]
    async fn test_replica_placement() {
        let cluster = MiniCluster::start(&ClusterConfig::new().servers(2).catalog_replicas(3))
            .await
            .unwrap();
        let placement = |id: u16| {
            cluster
                .assignment()
                .placement(&RegionInfo::catalog().replica(ReplicaId(id)))
                .unwrap()
        };
        assert_eq!(placement(0), cluster.config().server_name(0));
        assert_eq!(placement(1), cluster.config().server_name(1));
        assert_eq!(placement(2), cluster.config().server_name(0));
        assert!(cluster.agent().is_running());
    }

    #[tokio::test]
    async fn test_primary_cannot_move() {
        let cluster = MiniCluster::start(&ClusterConfig::default()).await.unwrap();
        assert!(cluster
            .move_catalog_replica(ReplicaId::PRIMARY, 1, true)
            .is_err());
        assert!(cluster.move_catalog_replica(ReplicaId(1), 7, true).is_err());
    }
}
