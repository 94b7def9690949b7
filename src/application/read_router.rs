//! Read Router
//!
//! Routes catalog reads to the primary or to a load-balanced secondary and
//! recovers from misroutes: moved regions, stale cached locations, and
//! unreachable servers.
//!
//! Each request walks a small state machine:
//!
//! ```text
//! SelectTarget -> Issue -> Succeed
//!                   |----> RetryAlternate -> Issue   (moved hint, once)
//!                   |----> RetryPrimary   -> Issue   (no hint, transient error, deleted rows)
//!                   `----> Fail                      (retry budget exhausted)
//! ```

use crate::application::DeletedTables;
use crate::domain::entities::{ReadRequest, RegionInfo, RegionLocation, Row};
use crate::domain::errors::{ReadError, TransportError};
use crate::domain::ports::{LocationCache, RegionLocator, ReplicaTransport};
use crate::domain::services::{ReplicaSelector, RetryPolicy, SelectionStrategy};
use crate::domain::value_objects::{ReadMode, ReplicaId, SequenceId, ServerName, TableName};
use crate::replication::{validate_retry, ConfigError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Read routing settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Primary-only or load-balanced reads (default: PrimaryOnly)
    pub mode: ReadMode,
    /// How load-balanced reads pick a replica (default: RoundRobin)
    pub strategy: SelectionStrategy,
    /// Attempt budget and backoff for one request
    pub retry: RetryPolicy,
    /// Deadline for one request, retries included (default: 10s)
    pub request_timeout: Duration,
    /// How long a region reads from its primary after a secondary proved stale (default: 3s)
    pub stale_marker_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: ReadMode::PrimaryOnly,
            strategy: SelectionStrategy::RoundRobin,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(10),
            stale_marker_ttl: Duration::from_secs(3),
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: ReadMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn stale_marker_ttl(mut self, ttl: Duration) -> Self {
        self.stale_marker_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        validate_retry(&self.retry)
    }
}

/// Step of a routed request, recorded for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteState {
    SelectTarget,
    /// Request sent to `replica` on `server`
    Issue { replica: ReplicaId, server: ServerName },
    /// Following a moved hint
    RetryAlternate(ServerName),
    RetryPrimary,
    Succeed,
    Fail,
}

/// A successful routed read.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub rows: Vec<Row>,
    /// Replica that answered
    pub served_by: ReplicaId,
    pub server: ServerName,
    /// Last sequence id applied on the answering replica
    pub last_applied: SequenceId,
    pub path: Vec<RouteState>,
}

impl ReadOutcome {
    /// Number of moved-hint redirects taken.
    pub fn redirects(&self) -> usize {
        self.path
            .iter()
            .filter(|s| matches!(s, RouteState::RetryAlternate(_)))
            .count()
    }

    pub fn fell_back_to_primary(&self) -> bool {
        self.path.contains(&RouteState::RetryPrimary)
    }
}

/// Client-side router for catalog reads.
pub struct ReadRouter {
    config: RouterConfig,
    cache: Arc<dyn LocationCache>,
    locator: Arc<dyn RegionLocator>,
    transport: Arc<dyn ReplicaTransport>,
    selector: ReplicaSelector,
    deleted: Arc<DeletedTables>,
}

impl ReadRouter {
    pub fn new(
        config: RouterConfig,
        cache: Arc<dyn LocationCache>,
        locator: Arc<dyn RegionLocator>,
        transport: Arc<dyn ReplicaTransport>,
        deleted: Arc<DeletedTables>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            selector: ReplicaSelector::new(config.strategy),
            config,
            cache,
            locator,
            transport,
            deleted,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn selector(&self) -> &ReplicaSelector {
        &self.selector
    }

    pub fn cache(&self) -> &Arc<dyn LocationCache> {
        &self.cache
    }

    /// Read the catalog region.
    pub async fn read(
        &self,
        request: ReadRequest,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome, ReadError> {
        self.read_region(&RegionInfo::catalog(), request, cancel).await
    }

    /// Read any region, bounded by the request timeout and `cancel`.
    pub async fn read_region(
        &self,
        region: &RegionInfo,
        request: ReadRequest,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome, ReadError> {
        let timeout = self.config.request_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("read of {} cancelled", region.encoded_name());
                Err(ReadError::Cancelled)
            }
            routed = tokio::time::timeout(timeout, self.route(region, request)) => {
                routed.unwrap_or(Err(ReadError::Timeout(timeout)))
            }
        }
    }

    /// Point lookup of one catalog row.
    pub async fn get(
        &self,
        row: impl Into<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<Option<Row>, ReadError> {
        let outcome = self.read(ReadRequest::get(row), cancel).await?;
        Ok(outcome.rows.into_iter().next())
    }

    /// Every catalog row of `table`.
    pub async fn scan_table(
        &self,
        table: &TableName,
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>, ReadError> {
        if self.deleted.is_deleted(table) {
            return Err(ReadError::TableDeleted(table.clone()));
        }
        let outcome = self.read(ReadRequest::table_scan(table), cancel).await?;
        Ok(outcome.rows)
    }

    /// Decoded locations of every region of `table`, in key order.
    pub async fn table_regions(
        &self,
        table: &TableName,
        cancel: &CancellationToken,
    ) -> Result<Vec<RegionLocation>, ReadError> {
        self.scan_table(table, cancel)
            .await?
            .iter()
            .map(|row| {
                RegionLocation::from_catalog_value(&row.value).map_err(|e| {
                    ReadError::CorruptCatalogRow {
                        row: row.key_str(),
                        reason: e.to_string(),
                    }
                })
            })
            .collect()
    }

    /// Location of the region of `table` that contains `row`.
    pub async fn locate(
        &self,
        table: &TableName,
        row: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RegionLocation, ReadError> {
        self.table_regions(table, cancel)
            .await?
            .into_iter()
            .find(|location| location.region.contains_row(row))
            .ok_or_else(|| ReadError::RegionNotFound {
                table: table.clone(),
                row: String::from_utf8_lossy(row).into_owned(),
            })
    }

    async fn select(&self, region: &RegionInfo) -> ReplicaId {
        match self.config.mode {
            ReadMode::PrimaryOnly => ReplicaId::PRIMARY,
            ReadMode::LoadBalance if self.cache.is_stale(region) => ReplicaId::PRIMARY,
            ReadMode::LoadBalance => {
                let count = self.locator.replica_count(region).await;
                self.selector.pick(count)
            }
        }
    }

    /// Cached location of a replica, resolved and cached on a miss.
    async fn locate_replica(
        &self,
        region: &RegionInfo,
        replica: ReplicaId,
    ) -> Result<ServerName, ReadError> {
        if let Some((_, server)) = self
            .cache
            .lookup(region)
            .into_iter()
            .find(|(id, _)| *id == replica)
        {
            return Ok(server);
        }
        let server = self
            .locator
            .resolve(region, replica)
            .await
            .ok_or_else(|| ReadError::NoLocation(region.replica(replica).to_string()))?;
        self.cache.refresh(region, server.clone(), replica);
        Ok(server)
    }

    async fn route(&self, region: &RegionInfo, request: ReadRequest) -> Result<ReadOutcome, ReadError> {
        let mut path = vec![RouteState::SelectTarget];
        let mut replica = self.select(region).await;
        let mut server = match self.locate_replica(region, replica).await {
            Ok(server) => server,
            Err(e) if !replica.is_primary() => {
                tracing::debug!("no location for secondary: {}, using primary", e);
                replica = ReplicaId::PRIMARY;
                self.locate_replica(region, replica).await?
            }
            Err(e) => return Err(e),
        };
        let mut redirected = false;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            path.push(RouteState::Issue {
                replica,
                server: server.clone(),
            });
            let target = region.replica(replica);

            let last = match self.transport.read(&server, &target, request.clone()).await {
                Ok(response) if !replica.is_primary() && self.deleted.shadows(&response.rows) => {
                    tracing::debug!("{} on {} still shows a dropped table", target, server);
                    TransportError::Remote(format!("{} returned rows of a dropped table", target))
                }
                Ok(response) => {
                    self.cache.refresh(region, server.clone(), replica);
                    path.push(RouteState::Succeed);
                    return Ok(ReadOutcome {
                        rows: response.rows,
                        served_by: replica,
                        server,
                        last_applied: response.last_applied,
                        path,
                    });
                }
                Err(e) => e,
            };

            if !self.config.retry.allows(attempts) {
                tracing::warn!(
                    "read of {} failed after {} attempts: {}",
                    region.encoded_name(),
                    attempts,
                    last
                );
                path.push(RouteState::Fail);
                return Err(ReadError::Exhausted { attempts, last });
            }

            match &last {
                TransportError::RegionNotServed { moved_to, .. } => {
                    self.cache.invalidate_replica(region, replica);
                    match moved_to {
                        Some(destination) if !redirected && destination != &server => {
                            tracing::info!("{} moved from {} to {}", target, server, destination);
                            redirected = true;
                            server = destination.clone();
                            path.push(RouteState::RetryAlternate(server.clone()));
                            continue;
                        }
                        _ => {
                            if !replica.is_primary() {
                                tracing::warn!(
                                    "{} not served by {}, reading primary for {:?}",
                                    target,
                                    server,
                                    self.config.stale_marker_ttl
                                );
                                self.cache.mark_stale(region, self.config.stale_marker_ttl);
                            }
                        }
                    }
                }
                e if e.is_transient() => {
                    tracing::warn!("read of {} on {} failed: {}", target, server, e);
                    if matches!(e, TransportError::Connection { .. }) {
                        self.cache.invalidate_replica(region, replica);
                    }
                    tokio::time::sleep(self.config.retry.delay(attempts)).await;
                }
                e => {
                    tracing::debug!("read of {} on {} rejected: {}", target, server, e);
                }
            }

            path.push(RouteState::RetryPrimary);
            replica = ReplicaId::PRIMARY;
            server = self.locate_replica(region, replica).await?;
        }
    }
}
