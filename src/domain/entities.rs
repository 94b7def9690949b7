//! Domain Entities - Core business objects
//!
//! These entities represent the regions, replicas, edits and rows the
//! replication and routing subsystem moves around. They have no external
//! dependencies and contain only business logic.

use crate::domain::value_objects::{ReplicaId, SequenceId, ServerName, TableName, ROW_DELIMITER};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Identity of a region: a contiguous key range of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionInfo {
    /// Table this region belongs to
    pub table: TableName,
    /// Inclusive start key (empty = start of table)
    pub start_key: Vec<u8>,
    /// Exclusive end key (empty = end of table)
    pub end_key: Vec<u8>,
    /// Creation id, disambiguates regions that reuse a start key
    pub region_id: u64,
}

impl RegionInfo {
    pub fn new(
        table: TableName,
        start_key: impl Into<Vec<u8>>,
        end_key: impl Into<Vec<u8>>,
        region_id: u64,
    ) -> Self {
        Self {
            table,
            start_key: start_key.into(),
            end_key: end_key.into(),
            region_id,
        }
    }

    /// The single region of the catalog table.
    pub fn catalog() -> Self {
        Self::new(TableName::catalog(), Vec::new(), Vec::new(), 1)
    }

    /// Full region name, which is also the region's catalog row key:
    /// `table,start_key,region_id`.
    pub fn region_name(&self) -> Vec<u8> {
        let mut name = self.table.row_prefix();
        name.extend_from_slice(&self.start_key);
        name.push(ROW_DELIMITER);
        name.extend_from_slice(self.region_id.to_string().as_bytes());
        name
    }

    /// Short stable identifier used in logs, caches and moved hints.
    pub fn encoded_name(&self) -> String {
        format!("{:08x}", crc32fast::hash(&self.region_name()))
    }

    /// Whether `row` falls in `[start_key, end_key)`.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_slice()
            && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }

    /// Address one replica of this region.
    pub fn replica(&self, replica_id: ReplicaId) -> RegionReplica {
        RegionReplica {
            region: self.clone(),
            replica_id,
        }
    }
}

/// One replica of a region: ordinal 0 is the primary, the rest are secondaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionReplica {
    pub region: RegionInfo,
    pub replica_id: ReplicaId,
}

impl RegionReplica {
    pub fn is_primary(&self) -> bool {
        self.replica_id.is_primary()
    }

    pub fn key(&self) -> ReplicaKey {
        ReplicaKey::new(self.region.encoded_name(), self.replica_id)
    }
}

impl std::fmt::Display for RegionReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.region.encoded_name(), self.replica_id)
    }
}

/// Compact map key for a region replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaKey {
    pub encoded_name: String,
    pub replica_id: ReplicaId,
}

impl ReplicaKey {
    pub fn new(encoded_name: impl Into<String>, replica_id: ReplicaId) -> Self {
        Self {
            encoded_name: encoded_name.into(),
            replica_id,
        }
    }
}

impl std::fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.encoded_name, self.replica_id)
    }
}

/// A single row mutation carried by a WAL edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Write (or overwrite) a row
    Put { row: Vec<u8>, value: Vec<u8> },
    /// Delete a row; stored as a tombstone until a major compaction
    DeleteRow { row: Vec<u8> },
}

impl Mutation {
    pub fn put(row: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            row: row.into(),
            value: value.into(),
        }
    }

    pub fn delete(row: impl Into<Vec<u8>>) -> Self {
        Self::DeleteRow { row: row.into() }
    }

    pub fn row(&self) -> &[u8] {
        match self {
            Self::Put { row, .. } | Self::DeleteRow { row } => row,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::DeleteRow { .. })
    }
}

/// A durable primary mutation batch, stamped with its region sequence id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEdit {
    pub sequence_id: SequenceId,
    pub mutations: Vec<Mutation>,
}

impl WalEdit {
    pub fn new(sequence_id: SequenceId, mutations: Vec<Mutation>) -> Self {
        Self {
            sequence_id,
            mutations,
        }
    }
}

/// A visible row returned by reads and scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Row {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Row key as text, for logs and assertions.
    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// Where a region is served, as recorded in its catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLocation {
    pub region: RegionInfo,
    pub server: ServerName,
}

impl RegionLocation {
    pub fn new(region: RegionInfo, server: ServerName) -> Self {
        Self { region, server }
    }

    /// Catalog row for this location.
    pub fn to_catalog_row(&self) -> Result<Row, serde_json::Error> {
        Ok(Row::new(self.region.region_name(), serde_json::to_vec(self)?))
    }

    /// Decode the value of a catalog row.
    pub fn from_catalog_value(value: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(value)
    }
}

/// Replication progress of one secondary, as seen by the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationProgress {
    /// Highest sequence id handed to the transport
    pub shipped: SequenceId,
    /// Highest sequence id the sink confirmed as applied
    pub acknowledged: SequenceId,
}

/// Server-side redirect left behind when a region moves away.
#[derive(Debug, Clone)]
pub struct MovedHint {
    /// Server now hosting the region
    pub destination: ServerName,
    /// When the region moved
    pub recorded_at: Instant,
}

impl MovedHint {
    pub fn new(destination: ServerName) -> Self {
        Self {
            destination,
            recorded_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.recorded_at.elapsed() > ttl
    }
}

/// Client-side cached location of one replica.
#[derive(Debug, Clone)]
pub struct LocationEntry {
    pub server: ServerName,
    /// Freshness epoch, bumped on every refresh
    pub epoch: u64,
    pub cached_at: Instant,
}

impl LocationEntry {
    pub fn new(server: ServerName, epoch: u64) -> Self {
        Self {
            server,
            epoch,
            cached_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Assignment change published by the region assignment service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassignment {
    pub replica: ReplicaKey,
    pub from: Option<ServerName>,
    pub to: Option<ServerName>,
}

/// A read against one region replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadRequest {
    /// Point lookup of a single row
    Get { row: Vec<u8> },
    /// Ordered scan of `[start, stop)`; `limit == 0` means unbounded
    Scan {
        start: Vec<u8>,
        stop: Option<Vec<u8>>,
        limit: usize,
    },
}

impl ReadRequest {
    pub fn get(row: impl Into<Vec<u8>>) -> Self {
        Self::Get { row: row.into() }
    }

    /// Scan every catalog row of a table.
    pub fn table_scan(table: &TableName) -> Self {
        Self::Scan {
            start: table.row_prefix(),
            stop: Some(table.row_prefix_end()),
            limit: 0,
        }
    }
}

/// Rows returned by a replica, with the replica's replication watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub rows: Vec<Row>,
    /// Last sequence id applied on the replica that served the read
    pub last_applied: SequenceId,
}
