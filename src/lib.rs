//! meta-replica Library
//!
//! Asynchronous replication of the catalog region to read-only replicas, and
//! a stale-read-tolerant router that load-balances catalog lookups across them.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod harness;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use application::{
    CatalogMutationPropagator, DeletedTables, HostedRegion, ReadOutcome, ReadRouter,
    RegionServer, RouteState, RouterConfig,
};
pub use config::load_config;
pub use domain::entities::{Mutation, ReadRequest, RegionInfo, RegionLocation, Row, WalEdit};
pub use domain::errors::{ReadError, SinkError, TransportError};
pub use domain::ports::{LocationCache, MetricsStore, RegionLocator, ReplicaTransport};
pub use domain::value_objects::{ReadMode, ReplicaId, SequenceId, ServerName, TableName};
pub use harness::{ClusterConfig, MiniCluster};
pub use replication::{ReplicationAgent, ReplicationConfig, ReplicationEvent};
