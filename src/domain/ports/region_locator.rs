//! Region Locator Port
//!
//! Defines the interface of the region assignment service.

use crate::domain::entities::{Reassignment, RegionInfo};
use crate::domain::value_objects::{ReplicaId, ServerName};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Authoritative source of region replica placement.
///
/// This is an outbound port: the subsystem never decides placement, it only
/// asks where a replica currently lives.
#[async_trait]
pub trait RegionLocator: Send + Sync {
    /// Current server of one replica, or None if it is unassigned.
    async fn resolve(&self, region: &RegionInfo, replica: ReplicaId) -> Option<ServerName>;

    /// Configured replica count of the region (fixed for the table's lifetime).
    async fn replica_count(&self, region: &RegionInfo) -> usize;

    /// Subscribe to reassignment notifications.
    fn subscribe(&self) -> broadcast::Receiver<Reassignment>;
}
