//! Location Cache Port
//!
//! Client-side mapping from a region identity to the known locations of its
//! replicas. Implementations must be safe for many concurrent readers.

use crate::domain::entities::RegionInfo;
use crate::domain::value_objects::{ReplicaId, ServerName};
use std::time::Duration;

/// Cache of replica locations, consulted by the read router on every request.
///
/// A stale read of the cache is acceptable: the router corrects it through
/// `invalidate` when a server reports it no longer hosts the region.
pub trait LocationCache: Send + Sync {
    /// Live (non-expired) cached locations, ordered by replica ordinal.
    ///
    /// The primary comes first when it is cached.
    fn lookup(&self, region: &RegionInfo) -> Vec<(ReplicaId, ServerName)>;

    /// Record a freshly observed location with a new freshness epoch.
    fn refresh(&self, region: &RegionInfo, server: ServerName, replica: ReplicaId);

    /// Drop every cached location of the region.
    fn invalidate(&self, region: &RegionInfo);

    /// Drop the cached location of a single replica.
    fn invalidate_replica(&self, region: &RegionInfo, replica: ReplicaId);

    /// Mark the region's secondaries as untrustworthy for `ttl`.
    fn mark_stale(&self, region: &RegionInfo, ttl: Duration);

    /// Whether a live stale marker exists for the region.
    fn is_stale(&self, region: &RegionInfo) -> bool;
}
