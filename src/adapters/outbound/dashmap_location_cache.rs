//! DashMap Location Cache
//!
//! Implements LocationCache using DashMap for lock-free concurrent access,
//! with TTL'd entries and TTL'd stale markers.

use crate::domain::entities::{LocationEntry, RegionInfo};
use crate::domain::ports::LocationCache;
use crate::domain::value_objects::{ReplicaId, ServerName};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Cached replicas of one region, by ordinal.
type RegionEntries = BTreeMap<ReplicaId, LocationEntry>;

/// DashMap-backed location cache.
///
/// Keyed by encoded region name, so a lookup touches a single shard.
/// Entries expire after `ttl` even if nobody invalidates them, which bounds
/// how long a silent move can misroute reads. Lookups filter expired entries;
/// `start_gc` only reclaims memory.
pub struct DashMapLocationCache {
    entries: Arc<DashMap<String, RegionEntries>>,
    stale: Arc<DashMap<String, Instant>>,
    epoch: AtomicU64,
    ttl: Duration,
}

impl DashMapLocationCache {
    /// Create a cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            stale: Arc::new(DashMap::new()),
            epoch: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached entry of one replica, expired or not.
    pub fn entry(&self, region: &RegionInfo, replica: ReplicaId) -> Option<LocationEntry> {
        self.entries
            .get(&region.encoded_name())
            .and_then(|replicas| replicas.get(&replica).cloned())
    }

    /// Start the background garbage collection task.
    ///
    /// Removes expired locations and stale markers. The task ends once the
    /// cache is dropped; outside a tokio runtime no task is started.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_gc(&self, interval: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime, location cache GC not started");
            return;
        };
        let entries: Weak<DashMap<String, RegionEntries>> = Arc::downgrade(&self.entries);
        let stale = Arc::downgrade(&self.stale);
        let ttl = self.ttl;

        runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let (Some(entries), Some(stale)) = (entries.upgrade(), stale.upgrade()) else {
                    break;
                };
                let removed = sweep(&entries, &stale, ttl);
                if removed > 0 {
                    tracing::debug!("location cache GC removed {} expired entries", removed);
                }
            }
        });
    }

    /// Remove expired entries and markers now; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        sweep(&self.entries, &self.stale, self.ttl)
    }

    /// Number of cached replica locations across all regions.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removals are counted inside `retain`, so concurrent refreshes cannot skew the count.
fn sweep(
    entries: &DashMap<String, RegionEntries>,
    stale: &DashMap<String, Instant>,
    ttl: Duration,
) -> usize {
    let now = Instant::now();
    let mut removed = 0;
    entries.retain(|_, replicas| {
        let before = replicas.len();
        replicas.retain(|_, entry| !entry.is_expired(ttl));
        removed += before - replicas.len();
        !replicas.is_empty()
    });
    stale.retain(|_, expires_at| {
        let live = *expires_at > now;
        if !live {
            removed += 1;
        }
        live
    });
    removed
}

impl LocationCache for DashMapLocationCache {
    fn lookup(&self, region: &RegionInfo) -> Vec<(ReplicaId, ServerName)> {
        match self.entries.get(&region.encoded_name()) {
            Some(replicas) => replicas
                .iter()
                .filter(|(_, entry)| !entry.is_expired(self.ttl))
                .map(|(replica, entry)| (*replica, entry.server.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn refresh(&self, region: &RegionInfo, server: ServerName, replica: ReplicaId) {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries
            .entry(region.encoded_name())
            .or_default()
            .insert(replica, LocationEntry::new(server, epoch));
    }

    fn invalidate(&self, region: &RegionInfo) {
        self.entries.remove(&region.encoded_name());
    }

    fn invalidate_replica(&self, region: &RegionInfo, replica: ReplicaId) {
        let encoded = region.encoded_name();
        if let Some(mut replicas) = self.entries.get_mut(&encoded) {
            replicas.remove(&replica);
        }
        self.entries.remove_if(&encoded, |_, replicas| replicas.is_empty());
    }

    fn mark_stale(&self, region: &RegionInfo, ttl: Duration) {
        self.stale.insert(region.encoded_name(), Instant::now() + ttl);
    }

    fn is_stale(&self, region: &RegionInfo) -> bool {
        let encoded = region.encoded_name();
        match self.stale.get(&encoded).map(|e| *e.value()) {
            Some(expires_at) if expires_at > Instant::now() => true,
            Some(_) => {
                self.stale.remove(&encoded);
                false
            }
            None => false,
        }
    }
}
