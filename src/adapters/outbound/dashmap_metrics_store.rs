//! DashMap Metrics Store
//!
//! Implements MetricsStore using DashMap for lock-free concurrent access.

use crate::domain::entities::{ReplicaKey, ReplicationProgress};
use crate::domain::ports::MetricsStore;
use crate::domain::value_objects::SequenceId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a single region replica.
#[derive(Debug, Default)]
pub struct ReplicaMetrics {
    /// Read requests served
    pub reads: AtomicU64,
    /// Last sequence id applied locally
    pub applied: AtomicU64,
    /// Last sequence id handed to the transport (source side)
    pub shipped: AtomicU64,
    /// Last sequence id confirmed by the sink (source side)
    pub acknowledged: AtomicU64,
}

/// DashMap-backed metrics store.
///
/// Each replica has its own entry. Watermarks only move forward.
pub struct DashMapMetricsStore {
    metrics: DashMap<ReplicaKey, ReplicaMetrics>,
}

impl DashMapMetricsStore {
    /// Create a new metrics store.
    pub fn new() -> Self {
        Self {
            metrics: DashMap::new(),
        }
    }

    /// Every replica with recorded metrics, sorted.
    pub fn replicas(&self) -> Vec<ReplicaKey> {
        let mut keys: Vec<ReplicaKey> = self.metrics.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn load(&self, replica: &ReplicaKey, field: impl Fn(&ReplicaMetrics) -> &AtomicU64) -> u64 {
        self.metrics
            .get(replica)
            .map(|m| field(m.value()).load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn raise(
        &self,
        replica: &ReplicaKey,
        value: SequenceId,
        field: impl Fn(&ReplicaMetrics) -> &AtomicU64,
    ) {
        let entry = self.metrics.entry(replica.clone()).or_default();
        field(entry.value()).fetch_max(value, Ordering::Relaxed);
    }
}

impl Default for DashMapMetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore for DashMapMetricsStore {
    fn record_read(&self, replica: &ReplicaKey) {
        self.metrics
            .entry(replica.clone())
            .or_default()
            .reads
            .fetch_add(1, Ordering::Relaxed);
    }

    fn read_count(&self, replica: &ReplicaKey) -> u64 {
        self.load(replica, |m| &m.reads)
    }

    fn record_applied(&self, replica: &ReplicaKey, sequence_id: SequenceId) {
        self.raise(replica, sequence_id, |m| &m.applied);
    }

    fn last_applied(&self, replica: &ReplicaKey) -> SequenceId {
        self.load(replica, |m| &m.applied)
    }

    fn record_shipped(&self, replica: &ReplicaKey, sequence_id: SequenceId) {
        self.raise(replica, sequence_id, |m| &m.shipped);
    }

    fn record_acknowledged(&self, replica: &ReplicaKey, sequence_id: SequenceId) {
        self.raise(replica, sequence_id, |m| &m.acknowledged);
    }

    fn progress(&self, replica: &ReplicaKey) -> ReplicationProgress {
        ReplicationProgress {
            shipped: self.load(replica, |m| &m.shipped),
            acknowledged: self.load(replica, |m| &m.acknowledged),
        }
    }
}
