//! Replica Selector Service
//!
//! Picks which replica ordinal a load-balanced read should target.
//! This service has NO external dependencies beyond `rand`.

use crate::domain::value_objects::ReplicaId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// How load-balanced reads are spread over a replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SelectionStrategy {
    /// Cycle through ordinals 0..N-1 in order
    #[default]
    RoundRobin,
    /// Pick an ordinal uniformly at random
    Random,
}

/// Replica selector shared by every request of one router.
///
/// The primary is part of the rotation, so with N replicas each one receives
/// roughly 1/N of the reads.
#[derive(Debug, Default)]
pub struct ReplicaSelector {
    strategy: SelectionStrategy,
    next: AtomicUsize,
}

impl ReplicaSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            next: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Pick an ordinal among `replica_count` replicas.
    ///
    /// A replica count of 0 or 1 always yields the primary.
    pub fn pick(&self, replica_count: usize) -> ReplicaId {
        if replica_count <= 1 {
            return ReplicaId::PRIMARY;
        }
        let ordinal = match self.strategy {
            SelectionStrategy::RoundRobin => {
                self.next.fetch_add(1, Ordering::Relaxed) % replica_count
            }
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..replica_count),
        };
        ReplicaId(ordinal as u16)
    }

    /// Restart the round-robin rotation at the primary.
    pub fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
    }
}
