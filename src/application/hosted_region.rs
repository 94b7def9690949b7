//! Hosted Region
//!
//! One region replica as opened on a server: its store, its WAL when it is
//! the primary, and its applied-sequence watermark.

use crate::domain::entities::{Mutation, ReadRequest, ReadResponse, RegionReplica, ReplicaKey, WalEdit};
use crate::domain::ports::{RegionStore, RowScanner, WriteAheadLog};
use crate::domain::value_objects::SequenceId;
use parking_lot::Mutex;
use std::sync::Arc;

/// A region replica opened on a server.
///
/// The `applied` lock is the per-region single-writer section: primary writes
/// and sink applies for the same region serialize on it, while different
/// regions proceed independently.
pub struct HostedRegion {
    replica: RegionReplica,
    key: ReplicaKey,
    store: Arc<dyn RegionStore>,
    wal: Option<Arc<dyn WriteAheadLog>>,
    applied: Mutex<SequenceId>,
}

impl HostedRegion {
    /// Open the primary replica, which owns the region's WAL.
    pub fn primary(
        replica: RegionReplica,
        store: Arc<dyn RegionStore>,
        wal: Arc<dyn WriteAheadLog>,
    ) -> Self {
        let applied = wal.durable_sequence();
        Self::open(replica, store, Some(wal), applied)
    }

    /// Open a read-only secondary replica fed by replication.
    pub fn secondary(replica: RegionReplica, store: Arc<dyn RegionStore>) -> Self {
        Self::open(replica, store, None, 0)
    }

    fn open(
        replica: RegionReplica,
        store: Arc<dyn RegionStore>,
        wal: Option<Arc<dyn WriteAheadLog>>,
        applied: SequenceId,
    ) -> Self {
        let key = replica.key();
        Self {
            replica,
            key,
            store,
            wal,
            applied: Mutex::new(applied),
        }
    }

    pub fn replica(&self) -> &RegionReplica {
        &self.replica
    }

    pub fn key(&self) -> &ReplicaKey {
        &self.key
    }

    pub fn store(&self) -> &Arc<dyn RegionStore> {
        &self.store
    }

    pub fn wal(&self) -> Option<&Arc<dyn WriteAheadLog>> {
        self.wal.as_ref()
    }

    pub fn is_primary(&self) -> bool {
        self.replica.is_primary()
    }

    pub fn last_applied(&self) -> SequenceId {
        *self.applied.lock()
    }

    /// Durably log and apply a mutation batch on the primary.
    ///
    /// Returns None on a secondary, which never accepts writes.
    pub fn write(&self, mutations: Vec<Mutation>) -> Option<SequenceId> {
        let wal = self.wal.as_ref()?;
        let mut applied = self.applied.lock();
        let sequence_id = wal.append(mutations.clone());
        wal.sync();
        self.store.apply(&WalEdit::new(sequence_id, mutations));
        *applied = sequence_id;
        Some(sequence_id)
    }

    /// Log a batch built from the current store contents.
    ///
    /// `build` and `commit` both run inside the single-writer section, so no
    /// other write of this region lands between reading the store and logging
    /// the batch. An empty batch logs nothing; `commit` then gets the current
    /// watermark. Returns None on a secondary.
    pub fn write_with<T>(
        &self,
        build: impl FnOnce(&Arc<dyn RegionStore>) -> Vec<Mutation>,
        commit: impl FnOnce(SequenceId, usize) -> T,
    ) -> Option<T> {
        let wal = self.wal.as_ref()?;
        let mut applied = self.applied.lock();
        let mutations = build(&self.store);
        let count = mutations.len();
        if count > 0 {
            let sequence_id = wal.append(mutations.clone());
            wal.sync();
            self.store.apply(&WalEdit::new(sequence_id, mutations));
            *applied = sequence_id;
        }
        Some(commit(*applied, count))
    }

    /// Run `f` inside the region's single-writer section.
    pub fn with_applied<T>(&self, f: impl FnOnce(&mut SequenceId, &dyn RegionStore) -> T) -> T {
        let mut applied = self.applied.lock();
        f(&mut applied, self.store.as_ref())
    }

    /// Serve a read from the local store.
    pub fn read(&self, request: &ReadRequest) -> ReadResponse {
        let last_applied = self.last_applied();
        let rows = match request {
            ReadRequest::Get { row } => self.store.get(row).into_iter().collect(),
            ReadRequest::Scan { start, stop, limit } => {
                let scanner = RowScanner::new(self.store.clone(), start.clone(), stop.clone());
                if *limit == 0 {
                    scanner.collect()
                } else {
                    scanner.take(*limit).collect()
                }
            }
        };
        ReadResponse { rows, last_applied }
    }

    /// Lazy scan over every visible row.
    pub fn scanner(&self) -> RowScanner {
        RowScanner::full(self.store.clone())
    }
}

impl std::fmt::Debug for HostedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedRegion")
            .field("replica", &self.key)
            .field("last_applied", &self.last_applied())
            .finish()
    }
}
