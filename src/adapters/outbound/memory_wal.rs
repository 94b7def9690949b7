//! In-Memory Write-Ahead Log
//!
//! Implements WriteAheadLog with an active segment, an archive of rolled
//! segments, and a watch channel carrying the durable watermark.

use crate::domain::entities::{Mutation, WalEdit};
use crate::domain::errors::WalReadError;
use crate::domain::ports::WriteAheadLog;
use crate::domain::value_objects::SequenceId;
use parking_lot::RwLock;
use std::collections::VecDeque;
use tokio::sync::watch;

struct WalState {
    next_sequence: SequenceId,
    active: Vec<WalEdit>,
    /// Oldest first
    archived: VecDeque<Vec<WalEdit>>,
    /// Every edit at or below this id has been purged
    purged_through: SequenceId,
}

/// In-memory write-ahead log of one region.
pub struct MemoryWal {
    state: RwLock<WalState>,
    durable_tx: watch::Sender<SequenceId>,
}

impl MemoryWal {
    pub fn new() -> Self {
        let (durable_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(WalState {
                next_sequence: 1,
                active: Vec::new(),
                archived: VecDeque::new(),
                purged_through: 0,
            }),
            durable_tx,
        }
    }

    /// Number of archived (rolled) segments still retained.
    pub fn archived_segments(&self) -> usize {
        self.state.read().archived.len()
    }

    /// Highest sequence id assigned so far, durable or not.
    pub fn last_appended(&self) -> SequenceId {
        self.state.read().next_sequence - 1
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteAheadLog for MemoryWal {
    fn append(&self, mutations: Vec<Mutation>) -> SequenceId {
        let mut state = self.state.write();
        let sequence_id = state.next_sequence;
        state.next_sequence += 1;
        state.active.push(WalEdit::new(sequence_id, mutations));
        sequence_id
    }

    fn sync(&self) -> SequenceId {
        let durable = self.state.read().next_sequence - 1;
        self.durable_tx.send_if_modified(|current| {
            if durable > *current {
                *current = durable;
                true
            } else {
                false
            }
        });
        *self.durable_tx.borrow()
    }

    fn durable_sequence(&self) -> SequenceId {
        *self.durable_tx.borrow()
    }

    fn watch_durable(&self) -> watch::Receiver<SequenceId> {
        self.durable_tx.subscribe()
    }

    fn read_durable(&self, after: SequenceId, max: usize) -> Result<Vec<WalEdit>, WalReadError> {
        let durable = self.durable_sequence();
        if after >= durable || max == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read();
        if after < state.purged_through {
            return Err(WalReadError::SegmentLost {
                requested: after + 1,
                first_available: state.purged_through + 1,
            });
        }

        Ok(state
            .archived
            .iter()
            .flatten()
            .chain(state.active.iter())
            .filter(|edit| edit.sequence_id > after && edit.sequence_id <= durable)
            .take(max)
            .cloned()
            .collect())
    }

    fn roll(&self) {
        let mut state = self.state.write();
        if state.active.is_empty() {
            return;
        }
        let segment = std::mem::take(&mut state.active);
        tracing::debug!(
            "rolled wal segment with {} edits (archive size {})",
            segment.len(),
            state.archived.len() + 1
        );
        state.archived.push_back(segment);
    }

    fn purge_archived_through(&self, through: SequenceId) -> usize {
        let mut state = self.state.write();
        let mut removed = 0;
        while let Some(last) = state
            .archived
            .front()
            .and_then(|segment| segment.last())
            .map(|edit| edit.sequence_id)
        {
            if last > through {
                break;
            }
            state.archived.pop_front();
            state.purged_through = state.purged_through.max(last);
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!("purged {} archived wal segments through seq={}", removed, through);
        }
        removed
    }
}
