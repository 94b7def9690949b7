//! WAL Tailer
//!
//! Follows a primary region's write-ahead log and turns newly durable edits
//! into ordered edit batches.

use crate::domain::errors::WalReadError;
use crate::domain::ports::WriteAheadLog;
use crate::domain::value_objects::SequenceId;
use crate::replication::types::EditBatch;
use std::sync::Arc;
use tokio::sync::watch;

/// Tailer failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TailError {
    /// The log no longer holds edits that were never consumed.
    #[error("permanent replication gap: {0}")]
    PermanentGap(#[from] WalReadError),
    #[error("write-ahead log closed")]
    Closed,
}

/// Lazy, restartable reader over one region's durable edits.
///
/// Waits on the log's durability watermark instead of polling, and never
/// hands out an edit the log has not synced.
pub struct WalTailer {
    wal: Arc<dyn WriteAheadLog>,
    region: String,
    position: SequenceId,
    max_batch_edits: usize,
    durable: watch::Receiver<SequenceId>,
}

impl WalTailer {
    /// Tail `wal` for the region with encoded name `region`, starting after `start_after`.
    pub fn new(
        wal: Arc<dyn WriteAheadLog>,
        region: impl Into<String>,
        start_after: SequenceId,
        max_batch_edits: usize,
    ) -> Self {
        let durable = wal.watch_durable();
        Self {
            wal,
            region: region.into(),
            position: start_after,
            max_batch_edits: max_batch_edits.max(1),
            durable,
        }
    }

    /// Last sequence id handed out.
    pub fn position(&self) -> SequenceId {
        self.position
    }

    /// Rewind (or skip) so the next batch starts right after `sequence_id`.
    pub fn restart_from(&mut self, sequence_id: SequenceId) {
        tracing::debug!(
            "tailer for region {} restarting after seq={} (was {})",
            self.region,
            sequence_id,
            self.position
        );
        self.position = sequence_id;
    }

    /// Wait for and return the next contiguous run of durable edits.
    pub async fn next_batch(&mut self) -> Result<EditBatch, TailError> {
        loop {
            let durable = *self.durable.borrow_and_update();
            if durable > self.position {
                let edits = self.wal.read_durable(self.position, self.max_batch_edits)?;
                if let Some(first) = edits.first() {
                    let expected = self.position + 1;
                    if first.sequence_id != expected {
                        return Err(TailError::PermanentGap(WalReadError::SegmentLost {
                            requested: expected,
                            first_available: first.sequence_id,
                        }));
                    }
                    let batch = EditBatch::new(self.region.clone(), edits);
                    if let Some(last) = batch.last_sequence() {
                        self.position = last;
                    }
                    return Ok(batch);
                }
            }

            self.durable.changed().await.map_err(|_| TailError::Closed)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryWal;
    use crate::domain::entities::Mutation;
    use std::time::Duration;

    fn put(n: u64) -> Vec<Mutation> {
        vec![Mutation::put(format!("row{}", n), "v")]
    }

    #[tokio::test]
    async fn test_emits_only_durable_edits() {
        let wal = Arc::new(MemoryWal::new());
        let mut tailer = WalTailer::new(wal.clone(), "r", 0, 10);

        wal.append(put(1));
        let pending = tokio::time::timeout(Duration::from_millis(50), tailer.next_batch()).await;
        assert!(pending.is_err(), "edit emitted before it was durable");

        wal.sync();
        let batch = tailer.next_batch().await.unwrap();
        assert_eq!(batch.first_sequence(), Some(1));
        assert_eq!(batch.last_sequence(), Some(1));
        assert_eq!(tailer.position(), 1);
    }

    #[tokio::test]
    async fn test_wakes_on_sync() {
        let wal = Arc::new(MemoryWal::new());
        let mut tailer = WalTailer::new(wal.clone(), "r", 0, 10);

        let writer = wal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(put(1));
            writer.append(put(2));
            writer.sync();
        });

        let batch = tokio::time::timeout(Duration::from_secs(2), tailer.next_batch())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.verify());
    }

    #[tokio::test]
    async fn test_batches_are_bounded_and_gap_free() {
        let wal = Arc::new(MemoryWal::new());
        for n in 1..=7 {
            wal.append(put(n));
        }
        wal.sync();

        let mut tailer = WalTailer::new(wal.clone(), "r", 0, 3);
        let mut seen = Vec::new();
        while tailer.position() < 7 {
            let batch = tailer.next_batch().await.unwrap();
            assert!(batch.len() <= 3);
            assert_eq!(batch.discontinuity(), None);
            seen.extend(batch.edits.iter().map(|e| e.sequence_id));
        }
        assert_eq!(seen, (1..=7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reads_across_rolled_segments() {
        let wal = Arc::new(MemoryWal::new());
        wal.append(put(1));
        wal.append(put(2));
        wal.roll();
        wal.append(put(3));
        wal.sync();

        let mut tailer = WalTailer::new(wal.clone(), "r", 0, 10);
        let batch = tailer.next_batch().await.unwrap();
        assert_eq!(batch.first_sequence(), Some(1));
        assert_eq!(batch.last_sequence(), Some(3));
    }

    #[tokio::test]
    async fn test_restart_from_replays() {
        let wal = Arc::new(MemoryWal::new());
        for n in 1..=4 {
            wal.append(put(n));
        }
        wal.sync();

        let mut tailer = WalTailer::new(wal.clone(), "r", 0, 10);
        tailer.next_batch().await.unwrap();
        tailer.restart_from(2);
        let batch = tailer.next_batch().await.unwrap();
        assert_eq!(batch.first_sequence(), Some(3));
    }

    #[tokio::test]
    async fn test_purged_segment_is_permanent_gap() {
        let wal = Arc::new(MemoryWal::new());
        wal.append(put(1));
        wal.append(put(2));
        wal.sync();
        wal.roll();
        wal.append(put(3));
        wal.sync();
        assert_eq!(wal.purge_archived_through(2), 1);

        let mut tailer = WalTailer::new(wal.clone(), "r", 0, 10);
        let err = tailer.next_batch().await.unwrap_err();
        assert_eq!(
            err,
            TailError::PermanentGap(WalReadError::SegmentLost {
                requested: 1,
                first_available: 3,
            })
        );
    }
}
