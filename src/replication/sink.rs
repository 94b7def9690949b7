//! Replication Sink
//!
//! Applies shipped edit batches to a secondary replica, strictly in sequence
//! order and idempotently.

use crate::application::HostedRegion;
use crate::domain::errors::SinkError;
use crate::domain::ports::MetricsStore;
use crate::domain::value_objects::SequenceId;
use crate::replication::types::EditBatch;
use std::sync::Arc;

/// Secondary-side applier of edit batches.
///
/// `apply` runs inside the target region's single-writer section, so
/// batches for one region apply one at a time while other regions on the
/// same server proceed concurrently.
pub struct ReplicationSink {
    metrics: Arc<dyn MetricsStore>,
}

impl ReplicationSink {
    pub fn new(metrics: Arc<dyn MetricsStore>) -> Self {
        Self { metrics }
    }

    /// Apply a batch and return the region's last-applied sequence id.
    ///
    /// Edits at or below the watermark are skipped, so a retransmitted batch
    /// is a no-op. A batch starting above `last_applied + 1` is rejected with
    /// [`SinkError::Gap`] and nothing is applied.
    pub fn apply(&self, region: &HostedRegion, batch: &EditBatch) -> Result<SequenceId, SinkError> {
        if region.is_primary() {
            return Err(SinkError::NotSecondary(region.key().to_string()));
        }
        if !batch.verify() {
            tracing::warn!("rejecting batch for {}: checksum mismatch", region.key());
            return Err(SinkError::Checksum);
        }
        if let Some(at) = batch.discontinuity() {
            return Err(SinkError::NotContiguous { at });
        }

        let result = region.with_applied(|applied, store| {
            let (first, last) = match (batch.first_sequence(), batch.last_sequence()) {
                (Some(first), Some(last)) => (first, last),
                _ => return Ok(*applied),
            };

            if last <= *applied {
                tracing::debug!(
                    "replica {} ignoring replayed batch {}..={} (applied={})",
                    region.key(),
                    first,
                    last,
                    applied
                );
                return Ok(*applied);
            }

            if first > *applied + 1 {
                return Err(SinkError::Gap {
                    expected: *applied + 1,
                    received: first,
                    last_applied: *applied,
                });
            }

            let floor = *applied;
            for edit in batch.edits.iter().filter(|e| e.sequence_id > floor) {
                store.apply(edit);
                *applied = edit.sequence_id;
            }
            Ok(*applied)
        });

        match &result {
            Ok(applied) => self.metrics.record_applied(region.key(), *applied),
            Err(e) => tracing::warn!("replica {} rejected batch: {}", region.key(), e),
        }
        result
    }
}
