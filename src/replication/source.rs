//! Replication Source
//!
//! Queues durable edits per secondary and ships them in sequence order,
//! tracking shipped/acknowledged progress for each secondary.

use crate::domain::entities::{Reassignment, RegionInfo, RegionReplica, ReplicationProgress, WalEdit};
use crate::domain::errors::{SinkError, TransportError, WalReadError};
use crate::domain::ports::{MetricsStore, RegionLocator, ReplicaTransport, WriteAheadLog};
use crate::domain::value_objects::{ReplicaId, SequenceId, ServerName};
use crate::replication::agent::ReplicationEvent;
use crate::replication::config::ReplicationConfig;
use crate::replication::types::EditBatch;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Notify};

/// Source-side failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// Every live queue is full; the batch is handed back to be offered again.
    #[error("replication queue full")]
    Backpressure(EditBatch),
    #[error("no secondary with ordinal {0}")]
    UnknownSecondary(ReplicaId),
    #[error("secondary {0} was abandoned")]
    Abandoned(ReplicaId),
    #[error("secondary {replica} needs edits from {requested}, oldest available is {first_available}")]
    PermanentGap {
        replica: ReplicaId,
        requested: SequenceId,
        first_available: SequenceId,
    },
}

/// Result of one shipping attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShipOutcome {
    /// Nothing queued
    Idle,
    /// The secondary confirmed everything up to this sequence id
    Acknowledged(SequenceId),
    /// The secondary moved; shipping resumes from the acknowledged point
    Relocated(ServerName),
    /// Shipping failed; retry after the delay
    Backoff(Duration),
}

struct QueueState {
    pending: VecDeque<WalEdit>,
    enqueued_through: SequenceId,
    shipped: SequenceId,
    acknowledged: SequenceId,
    location: Option<ServerName>,
    attempts: u32,
    failing_since: Option<Instant>,
    abandoned: bool,
}

struct SecondaryQueue {
    replica: RegionReplica,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl SecondaryQueue {
    fn new(replica: RegionReplica, acknowledged: SequenceId) -> Self {
        Self {
            replica,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                enqueued_through: acknowledged,
                shipped: acknowledged,
                acknowledged,
                location: None,
                attempts: 0,
                failing_since: None,
                abandoned: false,
            }),
            ready: Notify::new(),
        }
    }
}

/// Per-region replication source.
///
/// Holds one bounded queue per secondary. Secondaries progress independently:
/// a full queue stops taking new edits and later catches up from the WAL, so
/// the tailer is only held back once every live queue is full.
pub struct ReplicationSource {
    region: RegionInfo,
    config: ReplicationConfig,
    queues: Vec<Arc<SecondaryQueue>>,
    wal: Arc<dyn WriteAheadLog>,
    locator: Arc<dyn RegionLocator>,
    transport: Arc<dyn ReplicaTransport>,
    metrics: Arc<dyn MetricsStore>,
    capacity: Notify,
    /// Highest sequence id the tailer has handed over
    tailed_through: AtomicU64,
    events: mpsc::Sender<ReplicationEvent>,
}

impl ReplicationSource {
    /// Create a source shipping to ordinals `1..replica_count`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        region: RegionInfo,
        replica_count: usize,
        config: ReplicationConfig,
        wal: Arc<dyn WriteAheadLog>,
        locator: Arc<dyn RegionLocator>,
        transport: Arc<dyn ReplicaTransport>,
        metrics: Arc<dyn MetricsStore>,
        events: mpsc::Sender<ReplicationEvent>,
    ) -> Self {
        let queues = (1..replica_count.max(1))
            .map(|ordinal| {
                let replica = region.replica(ReplicaId(ordinal as u16));
                let acknowledged = metrics.progress(&replica.key()).acknowledged;
                Arc::new(SecondaryQueue::new(replica, acknowledged))
            })
            .collect();

        Self {
            region,
            config,
            queues,
            wal,
            locator,
            transport,
            metrics,
            capacity: Notify::new(),
            tailed_through: AtomicU64::new(0),
            events,
        }
    }

    pub fn region(&self) -> &RegionInfo {
        &self.region
    }

    /// Ordinals of every secondary this source ships to.
    pub fn secondaries(&self) -> Vec<ReplicaId> {
        self.queues.iter().map(|q| q.replica.replica_id).collect()
    }

    fn queue(&self, replica: ReplicaId) -> Result<&Arc<SecondaryQueue>, SourceError> {
        if replica.is_primary() {
            return Err(SourceError::UnknownSecondary(replica));
        }
        self.queues
            .get(replica.as_usize() - 1)
            .ok_or(SourceError::UnknownSecondary(replica))
    }

    /// Lowest acknowledged sequence id among live secondaries.
    ///
    /// This is where a restarted tailer must resume.
    pub fn min_acknowledged(&self) -> Option<SequenceId> {
        self.queues
            .iter()
            .filter_map(|q| {
                let state = q.state.lock();
                (!state.abandoned).then_some(state.acknowledged)
            })
            .min()
    }

    /// Shipped/acknowledged watermarks of one secondary.
    pub fn progress(&self, replica: ReplicaId) -> Result<ReplicationProgress, SourceError> {
        let state = self.queue(replica)?.state.lock();
        Ok(ReplicationProgress {
            shipped: state.shipped,
            acknowledged: state.acknowledged,
        })
    }

    /// Number of queued, unacknowledged edits for one secondary.
    pub fn queued(&self, replica: ReplicaId) -> Result<usize, SourceError> {
        Ok(self.queue(replica)?.state.lock().pending.len())
    }

    pub fn is_abandoned(&self, replica: ReplicaId) -> bool {
        self.queue(replica)
            .map(|q| q.state.lock().abandoned)
            .unwrap_or(false)
    }

    /// Reassignment notifications from the region locator.
    pub fn subscribe_reassignments(&self) -> broadcast::Receiver<Reassignment> {
        self.locator.subscribe()
    }

    /// Point a secondary at its new server ahead of the next ship attempt.
    ///
    /// Returns false when the notification is for another region or for the
    /// primary. Progress is untouched: shipping resumes after the acknowledged
    /// watermark wherever the replica now lives.
    pub fn apply_reassignment(&self, reassignment: &Reassignment) -> bool {
        if reassignment.replica.encoded_name != self.region.encoded_name() {
            return false;
        }
        let Ok(queue) = self.queue(reassignment.replica.replica_id) else {
            return false;
        };

        let mut state = queue.state.lock();
        if state.location == reassignment.to {
            return true;
        }
        tracing::debug!(
            "secondary {} reassigned {:?} -> {:?}",
            queue.replica,
            reassignment.from,
            reassignment.to
        );
        state.location = reassignment.to.clone();
        state.attempts = 0;
        drop(state);
        queue.ready.notify_one();
        true
    }

    /// Append a batch to the queue of every live secondary that has room.
    ///
    /// Never blocks. A queue that is full, or already behind, skips the batch
    /// and later refills the missing edits from the WAL. Only when no live
    /// queue has room is the batch handed back in
    /// [`SourceError::Backpressure`]. An empty queue always has room, so an
    /// oversized batch cannot wedge the tailer. Edits already enqueued are
    /// skipped. Returns the number of queues fed.
    pub fn enqueue(&self, batch: EditBatch) -> Result<usize, SourceError> {
        let (first, last) = match (batch.first_sequence(), batch.last_sequence()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(0),
        };
        let depth = self.config.queue_depth;
        let size = batch.len();
        let has_room =
            move |state: &QueueState| state.pending.is_empty() || state.pending.len() + size <= depth;

        let mut live = 0;
        let mut open = 0;
        for queue in &self.queues {
            let state = queue.state.lock();
            if state.abandoned {
                continue;
            }
            live += 1;
            if has_room(&state) {
                open += 1;
            }
        }
        if live > 0 && open == 0 {
            return Err(SourceError::Backpressure(batch));
        }
        self.tailed_through.fetch_max(last, Ordering::AcqRel);

        let mut fed = 0;
        for queue in &self.queues {
            let mut state = queue.state.lock();
            if state.abandoned {
                continue;
            }
            if !has_room(&state) || first > state.enqueued_through + 1 {
                tracing::debug!(
                    "secondary {} lagging at seq={}, will catch up from the log",
                    queue.replica,
                    state.enqueued_through
                );
                continue;
            }
            let mut added = false;
            for edit in &batch.edits {
                if edit.sequence_id > state.enqueued_through {
                    state.enqueued_through = edit.sequence_id;
                    state.pending.push_back(edit.clone());
                    added = true;
                }
            }
            drop(state);
            if added {
                fed += 1;
                queue.ready.notify_one();
            }
        }
        Ok(fed)
    }

    /// Pull edits a lagging secondary skipped straight from the WAL.
    fn refill(&self, queue: &SecondaryQueue) -> Result<(), SourceError> {
        let tailed = self.tailed_through.load(Ordering::Acquire);
        let mut state = queue.state.lock();
        if state.abandoned || state.enqueued_through >= tailed {
            return Ok(());
        }
        let room = self.config.queue_depth.saturating_sub(state.pending.len());
        if room == 0 {
            return Ok(());
        }

        let after = state.enqueued_through;
        let wanted = room.min((tailed - after) as usize);
        let edits = match self.wal.read_durable(after, wanted) {
            Ok(edits) => edits,
            Err(WalReadError::SegmentLost {
                requested,
                first_available,
            }) => return Err(self.permanent_gap(queue, state, requested, first_available)),
        };
        match edits.first().map(|e| e.sequence_id) {
            None => return Ok(()),
            Some(first) if first != after + 1 => {
                return Err(self.permanent_gap(queue, state, after + 1, first));
            }
            Some(_) => {}
        }

        tracing::debug!(
            "secondary {} catching up {} edits from the log after seq={}",
            queue.replica,
            edits.len(),
            after
        );
        for edit in edits {
            if edit.sequence_id != state.enqueued_through + 1 {
                break;
            }
            state.enqueued_through = edit.sequence_id;
            state.pending.push_back(edit);
        }
        Ok(())
    }

    /// Purge archived WAL segments that every live secondary acknowledged.
    ///
    /// With no live secondary left everything durable is retired. Returns
    /// the number of segments purged.
    pub fn retire_acknowledged(&self) -> usize {
        let through = self
            .min_acknowledged()
            .unwrap_or_else(|| self.wal.durable_sequence());
        self.wal.purge_archived_through(through)
    }

    /// Wait until some queue drains or `timeout` elapses.
    pub async fn wait_for_capacity(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.capacity.notified()).await;
    }

    /// Wait until the secondary has queued work or `timeout` elapses.
    pub async fn wait_for_work(&self, replica: ReplicaId, timeout: Duration) -> Result<(), SourceError> {
        let queue = self.queue(replica)?.clone();
        {
            let state = queue.state.lock();
            let lagging = state.enqueued_through < self.tailed_through.load(Ordering::Acquire);
            if !state.pending.is_empty() || (lagging && !state.abandoned) {
                return Ok(());
            }
        }
        let _ = tokio::time::timeout(timeout, queue.ready.notified()).await;
        Ok(())
    }

    /// Ship the oldest unacknowledged edits to one secondary.
    ///
    /// At most `batch_max_edits` edits go out per call, always starting right
    /// after the acknowledged watermark.
    pub async fn ship(&self, replica: ReplicaId) -> Result<ShipOutcome, SourceError> {
        let queue = self.queue(replica)?.clone();
        self.refill(&queue)?;

        let (batch, cached_location) = {
            let state = queue.state.lock();
            if state.abandoned {
                return Err(SourceError::Abandoned(replica));
            }
            if state.pending.is_empty() {
                return Ok(ShipOutcome::Idle);
            }
            let edits: Vec<WalEdit> = state
                .pending
                .iter()
                .take(self.config.batch_max_edits)
                .cloned()
                .collect();
            (
                EditBatch::new(self.region.encoded_name(), edits),
                state.location.clone(),
            )
        };

        let server = match cached_location {
            Some(server) => server,
            None => match self.locator.resolve(&self.region, replica).await {
                Some(server) => {
                    queue.state.lock().location = Some(server.clone());
                    server
                }
                None => {
                    tracing::debug!("secondary {} is unassigned", queue.replica);
                    return Ok(self.on_failure(&queue));
                }
            },
        };

        let last = batch.last_sequence().unwrap_or_default();
        {
            let mut state = queue.state.lock();
            state.shipped = state.shipped.max(last);
        }
        self.metrics.record_shipped(&queue.replica.key(), last);

        match self.transport.replicate(&server, &queue.replica, batch).await {
            Ok(applied) => Ok(self.on_acknowledged(&queue, applied)),
            Err(TransportError::RegionNotServed { moved_to, .. }) => {
                Ok(self.relocate(&queue, &server, moved_to).await)
            }
            Err(TransportError::Rejected(SinkError::Gap { last_applied, .. })) => {
                self.resync(&queue, last_applied)
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::debug!("shipping to {} on {} failed: {}", queue.replica, server, e);
                } else {
                    tracing::warn!("shipping to {} on {} failed: {}", queue.replica, server, e);
                }
                Ok(self.on_failure(&queue))
            }
        }
    }

    fn on_acknowledged(&self, queue: &SecondaryQueue, applied: SequenceId) -> ShipOutcome {
        let mut state = queue.state.lock();
        state.acknowledged = state.acknowledged.max(applied);
        while state
            .pending
            .front()
            .is_some_and(|e| e.sequence_id <= applied)
        {
            state.pending.pop_front();
        }
        state.attempts = 0;
        state.failing_since = None;
        let acknowledged = state.acknowledged;
        drop(state);

        self.metrics
            .record_acknowledged(&queue.replica.key(), acknowledged);
        self.retire_acknowledged();
        self.capacity.notify_one();
        let _ = self.events.try_send(ReplicationEvent::Shipped {
            replica: queue.replica.replica_id,
            through: acknowledged,
        });
        tracing::debug!("secondary {} acknowledged seq={}", queue.replica, acknowledged);
        ShipOutcome::Acknowledged(acknowledged)
    }

    async fn relocate(
        &self,
        queue: &SecondaryQueue,
        failed: &ServerName,
        moved_to: Option<ServerName>,
    ) -> ShipOutcome {
        let resolved = self
            .locator
            .resolve(&self.region, queue.replica.replica_id)
            .await
            .or(moved_to);

        match resolved {
            Some(server) if &server != failed => {
                tracing::info!(
                    "secondary {} moved {} -> {}, resuming after seq={}",
                    queue.replica,
                    failed,
                    server,
                    queue.state.lock().acknowledged
                );
                queue.state.lock().location = Some(server.clone());
                let _ = self.events.try_send(ReplicationEvent::Relocated {
                    replica: queue.replica.replica_id,
                    server: server.clone(),
                });
                ShipOutcome::Relocated(server)
            }
            _ => {
                queue.state.lock().location = None;
                self.on_failure(queue)
            }
        }
    }

    /// Rewind a secondary whose sink reported `last_applied` below what we sent.
    fn resync(
        &self,
        queue: &SecondaryQueue,
        last_applied: SequenceId,
    ) -> Result<ShipOutcome, SourceError> {
        let mut state = queue.state.lock();
        while state
            .pending
            .front()
            .is_some_and(|e| e.sequence_id <= last_applied)
        {
            state.pending.pop_front();
        }

        let front = state
            .pending
            .front()
            .map(|e| e.sequence_id)
            .unwrap_or(state.enqueued_through + 1);

        if front > last_applied + 1 {
            let missing = (front - last_applied - 1) as usize;
            let refill = match self.wal.read_durable(last_applied, missing) {
                Ok(edits) if edits.first().map(|e| e.sequence_id) == Some(last_applied + 1) => {
                    Ok(edits)
                }
                Ok(edits) => Err(WalReadError::SegmentLost {
                    requested: last_applied + 1,
                    first_available: edits.first().map(|e| e.sequence_id).unwrap_or(front),
                }),
                Err(e) => Err(e),
            };

            match refill {
                Ok(edits) => {
                    tracing::warn!(
                        "secondary {} fell back to seq={}, resending {} edits from the log",
                        queue.replica,
                        last_applied,
                        edits.len()
                    );
                    for edit in edits.into_iter().rev().filter(|e| e.sequence_id < front) {
                        state.pending.push_front(edit);
                    }
                }
                Err(WalReadError::SegmentLost {
                    requested,
                    first_available,
                }) => {
                    return Err(self.permanent_gap(queue, state, requested, first_available));
                }
            }
        } else {
            tracing::debug!("secondary {} resyncing after seq={}", queue.replica, last_applied);
        }

        Ok(ShipOutcome::Backoff(Duration::ZERO))
    }

    /// Give up on a secondary whose next edits are gone from the WAL.
    fn permanent_gap(
        &self,
        queue: &SecondaryQueue,
        mut state: MutexGuard<'_, QueueState>,
        requested: SequenceId,
        first_available: SequenceId,
    ) -> SourceError {
        state.abandoned = true;
        state.pending.clear();
        drop(state);
        self.capacity.notify_one();
        tracing::error!(
            "permanent replication gap for {}: needs seq={}, oldest available seq={}",
            queue.replica,
            requested,
            first_available
        );
        let replica = queue.replica.replica_id;
        let _ = self.events.try_send(ReplicationEvent::PermanentGap {
            replica,
            requested,
            first_available,
        });
        SourceError::PermanentGap {
            replica,
            requested,
            first_available,
        }
    }

    fn on_failure(&self, queue: &SecondaryQueue) -> ShipOutcome {
        let mut state = queue.state.lock();
        state.attempts += 1;
        let failing_since = *state.failing_since.get_or_insert_with(Instant::now);

        if failing_since.elapsed() > self.config.secondary_retention {
            state.abandoned = true;
            state.pending.clear();
            let acknowledged = state.acknowledged;
            drop(state);
            self.capacity.notify_one();
            tracing::error!(
                "abandoning secondary {} after {:?} of failures (acknowledged seq={})",
                queue.replica,
                self.config.secondary_retention,
                acknowledged
            );
            let _ = self.events.try_send(ReplicationEvent::SecondaryAbandoned {
                replica: queue.replica.replica_id,
            });
            return ShipOutcome::Backoff(Duration::ZERO);
        }

        if !self.config.retry.allows(state.attempts) {
            tracing::warn!(
                "secondary {} exhausted {} attempts, re-resolving its location",
                queue.replica,
                state.attempts
            );
            state.attempts = 0;
            state.location = None;
        }

        ShipOutcome::Backoff(self.config.retry.delay(state.attempts.max(1)))
    }
}
