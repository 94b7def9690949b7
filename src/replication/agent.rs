//! Replication Agent
//!
//! Orchestrates replication for one primary region: a WAL tailer feeding the
//! replication source, plus one shipping task per secondary.

use crate::application::HostedRegion;
use crate::domain::ports::{MetricsStore, RegionLocator, ReplicaTransport, WriteAheadLog};
use crate::domain::entities::ReplicationProgress;
use crate::domain::value_objects::{ReplicaId, SequenceId, ServerName};
use crate::replication::config::ReplicationConfig;
use crate::replication::source::{ReplicationSource, ShipOutcome, SourceError};
use crate::replication::tailer::WalTailer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Upper bound on how long an idle task sleeps before re-checking its queue.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Events emitted by the replication agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// A secondary acknowledged edits up to `through`
    Shipped { replica: ReplicaId, through: SequenceId },
    /// A secondary was found on a new server
    Relocated { replica: ReplicaId, server: ServerName },
    /// A secondary needs edits the log no longer has
    PermanentGap {
        replica: ReplicaId,
        requested: SequenceId,
        first_available: SequenceId,
    },
    /// A secondary failed for longer than the retention bound
    SecondaryAbandoned { replica: ReplicaId },
    /// The tailer stopped; no secondary receives new edits
    TailerFailed(String),
}

/// Replication agent for one primary region.
pub struct ReplicationAgent {
    config: ReplicationConfig,
    primary: Arc<HostedRegion>,
    source: Arc<ReplicationSource>,
    event_rx: Option<mpsc::Receiver<ReplicationEvent>>,
    event_tx: mpsc::Sender<ReplicationEvent>,
    cancel: CancellationToken,
    started: bool,
}

impl ReplicationAgent {
    /// Create a new replication agent.
    pub fn new(
        primary: Arc<HostedRegion>,
        replica_count: usize,
        config: ReplicationConfig,
        locator: Arc<dyn RegionLocator>,
        transport: Arc<dyn ReplicaTransport>,
        metrics: Arc<dyn MetricsStore>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let wal = primary
            .wal()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("replica {} is not a primary", primary.key()))?;

        let (event_tx, event_rx) = mpsc::channel(1024);
        let source = Arc::new(ReplicationSource::new(
            primary.replica().region.clone(),
            replica_count,
            config.clone(),
            wal,
            locator,
            transport,
            metrics,
            event_tx.clone(),
        ));

        Ok(Self {
            config,
            primary,
            source,
            event_rx: Some(event_rx),
            event_tx,
            cancel: CancellationToken::new(),
            started: false,
        })
    }

    /// Get the event receiver.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ReplicationEvent>> {
        self.event_rx.take()
    }

    pub fn source(&self) -> &Arc<ReplicationSource> {
        &self.source
    }

    /// Source-side progress of one secondary.
    pub fn progress(&self, replica: ReplicaId) -> Result<ReplicationProgress, SourceError> {
        self.source.progress(replica)
    }

    /// Check if replication is running.
    pub fn is_running(&self) -> bool {
        self.started && !self.cancel.is_cancelled()
    }

    /// Start the tailer and shipping tasks.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.started {
            anyhow::bail!("replication agent for {} already started", self.primary.key());
        }
        if !self.config.enabled {
            tracing::info!(
                "replication disabled, not shipping edits of {}",
                self.primary.key()
            );
            return Ok(());
        }
        let secondaries = self.source.secondaries();
        if secondaries.is_empty() {
            tracing::info!("region {} has no secondaries", self.primary.key());
            return Ok(());
        }

        let wal = self
            .primary
            .wal()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("replica {} is not a primary", self.primary.key()))?;
        let start_after = self.source.min_acknowledged().unwrap_or_default();
        let tailer = WalTailer::new(
            wal.clone(),
            self.primary.replica().region.encoded_name(),
            start_after,
            self.config.tail_batch_edits,
        );

        tracing::info!(
            "starting replication agent region={} secondaries={} start_after={}",
            self.primary.key(),
            secondaries.len(),
            start_after
        );

        self.start_tailer(tailer, wal);
        self.start_reassignment_watcher();
        for replica in secondaries {
            self.start_shipper(replica);
        }
        self.started = true;
        Ok(())
    }

    /// Stop every task of this agent.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("stopping replication agent for {}", self.primary.key());
            self.cancel.cancel();
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_tailer(&self, mut tailer: WalTailer, wal: Arc<dyn WriteAheadLog>) {
        let source = self.source.clone();
        let cancel = self.cancel.clone();
        let roll_every = self.config.wal_roll_edits;
        let mut since_roll = 0usize;
        let events = self.event_tx.clone();
        let region = self.primary.key().clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = tailer.next_batch() => next,
                };

                let mut batch = match next {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::error!("tailer for {} stopped: {}", region, e);
                        let _ = events.try_send(ReplicationEvent::TailerFailed(e.to_string()));
                        break;
                    }
                };

                // roll before enqueueing: acknowledgements only purge archived segments
                since_roll += batch.len();
                if since_roll >= roll_every {
                    wal.roll();
                    since_roll = 0;
                }

                loop {
                    match source.enqueue(batch) {
                        Ok(_) => break,
                        Err(SourceError::Backpressure(returned)) => {
                            batch = returned;
                            tracing::debug!("replication queues of {} full, tailer waiting", region);
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = source.wait_for_capacity(IDLE_POLL) => {}
                            }
                        }
                        Err(e) => {
                            tracing::warn!("dropping batch for {}: {}", region, e);
                            break;
                        }
                    }
                }
            }
            tracing::debug!("tailer for {} exited at seq={}", region, tailer.position());
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_reassignment_watcher(&self) {
        let source = self.source.clone();
        let cancel = self.cancel.clone();
        let mut notices = source.subscribe_reassignments();

        tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = cancel.cancelled() => break,
                    notice = notices.recv() => notice,
                };
                match notice {
                    Ok(reassignment) => {
                        source.apply_reassignment(&reassignment);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // shippers still re-resolve on their next failure
                        tracing::debug!("reassignment watcher lagged by {} notices", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_shipper(&self, replica: ReplicaId) {
        let source = self.source.clone();
        let cancel = self.cancel.clone();
        let batch_delay = self.config.batch_max_delay;

        tokio::spawn(async move {
            loop {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = source.ship(replica) => outcome,
                };

                match outcome {
                    Ok(ShipOutcome::Idle) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = source.wait_for_work(replica, IDLE_POLL) => {}
                        }
                        if !batch_delay.is_zero() {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(batch_delay) => {}
                            }
                        }
                    }
                    Ok(ShipOutcome::Acknowledged(_)) | Ok(ShipOutcome::Relocated(_)) => {}
                    Ok(ShipOutcome::Backoff(delay)) => {
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("shipper for secondary {} stopped: {}", replica, e);
                        break;
                    }
                }
            }
        });
    }
}

impl Drop for ReplicationAgent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{
        DashMapMetricsStore, LocalTransport, MemoryAssignment, MemoryRegionStore, MemoryWal,
    };
    use crate::application::RegionServer;
    use crate::domain::entities::{Mutation, RegionInfo};
    use crate::infrastructure::wait::await_condition_async;

    struct Fixture {
        primary: Arc<HostedRegion>,
        secondaries: Vec<Arc<HostedRegion>>,
        assignment: Arc<MemoryAssignment>,
        transport: Arc<LocalTransport>,
        metrics: Arc<DashMapMetricsStore>,
    }

    fn fixture(replica_count: u16) -> Fixture {
        let region = RegionInfo::catalog();
        let metrics = Arc::new(DashMapMetricsStore::new());
        let transport = Arc::new(LocalTransport::new());
        let assignment = Arc::new(MemoryAssignment::new());
        let primary = Arc::new(HostedRegion::primary(
            region.replica(ReplicaId::PRIMARY),
            Arc::new(MemoryRegionStore::new()),
            Arc::new(MemoryWal::new()),
        ));
        let mut secondaries = Vec::new();

        for ordinal in 0..replica_count {
            let name = ServerName::new(format!("rs{}.local", ordinal), 16020);
            let server = Arc::new(RegionServer::new(
                name.clone(),
                metrics.clone(),
                Duration::from_secs(30),
            ));
            let hosted = if ordinal == 0 {
                primary.clone()
            } else {
                let hosted = Arc::new(HostedRegion::secondary(
                    region.replica(ReplicaId(ordinal)),
                    Arc::new(MemoryRegionStore::new()),
                ));
                secondaries.push(hosted.clone());
                hosted
            };
            assignment.assign(hosted.replica(), name);
            server.open_region(hosted);
            transport.register(server);
        }

        Fixture {
            primary,
            secondaries,
            assignment,
            transport,
            metrics,
        }
    }

    fn agent(f: &Fixture, replica_count: usize, config: ReplicationConfig) -> ReplicationAgent {
        ReplicationAgent::new(
            f.primary.clone(),
            replica_count,
            config,
            f.assignment.clone(),
            f.transport.clone(),
            f.metrics.clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_agent_requires_primary() {
        let f = fixture(2);
        let result = ReplicationAgent::new(
            f.secondaries[0].clone(),
            2,
            ReplicationConfig::default(),
            f.assignment.clone(),
            f.transport.clone(),
            f.metrics.clone(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_agent_validates_config() {
        let f = fixture(2);
        let result = ReplicationAgent::new(
            f.primary.clone(),
            2,
            ReplicationConfig::default().queue_depth(0),
            f.assignment.clone(),
            f.transport.clone(),
            f.metrics.clone(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_agent_take_event_rx() {
        let f = fixture(2);
        let mut agent = agent(&f, 2, ReplicationConfig::default());

        assert!(agent.take_event_rx().is_some());
        assert!(agent.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_agent_replicates_to_all_secondaries() {
        let f = fixture(3);
        let mut agent = agent(&f, 3, ReplicationConfig::default());
        agent.start().unwrap();
        assert!(agent.is_running());

        for n in 0..20 {
            f.primary
                .write(vec![Mutation::put(format!("row{:02}", n), "v")])
                .unwrap();
        }

        let secondaries = f.secondaries.clone();
        await_condition_async(
            || secondaries.iter().all(|s| s.last_applied() == 20),
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        for replica in [ReplicaId(1), ReplicaId(2)] {
            assert_eq!(agent.progress(replica).unwrap().acknowledged, 20);
        }
        assert_eq!(f.secondaries[1].scanner().count(), 20);

        agent.stop();
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn test_disabled_agent_ships_nothing() {
        let f = fixture(2);
        let mut agent = agent(&f, 2, ReplicationConfig::default().enabled(false));
        agent.start().unwrap();
        assert!(!agent.is_running());

        f.primary.write(vec![Mutation::put("a", "1")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.secondaries[0].last_applied(), 0);
    }

    #[tokio::test]
    async fn test_agent_catches_up_after_outage() {
        let f = fixture(2);
        let retry = crate::domain::services::RetryPolicy::new(
            3,
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        let mut agent = agent(&f, 2, ReplicationConfig::default().retry(retry));
        let mut events = agent.take_event_rx().unwrap();
        let secondary_server = ServerName::new("rs1.local", 16020);
        f.transport.fail_server(&secondary_server);
        agent.start().unwrap();

        for n in 0..5 {
            f.primary.write(vec![Mutation::put(format!("k{}", n), "v")]);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.secondaries[0].last_applied(), 0);

        f.transport.heal_server(&secondary_server);
        let secondary = f.secondaries[0].clone();
        await_condition_async(
            || secondary.last_applied() == 5,
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        let mut shipped = false;
        while let Ok(event) = events.try_recv() {
            if let ReplicationEvent::Shipped { through: 5, .. } = event {
                shipped = true;
            }
        }
        assert!(shipped);
    }
}
