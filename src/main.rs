//! meta-replica - Catalog Region Replica Replication
//!
//! This is the composition root: it starts an in-process cluster hosting the
//! catalog region and its replicas, and optionally serves one server over TCP.

use meta_replica::config::load_config;
use meta_replica::domain::value_objects::ReplicaId;
use meta_replica::harness::MiniCluster;
use meta_replica::infrastructure::shutdown_signal;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting meta-replica servers={} catalog_replicas={} read_mode={}",
        cfg.servers,
        cfg.catalog_replicas,
        cfg.read_mode
    );

    // ===== COMPOSITION ROOT =====
    let cluster = MiniCluster::start(&cfg.cluster()).await?;

    if let Some(addr) = &cfg.listen_addr {
        let bound = cluster.serve(0, addr).await?;
        tracing::info!("catalog primary server reachable on {}", bound);
    }

    let shutdown = cluster.shutdown_controller().clone();
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    ticker.tick().await;

    let signal = shutdown_signal(shutdown.clone());
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => break,
            _ = ticker.tick() => report(&cluster),
        }
    }

    cluster.shutdown();
    shutdown.wait_for_drain(Duration::from_secs(5)).await;
    tracing::info!("meta-replica stopped");
    Ok(())
}

fn report(cluster: &MiniCluster) {
    tracing::info!("catalog read counts per replica: {:?}", cluster.read_counts());
    let primary_seq = cluster.catalog_primary().last_applied();
    for ordinal in 1..cluster.config().catalog_replicas {
        let replica = ReplicaId(ordinal as u16);
        match cluster.agent().progress(replica) {
            Ok(progress) => tracing::info!(
                "secondary {}: shipped={} acknowledged={} primary={}",
                replica,
                progress.shipped,
                progress.acknowledged,
                primary_seq
            ),
            Err(e) => tracing::warn!("secondary {}: {}", replica, e),
        }
    }
}
