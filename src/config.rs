use crate::application::RouterConfig;
use crate::domain::services::{RetryPolicy, SelectionStrategy};
use crate::domain::value_objects::ReadMode;
use crate::harness::ClusterConfig;
use crate::replication::ReplicationConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Cluster shape
    pub servers: usize,
    pub catalog_replicas: usize,
    pub listen_addr: Option<String>,
    pub debug: bool,

    // Replication settings
    pub replication_enabled: bool,
    pub ship_batch_edits: usize,
    pub ship_batch_ms: u64,
    pub queue_depth: usize,
    pub ship_retries: u32,
    pub secondary_retention_secs: u64,
    pub wal_roll_edits: usize,

    // Read routing settings
    pub read_mode: ReadMode,
    pub read_retries: u32,
    pub read_timeout_ms: u64,
    pub location_ttl_secs: u64,
    pub moved_hint_ttl_secs: u64,
    pub stale_marker_ttl_secs: u64,

    // Backoff shared by shipping and reads
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: 3,
            catalog_replicas: 3,
            listen_addr: None,
            debug: false,
            replication_enabled: true,
            ship_batch_edits: 100,
            ship_batch_ms: 10,
            queue_depth: 10_000,
            ship_retries: 8,
            secondary_retention_secs: 300,
            wal_roll_edits: 1024,
            read_mode: ReadMode::PrimaryOnly,
            read_retries: 5,
            read_timeout_ms: 10_000,
            location_ttl_secs: 60,
            moved_hint_ttl_secs: 30,
            stale_marker_ttl_secs: 3,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
        }
    }
}

impl Config {
    fn backoff(&self, attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn replication(&self) -> ReplicationConfig {
        ReplicationConfig::new()
            .enabled(self.replication_enabled)
            .batch_max_edits(self.ship_batch_edits)
            .batch_max_delay(Duration::from_millis(self.ship_batch_ms))
            .queue_depth(self.queue_depth)
            .retry(self.backoff(self.ship_retries))
            .secondary_retention(Duration::from_secs(self.secondary_retention_secs))
            .wal_roll_edits(self.wal_roll_edits)
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig::new()
            .mode(self.read_mode)
            .strategy(SelectionStrategy::RoundRobin)
            .retry(self.backoff(self.read_retries))
            .request_timeout(Duration::from_millis(self.read_timeout_ms))
            .stale_marker_ttl(Duration::from_secs(self.stale_marker_ttl_secs))
    }

    pub fn cluster(&self) -> ClusterConfig {
        ClusterConfig::new()
            .servers(self.servers)
            .catalog_replicas(self.catalog_replicas)
            .replication(self.replication())
            .router(self.router())
            .location_ttl(Duration::from_secs(self.location_ttl_secs))
            .moved_hint_ttl(Duration::from_secs(self.moved_hint_ttl_secs))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let servers = env_parse("METAREPLICA_SERVERS", defaults.servers);
    let catalog_replicas = env_parse("METAREPLICA_CATALOG_REPLICAS", defaults.catalog_replicas);
    let listen_addr = std::env::var("METAREPLICA_LISTEN_ADDR").ok();
    let debug = std::env::var("DEBUG").is_ok();

    // Replication settings
    let replication_enabled = env_flag("METAREPLICA_REPLICATION_ENABLED", defaults.replication_enabled);
    let ship_batch_edits = env_parse("METAREPLICA_SHIP_BATCH_EDITS", defaults.ship_batch_edits);
    let ship_batch_ms = env_parse("METAREPLICA_SHIP_BATCH_MS", defaults.ship_batch_ms);
    let queue_depth = env_parse("METAREPLICA_QUEUE_DEPTH", defaults.queue_depth);
    let ship_retries = env_parse("METAREPLICA_SHIP_RETRIES", defaults.ship_retries);
    let secondary_retention_secs = env_parse(
        "METAREPLICA_SECONDARY_RETENTION_SECS",
        defaults.secondary_retention_secs,
    );
    let wal_roll_edits = env_parse("METAREPLICA_WAL_ROLL_EDITS", defaults.wal_roll_edits);

    // Read routing settings
    let read_mode = std::env::var("METAREPLICA_READ_MODE")
        .map(|v| ReadMode::from_str(&v))
        .unwrap_or(defaults.read_mode);
    let read_retries = env_parse("METAREPLICA_READ_RETRIES", defaults.read_retries);
    let read_timeout_ms = env_parse("METAREPLICA_READ_TIMEOUT_MS", defaults.read_timeout_ms);
    let location_ttl_secs = env_parse("METAREPLICA_LOCATION_TTL_SECS", defaults.location_ttl_secs);
    let moved_hint_ttl_secs =
        env_parse("METAREPLICA_MOVED_HINT_TTL_SECS", defaults.moved_hint_ttl_secs);
    let stale_marker_ttl_secs =
        env_parse("METAREPLICA_STALE_MARKER_TTL_SECS", defaults.stale_marker_ttl_secs);

    let backoff_base_ms = env_parse("METAREPLICA_BACKOFF_BASE_MS", defaults.backoff_base_ms);
    let backoff_max_ms = env_parse("METAREPLICA_BACKOFF_MAX_MS", defaults.backoff_max_ms);

    Ok(Config {
        servers,
        catalog_replicas,
        listen_addr,
        debug,
        replication_enabled,
        ship_batch_edits,
        ship_batch_ms,
        queue_depth,
        ship_retries,
        secondary_retention_secs,
        wal_roll_edits,
        read_mode,
        read_retries,
        read_timeout_ms,
        location_ttl_secs,
        moved_hint_ttl_secs,
        stale_marker_ttl_secs,
        backoff_base_ms,
        backoff_max_ms,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.catalog_replicas, 3);
        assert_eq!(cfg.read_mode, ReadMode::PrimaryOnly);
        assert!(cfg.replication_enabled);
        assert!(cfg.listen_addr.is_none());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().cluster().validate().is_ok());
    }

    #[test]
    fn test_load_config_with_read_mode() {
        std::env::set_var("METAREPLICA_READ_MODE", "LoadBalance");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.read_mode, ReadMode::LoadBalance);
        std::env::remove_var("METAREPLICA_READ_MODE");
    }

    #[test]
    fn test_load_config_with_replication_disabled() {
        std::env::set_var("METAREPLICA_REPLICATION_ENABLED", "false");
        let cfg = load_config().unwrap();
        assert!(!cfg.replication_enabled);
        assert!(!cfg.replication().enabled);
        std::env::remove_var("METAREPLICA_REPLICATION_ENABLED");
    }

    #[test]
    fn test_load_config_with_catalog_replicas() {
        std::env::set_var("METAREPLICA_CATALOG_REPLICAS", "5");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.catalog_replicas, 5);
        assert_eq!(cfg.cluster().catalog_replicas, 5);
        std::env::remove_var("METAREPLICA_CATALOG_REPLICAS");
    }

    #[test]
    fn test_load_config_with_ttls() {
        std::env::set_var("METAREPLICA_MOVED_HINT_TTL_SECS", "12");
        std::env::set_var("METAREPLICA_STALE_MARKER_TTL_SECS", "7");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.cluster().moved_hint_ttl, Duration::from_secs(12));
        assert_eq!(cfg.router().stale_marker_ttl, Duration::from_secs(7));
        std::env::remove_var("METAREPLICA_MOVED_HINT_TTL_SECS");
        std::env::remove_var("METAREPLICA_STALE_MARKER_TTL_SECS");
    }

    #[test]
    fn test_load_config_with_backoff() {
        std::env::set_var("METAREPLICA_BACKOFF_BASE_MS", "5");
        std::env::set_var("METAREPLICA_BACKOFF_MAX_MS", "40");
        std::env::set_var("METAREPLICA_SHIP_RETRIES", "4");
        let cfg = load_config().unwrap();
        let retry = cfg.replication().retry;
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base, Duration::from_millis(5));
        assert_eq!(retry.max, Duration::from_millis(40));
        std::env::remove_var("METAREPLICA_BACKOFF_BASE_MS");
        std::env::remove_var("METAREPLICA_BACKOFF_MAX_MS");
        std::env::remove_var("METAREPLICA_SHIP_RETRIES");
    }

    #[test]
    fn test_load_config_with_listen_addr() {
        std::env::set_var("METAREPLICA_LISTEN_ADDR", "127.0.0.1:16000");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.listen_addr, Some("127.0.0.1:16000".to_string()));
        std::env::remove_var("METAREPLICA_LISTEN_ADDR");
    }

    #[test]
    fn test_load_config_parse_error_uses_default() {
        std::env::set_var("METAREPLICA_QUEUE_DEPTH", "lots");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.queue_depth, 10_000);
        std::env::remove_var("METAREPLICA_QUEUE_DEPTH");
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let cfg = Config {
            backoff_base_ms: 500,
            backoff_max_ms: 10,
            ..Config::default()
        };
        assert!(cfg.cluster().validate().is_err());
    }
}
