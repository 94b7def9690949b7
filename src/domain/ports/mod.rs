mod location_cache;
mod metrics_store;
mod moved_hint_store;
mod region_locator;
mod region_store;
mod replica_transport;
mod write_ahead_log;

pub use location_cache::LocationCache;
pub use metrics_store::MetricsStore;
pub use moved_hint_store::MovedHintStore;
pub use region_locator::RegionLocator;
pub use region_store::{RegionStore, RowScanner};
pub use replica_transport::ReplicaTransport;
pub use write_ahead_log::WriteAheadLog;
