mod dashmap_location_cache;
mod dashmap_metrics_store;
mod dashmap_moved_hints;
mod local_transport;
mod memory_assignment;
mod memory_region_store;
mod memory_wal;
mod tcp_transport;

pub use dashmap_location_cache::DashMapLocationCache;
pub use dashmap_metrics_store::DashMapMetricsStore;
pub use dashmap_moved_hints::DashMapMovedHintStore;
pub use local_transport::{Fault, LocalTransport};
pub use memory_assignment::MemoryAssignment;
pub use memory_region_store::MemoryRegionStore;
pub use memory_wal::MemoryWal;
pub use tcp_transport::{TcpTransport, TcpTransportConfig};
