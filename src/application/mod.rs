//! Application Layer
//!
//! Use cases built on the domain ports: hosting region replicas, routing
//! catalog reads, and propagating catalog deletions.

mod catalog_propagator;
mod hosted_region;
mod read_router;
mod region_server;

pub use catalog_propagator::{
    table_rows, CatalogMutationPropagator, DeletedTables, PropagationError,
};
pub use hosted_region::HostedRegion;
pub use read_router::{ReadOutcome, ReadRouter, RouteState, RouterConfig};
pub use region_server::RegionServer;
