//! Domain Layer
//!
//! Entities, value objects, errors, ports and pure services of the catalog
//! replication subsystem. Nothing here performs I/O.

pub mod entities;
pub mod errors;
pub mod ports;
pub mod services;
pub mod value_objects;
