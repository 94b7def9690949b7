//! Catalog Replica Replication
//!
//! Asynchronous, WAL-driven propagation of a primary region's edits to its
//! read-only secondary replicas.
//!
//! ## Architecture
//!
//! - **Tailer**: follows the primary's write-ahead log, emitting durable edits in order
//! - **Source**: per-secondary bounded queues, batching, retries and relocation
//! - **Sink**: idempotent, gap-rejecting application on each secondary
//! - **Codec**: length-prefixed bincode framing for the RPC transport
//! - **Agent**: orchestrates the tailer and one shipping task per secondary
//!
//! ## How It Works
//!
//! 1. A primary write is appended to the WAL and synced
//! 2. The tailer wakes on the durability watermark and reads the new edits
//! 3. The source queues them for every secondary and ships them in sequence order
//! 4. Each sink applies edits above its last-applied id and rejects gaps,
//!    so the source can always resend from the acknowledged point
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meta_replica::replication::{ReplicationAgent, ReplicationConfig};
//!
//! let mut agent = ReplicationAgent::new(primary, 3, ReplicationConfig::default(), locator, transport, metrics)?;
//! agent.start()?;
//! ```

mod agent;
pub mod codec;
mod config;
mod sink;
mod source;
mod tailer;
mod types;

pub use agent::{ReplicationAgent, ReplicationEvent};
pub use codec::CodecError;
pub use config::{validate_retry, ConfigError, ReplicationConfig};
pub use sink::ReplicationSink;
pub use source::{ReplicationSource, ShipOutcome, SourceError};
pub use tailer::{TailError, WalTailer};
pub use types::{EditBatch, Message};
