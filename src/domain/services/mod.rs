//! Domain Services
//!
//! Pure policy logic used by the read router and the replication source.

mod replica_selector;
mod retry_policy;

pub use replica_selector::{ReplicaSelector, SelectionStrategy};
pub use retry_policy::RetryPolicy;
