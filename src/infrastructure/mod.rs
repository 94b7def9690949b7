//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod shutdown;
pub mod wait;

pub use shutdown::{shutdown_signal, SessionGuard, ShutdownController};
pub use wait::{await_condition, await_condition_async, WaitError};
