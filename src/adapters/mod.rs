//! Adapters
//!
//! Inbound adapters accept RPCs; outbound adapters implement the domain ports.

pub mod inbound;
pub mod outbound;
