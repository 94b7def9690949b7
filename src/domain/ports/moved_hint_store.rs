//! Moved Hint Store Port
//!
//! Server-side, short-lived redirects for regions that moved away.

use crate::domain::value_objects::ServerName;

/// Store of moved-region hints keyed by encoded region name.
pub trait MovedHintStore: Send + Sync {
    /// Remember that the region now lives on `destination`.
    fn record(&self, encoded_name: &str, destination: ServerName);

    /// Live hint for the region, if any. Expired hints are never returned.
    fn get(&self, encoded_name: &str) -> Option<ServerName>;

    /// Forget the hint (the region came back to this server).
    fn remove(&self, encoded_name: &str);
}
