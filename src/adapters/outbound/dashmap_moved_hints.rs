//! DashMap Moved Hint Store
//!
//! Implements MovedHintStore using DashMap, with a bounded hint lifetime.

use crate::domain::entities::MovedHint;
use crate::domain::ports::MovedHintStore;
use crate::domain::value_objects::ServerName;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// DashMap-backed moved-region hints.
pub struct DashMapMovedHintStore {
    hints: Arc<DashMap<String, MovedHint>>,
    ttl: Duration,
}

impl DashMapMovedHintStore {
    /// Create a store whose hints live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            hints: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Start the background garbage collection task.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_gc(&self, interval: Duration) {
        let hints = self.hints.clone();
        let ttl = self.ttl;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let before = hints.len();
                hints.retain(|_, hint| !hint.is_expired(ttl));
                let removed = before.saturating_sub(hints.len());
                if removed > 0 {
                    tracing::debug!("moved hint GC removed {} expired entries", removed);
                }
            }
        });
    }

    /// Remove expired hints now; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.hints.len();
        self.hints.retain(|_, hint| !hint.is_expired(self.ttl));
        before.saturating_sub(self.hints.len())
    }

    /// Age a hint as if it had been recorded `age` ago.
    pub fn backdate(&self, encoded_name: &str, age: Duration) {
        if let Some(mut hint) = self.hints.get_mut(encoded_name) {
            if let Some(at) = hint.recorded_at.checked_sub(age) {
                hint.recorded_at = at;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.hints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }
}

impl MovedHintStore for DashMapMovedHintStore {
    fn record(&self, encoded_name: &str, destination: ServerName) {
        self.hints
            .insert(encoded_name.to_string(), MovedHint::new(destination));
    }

    fn get(&self, encoded_name: &str) -> Option<ServerName> {
        let hint = self.hints.get(encoded_name)?;
        if hint.is_expired(self.ttl) {
            drop(hint);
            self.hints.remove(encoded_name);
            return None;
        }
        Some(hint.destination.clone())
    }

    fn remove(&self, encoded_name: &str) {
        self.hints.remove(encoded_name);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn dest() -> ServerName {
        ServerName::new("rs2.local", 16020)
    }

    #[test]
    fn test_record_and_get() {
        let store = DashMapMovedHintStore::new(Duration::from_secs(30));
        store.record("abcd", dest());
        assert_eq!(store.get("abcd"), Some(dest()));
        assert_eq!(store.get("other"), None);
    }

    #[test]
    fn test_remove() {
        let store = DashMapMovedHintStore::new(Duration::from_secs(30));
        store.record("abcd", dest());
        store.remove("abcd");
        assert_eq!(store.get("abcd"), None);
    }

    #[test]
    fn test_expired_hint_is_dropped() {
        let store = DashMapMovedHintStore::new(Duration::from_secs(30));
        store.record("abcd", dest());
        store.backdate("abcd", Duration::from_secs(31));

        assert_eq!(store.get("abcd"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_cleanup_expired() {
        let store = DashMapMovedHintStore::new(Duration::from_millis(5));
        store.record("a", dest());
        store.record("b", dest());
        std::thread::sleep(Duration::from_millis(15));
        store.record("c", dest());

        assert_eq!(store.cleanup_expired(), 2);
        assert_eq!(store.len(), 1);
    }
}
