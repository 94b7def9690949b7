//! Region Store Port
//!
//! Defines the interface of the storage engine underneath a single region.
//! Implementations may use an LSM tree, an in-memory map, or anything else
//! that honours delete-marker semantics.

use crate::domain::entities::{Row, WalEdit};
use std::ops::Bound;
use std::sync::Arc;

/// Storage engine of one region replica.
///
/// Deletes are stored as tombstones. A tombstone shadows every older version
/// of its row and may only be discarded by a major compaction, which sees
/// every store file at once.
pub trait RegionStore: Send + Sync {
    /// Apply the mutations of an edit, stamped with its sequence id.
    fn apply(&self, edit: &WalEdit);

    /// Newest visible version of a row.
    fn get(&self, row: &[u8]) -> Option<Row>;

    /// First visible row at or after `from` and strictly below `stop`.
    fn seek(&self, from: Bound<&[u8]>, stop: Option<&[u8]>) -> Option<Row>;

    /// Move the in-memory buffer into a new immutable store file.
    fn flush(&self);

    /// Merge store files. Only a major compaction may drop tombstones.
    fn compact(&self, major: bool);

    /// Number of immutable store files.
    fn store_file_count(&self) -> usize;
}

/// Lazy, ordered sequence of visible rows.
///
/// Each step re-seeks the store after the last returned key, so concurrent
/// writes are picked up and a scanner can be resumed from any key.
pub struct RowScanner {
    store: Arc<dyn RegionStore>,
    start: Vec<u8>,
    stop: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl RowScanner {
    /// Scan `[start, stop)`; `None` means to the end of the region.
    pub fn new(store: Arc<dyn RegionStore>, start: impl Into<Vec<u8>>, stop: Option<Vec<u8>>) -> Self {
        Self {
            store,
            start: start.into(),
            stop,
            last_key: None,
        }
    }

    /// Scan every row of the region.
    pub fn full(store: Arc<dyn RegionStore>) -> Self {
        Self::new(store, Vec::new(), None)
    }

    /// Restart the scan at `key` (inclusive).
    pub fn resume_from(&mut self, key: impl Into<Vec<u8>>) {
        self.start = key.into();
        self.last_key = None;
    }

    /// Key of the last row returned, if any.
    pub fn position(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }
}

impl Iterator for RowScanner {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        let from = match &self.last_key {
            Some(key) => Bound::Excluded(key.as_slice()),
            None => Bound::Included(self.start.as_slice()),
        };
        let row = self.store.seek(from, self.stop.as_deref())?;
        self.last_key = Some(row.key.clone());
        Some(row)
    }
}
