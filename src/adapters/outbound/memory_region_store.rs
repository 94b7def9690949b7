//! In-Memory Region Store
//!
//! Implements RegionStore as a small LSM: a mutable memstore plus immutable
//! store files, with minor and major compaction.

use crate::domain::entities::{Mutation, Row, WalEdit};
use crate::domain::ports::RegionStore;
use crate::domain::value_objects::SequenceId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Newest version of a row within one layer. `None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cell {
    sequence: SequenceId,
    value: Option<Vec<u8>>,
}

type Layer = BTreeMap<Vec<u8>, Cell>;

#[derive(Default)]
struct StoreState {
    memstore: Layer,
    /// Oldest first
    files: Vec<Layer>,
}

impl StoreState {
    fn layers(&self) -> impl Iterator<Item = &Layer> {
        std::iter::once(&self.memstore).chain(self.files.iter())
    }

    fn newest(&self, row: &[u8]) -> Option<&Cell> {
        self.layers()
            .filter_map(|layer| layer.get(row))
            .max_by_key(|cell| cell.sequence)
    }
}

/// Merge layers keeping the newest cell per row.
fn merge(layers: Vec<Layer>, drop_tombstones: bool) -> Layer {
    let mut merged = Layer::new();
    for layer in layers {
        for (row, cell) in layer {
            match merged.get(&row) {
                Some(existing) if existing.sequence > cell.sequence => {}
                _ => {
                    merged.insert(row, cell);
                }
            }
        }
    }
    if drop_tombstones {
        merged.retain(|_, cell| cell.value.is_some());
    }
    merged
}

/// Minimum number of store files before a minor compaction does anything.
const MINOR_COMPACTION_THRESHOLD: usize = 3;

/// In-memory region store.
#[derive(Default)]
pub struct MemoryRegionStore {
    state: RwLock<StoreState>,
}

impl MemoryRegionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tombstones still held anywhere in the store.
    pub fn tombstone_count(&self) -> usize {
        let state = self.state.read();
        state
            .layers()
            .map(|layer| layer.values().filter(|c| c.value.is_none()).count())
            .sum()
    }
}

impl RegionStore for MemoryRegionStore {
    fn apply(&self, edit: &WalEdit) {
        let mut state = self.state.write();
        for mutation in &edit.mutations {
            let cell = Cell {
                sequence: edit.sequence_id,
                value: match mutation {
                    Mutation::Put { value, .. } => Some(value.clone()),
                    Mutation::DeleteRow { .. } => None,
                },
            };
            match state.memstore.get(mutation.row()) {
                Some(existing) if existing.sequence > cell.sequence => {}
                _ => {
                    state.memstore.insert(mutation.row().to_vec(), cell);
                }
            }
        }
    }

    fn get(&self, row: &[u8]) -> Option<Row> {
        let state = self.state.read();
        let cell = state.newest(row)?;
        cell.value.as_ref().map(|value| Row::new(row, value.clone()))
    }

    fn seek(&self, from: Bound<&[u8]>, stop: Option<&[u8]>) -> Option<Row> {
        let state = self.state.read();
        let mut lower: Bound<Vec<u8>> = match from {
            Bound::Included(key) => Bound::Included(key.to_vec()),
            Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
            Bound::Unbounded => Bound::Unbounded,
        };

        loop {
            let range = (
                match &lower {
                    Bound::Included(key) => Bound::Included(key.as_slice()),
                    Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
                    Bound::Unbounded => Bound::Unbounded,
                },
                Bound::Unbounded,
            );
            let key = state
                .layers()
                .filter_map(|layer| layer.range::<[u8], _>(range).next().map(|(k, _)| k))
                .min()?
                .clone();

            if stop.is_some_and(|stop| key.as_slice() >= stop) {
                return None;
            }
            if let Some(value) = state.newest(&key).and_then(|c| c.value.clone()) {
                return Some(Row::new(key, value));
            }
            lower = Bound::Excluded(key);
        }
    }

    fn flush(&self) {
        let mut state = self.state.write();
        if state.memstore.is_empty() {
            return;
        }
        let file = std::mem::take(&mut state.memstore);
        tracing::debug!("flushed {} cells into store file {}", file.len(), state.files.len());
        state.files.push(file);
    }

    fn compact(&self, major: bool) {
        let mut state = self.state.write();
        if major {
            if state.files.is_empty() {
                return;
            }
            let files = std::mem::take(&mut state.files);
            let count = files.len();
            let merged = merge(files, true);
            tracing::debug!("major compaction merged {} files into {} cells", count, merged.len());
            state.files.push(merged);
        } else {
            if state.files.len() < MINOR_COMPACTION_THRESHOLD {
                return;
            }
            // the oldest file is left out, so tombstones may still shadow it
            let newer = state.files.split_off(1);
            let count = newer.len();
            let merged = merge(newer, false);
            tracing::debug!("minor compaction merged {} files into {} cells", count, merged.len());
            state.files.push(merged);
        }
    }

    fn store_file_count(&self) -> usize {
        self.state.read().files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::RowScanner;
    use std::sync::Arc;

    fn put(seq: SequenceId, row: &str, value: &str) -> WalEdit {
        WalEdit::new(seq, vec![Mutation::put(row, value)])
    }

    fn delete(seq: SequenceId, row: &str) -> WalEdit {
        WalEdit::new(seq, vec![Mutation::delete(row)])
    }

    fn keys(store: Arc<MemoryRegionStore>) -> Vec<String> {
        RowScanner::full(store).map(|r| r.key_str()).collect()
    }

    #[test]
    fn test_get_returns_newest_version() {
        let store = MemoryRegionStore::new();
        store.apply(&put(1, "a", "v1"));
        store.flush();
        store.apply(&put(2, "a", "v2"));
        assert_eq!(store.get(b"a").unwrap().value, b"v2".to_vec());
    }

    #[test]
    fn test_older_edit_does_not_overwrite() {
        let store = MemoryRegionStore::new();
        store.apply(&put(5, "a", "new"));
        store.apply(&put(3, "a", "old"));
        assert_eq!(store.get(b"a").unwrap().value, b"new".to_vec());
    }

    #[test]
    fn test_delete_shadows_flushed_put() {
        let store = MemoryRegionStore::new();
        store.apply(&put(1, "a", "v"));
        store.flush();
        store.apply(&delete(2, "a"));
        assert!(store.get(b"a").is_none());

        store.flush();
        assert!(store.get(b"a").is_none());
        assert_eq!(store.store_file_count(), 2);
    }

    #[test]
    fn test_seek_skips_tombstones_and_honours_stop() {
        let store = Arc::new(MemoryRegionStore::new());
        store.apply(&put(1, "a", "v"));
        store.apply(&put(2, "b", "v"));
        store.flush();
        store.apply(&put(3, "c", "v"));
        store.apply(&delete(4, "b"));

        assert_eq!(keys(store.clone()), vec!["a", "c"]);
        assert!(store.seek(Bound::Excluded(b"a"), Some(b"c")).is_none());
        assert_eq!(
            store.seek(Bound::Included(b"b"), None).unwrap().key_str(),
            "c"
        );
    }

    #[test]
    fn test_minor_compaction_keeps_tombstones() {
        let store = Arc::new(MemoryRegionStore::new());
        store.apply(&put(1, "t1,r1", "v"));
        store.flush();
        store.apply(&delete(2, "t1,r1"));
        store.flush();
        store.apply(&put(3, "t2,r1", "v"));
        store.flush();

        store.compact(false);
        assert_eq!(store.store_file_count(), 2);
        assert_eq!(store.tombstone_count(), 1);
        assert_eq!(keys(store.clone()), vec!["t2,r1"]);
    }

    #[test]
    fn test_minor_compaction_below_threshold_is_noop() {
        let store = MemoryRegionStore::new();
        store.apply(&put(1, "a", "v"));
        store.flush();
        store.apply(&put(2, "b", "v"));
        store.flush();
        store.compact(false);
        assert_eq!(store.store_file_count(), 2);
    }

    #[test]
    fn test_major_compaction_drops_tombstones_and_shadowed_rows() {
        let store = Arc::new(MemoryRegionStore::new());
        store.apply(&put(1, "t1,r1", "v"));
        store.apply(&put(2, "t1,r2", "v"));
        store.flush();
        store.apply(&delete(3, "t1,r1"));
        store.flush();

        store.compact(true);
        assert_eq!(store.store_file_count(), 1);
        assert_eq!(store.tombstone_count(), 0);
        assert_eq!(keys(store.clone()), vec!["t1,r2"]);
        assert!(store.get(b"t1,r1").is_none());
    }

    #[test]
    fn test_memstore_tombstone_survives_major_compaction() {
        let store = MemoryRegionStore::new();
        store.apply(&put(1, "a", "v"));
        store.flush();
        store.apply(&delete(2, "a"));

        store.compact(true);
        assert!(store.get(b"a").is_none());
        assert_eq!(store.tombstone_count(), 1);
    }
}
