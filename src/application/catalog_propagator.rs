//! Catalog Mutation Propagator
//!
//! Writes and drops a table's catalog rows on the catalog primary. Drops are
//! ordinary WAL edits of row deletes; the replication pipeline carries them to
//! the secondaries like any other edit, and tombstones survive until a major
//! compaction so a secondary never resurrects a dropped row.

use crate::application::HostedRegion;
use crate::domain::entities::{Mutation, RegionLocation, Row};
use crate::domain::ports::{RegionStore, RowScanner};
use crate::domain::value_objects::{SequenceId, TableName};
use dashmap::DashMap;
use std::sync::Arc;

/// Catalog write failures.
#[derive(Debug, thiserror::Error)]
pub enum PropagationError {
    #[error("failed to encode catalog row: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("catalog region is not the primary replica")]
    NotPrimary,
    #[error("region {region} does not belong to table {table}")]
    ForeignRegion { table: TableName, region: String },
}

/// Registry of dropped tables and the sequence id of their delete edit.
///
/// Shared between the propagator, which fills it, and read routers, which
/// refuse to hand out rows of a table listed here.
#[derive(Debug, Default)]
pub struct DeletedTables {
    tables: DashMap<TableName, SequenceId>,
}

impl DeletedTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, table: TableName, sequence_id: SequenceId) {
        self.tables.insert(table, sequence_id);
    }

    pub fn unmark(&self, table: &TableName) {
        self.tables.remove(table);
    }

    pub fn is_deleted(&self, table: &TableName) -> bool {
        self.tables.contains_key(table)
    }

    /// Sequence id of the edit that dropped `table`.
    pub fn deleted_at(&self, table: &TableName) -> Option<SequenceId> {
        self.tables.get(table).map(|s| *s.value())
    }

    /// Whether any row belongs to a dropped table.
    pub fn shadows(&self, rows: &[Row]) -> bool {
        if self.tables.is_empty() {
            return false;
        }
        rows.iter()
            .any(|row| self.tables.iter().any(|t| t.key().owns_row(&row.key)))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Applies table-level catalog mutations on the catalog primary.
pub struct CatalogMutationPropagator {
    catalog: Arc<HostedRegion>,
    deleted: Arc<DeletedTables>,
}

impl CatalogMutationPropagator {
    pub fn new(catalog: Arc<HostedRegion>, deleted: Arc<DeletedTables>) -> Self {
        Self { catalog, deleted }
    }

    pub fn deleted_tables(&self) -> &Arc<DeletedTables> {
        &self.deleted
    }

    /// Write one catalog row per region of `table` in a single edit.
    pub fn register_table(
        &self,
        table: &TableName,
        locations: &[RegionLocation],
    ) -> Result<SequenceId, PropagationError> {
        let mut mutations = Vec::with_capacity(locations.len());
        for location in locations {
            if &location.region.table != table {
                return Err(PropagationError::ForeignRegion {
                    table: table.clone(),
                    region: location.region.encoded_name(),
                });
            }
            let row = location.to_catalog_row()?;
            mutations.push(Mutation::put(row.key, row.value));
        }

        let sequence_id = self
            .catalog
            .write_with(
                |_| mutations,
                |sequence_id, _| {
                    self.deleted.unmark(table);
                    sequence_id
                },
            )
            .ok_or(PropagationError::NotPrimary)?;
        tracing::info!(
            "registered {} regions of {} at sequence {}",
            locations.len(),
            table,
            sequence_id
        );
        Ok(sequence_id)
    }

    /// Delete every catalog row of `table` in a single edit.
    ///
    /// Returns the sequence id a secondary must reach before it can be
    /// expected to show no rows of the table.
    pub fn drop_table(&self, table: &TableName) -> Result<SequenceId, PropagationError> {
        // scan, delete and mark under one lock so a concurrent register
        // either lands before the scan or after the mark
        let (sequence_id, count) = self
            .catalog
            .write_with(
                |store| {
                    rows_of(store, table)
                        .map(|row| Mutation::delete(row.key))
                        .collect()
                },
                |sequence_id, count| {
                    self.deleted.mark(table.clone(), sequence_id);
                    (sequence_id, count)
                },
            )
            .ok_or(PropagationError::NotPrimary)?;
        if count > 0 {
            tracing::info!(
                "dropped {} catalog rows of {} at sequence {}",
                count,
                table,
                sequence_id
            );
        }
        Ok(sequence_id)
    }

    /// Whether `replica` has applied the drop of `table` and shows none of its rows.
    pub fn has_converged(&self, table: &TableName, replica: &HostedRegion) -> bool {
        match self.deleted.deleted_at(table) {
            Some(sequence_id) => {
                replica.last_applied() >= sequence_id && table_rows(replica, table).next().is_none()
            }
            None => false,
        }
    }
}

/// Lazy scan over the catalog rows of one table.
pub fn table_rows(catalog: &HostedRegion, table: &TableName) -> RowScanner {
    rows_of(catalog.store(), table)
}

fn rows_of(store: &Arc<dyn RegionStore>, table: &TableName) -> RowScanner {
    RowScanner::new(store.clone(), table.row_prefix(), Some(table.row_prefix_end()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::outbound::{MemoryRegionStore, MemoryWal};
    use crate::domain::entities::RegionInfo;
    use crate::domain::value_objects::{ReplicaId, ServerName};

    fn catalog_primary() -> Arc<HostedRegion> {
        Arc::new(HostedRegion::primary(
            RegionInfo::catalog().replica(ReplicaId::PRIMARY),
            Arc::new(MemoryRegionStore::new()),
            Arc::new(MemoryWal::new()),
        ))
    }

    fn locations(table: &TableName, splits: &[&str]) -> Vec<RegionLocation> {
        let mut bounds: Vec<&str> = vec![""];
        bounds.extend_from_slice(splits);
        bounds.push("");
        bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                RegionLocation::new(
                    RegionInfo::new(table.clone(), w[0], w[1], i as u64 + 1),
                    ServerName::new("rs1", 16020),
                )
            })
            .collect()
    }

    /// Copy every WAL edit of the primary into a secondary store, the way a sink would.
    fn replay(primary: &HostedRegion, secondary: &HostedRegion) {
        let edits = primary.wal().unwrap().read_durable(0, usize::MAX).unwrap();
        secondary.with_applied(|applied, store| {
            let floor = *applied;
            for edit in edits.iter().filter(|e| e.sequence_id > floor) {
                store.apply(edit);
                *applied = edit.sequence_id;
            }
        });
    }

    #[test]
    fn test_register_writes_one_row_per_region() {
        let primary = catalog_primary();
        let propagator = CatalogMutationPropagator::new(primary.clone(), Arc::new(DeletedTables::new()));
        let table = TableName::new("users");

        let seq = propagator
            .register_table(&table, &locations(&table, &["g", "p"]))
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(table_rows(&primary, &table).count(), 3);
    }

    #[test]
    fn test_register_rejects_foreign_region() {
        let propagator = CatalogMutationPropagator::new(catalog_primary(), Arc::new(DeletedTables::new()));
        let other = TableName::new("orders");
        let err = propagator
            .register_table(&TableName::new("users"), &locations(&other, &[]))
            .unwrap_err();
        assert!(matches!(err, PropagationError::ForeignRegion { .. }));
    }

    #[test]
    fn test_drop_table_is_single_edit_and_marks_deleted() {
        let primary = catalog_primary();
        let deleted = Arc::new(DeletedTables::new());
        let propagator = CatalogMutationPropagator::new(primary.clone(), deleted.clone());
        let users = TableName::new("users");
        let orders = TableName::new("orders");
        propagator.register_table(&users, &locations(&users, &["m"])).unwrap();
        propagator.register_table(&orders, &locations(&orders, &[])).unwrap();

        let seq = propagator.drop_table(&users).unwrap();
        assert_eq!(seq, 3);
        assert_eq!(deleted.deleted_at(&users), Some(3));
        assert_eq!(table_rows(&primary, &users).count(), 0);
        assert_eq!(table_rows(&primary, &orders).count(), 1);

        // re-registering lifts the deletion
        propagator.register_table(&users, &locations(&users, &[])).unwrap();
        assert!(!deleted.is_deleted(&users));
    }

    #[test]
    fn test_concurrent_register_and_drop_stay_consistent() {
        let primary = catalog_primary();
        let propagator = Arc::new(CatalogMutationPropagator::new(
            primary.clone(),
            Arc::new(DeletedTables::new()),
        ));
        let table = TableName::new("users");

        for round in 0..50u64 {
            let registering = {
                let propagator = propagator.clone();
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..20u64 {
                        let region = RegionInfo::new(
                            table.clone(),
                            format!("k{:02}", i),
                            format!("k{:02}z", i),
                            round * 100 + i + 1,
                        );
                        let location = RegionLocation::new(region, ServerName::new("rs1", 16020));
                        propagator.register_table(&table, &[location]).unwrap();
                    }
                })
            };
            for _ in 0..20 {
                propagator.drop_table(&table).unwrap();
            }
            registering.join().unwrap();

            // whichever write landed last decides both the rows and the mark
            let rows = table_rows(&primary, &table).count();
            let deleted = propagator.deleted_tables().is_deleted(&table);
            assert_eq!(deleted, rows == 0, "round {}: deleted={} rows={}", round, deleted, rows);
        }
    }

    #[test]
    fn test_drop_of_empty_table() {
        let primary = catalog_primary();
        let propagator = CatalogMutationPropagator::new(primary, Arc::new(DeletedTables::new()));
        let seq = propagator.drop_table(&TableName::new("ghost")).unwrap();
        assert_eq!(seq, 0);
        assert!(propagator.deleted_tables().is_deleted(&TableName::new("ghost")));
    }

    #[test]
    fn test_convergence_through_flush_and_compaction() {
        let primary = catalog_primary();
        let propagator = CatalogMutationPropagator::new(primary.clone(), Arc::new(DeletedTables::new()));
        let secondary = HostedRegion::secondary(
            RegionInfo::catalog().replica(ReplicaId(1)),
            Arc::new(MemoryRegionStore::new()),
        );
        let table = TableName::new("users");

        propagator.register_table(&table, &locations(&table, &["k"])).unwrap();
        replay(&primary, &secondary);
        secondary.store().flush();

        propagator.drop_table(&table).unwrap();
        assert!(!propagator.has_converged(&table, &secondary));

        replay(&primary, &secondary);
        secondary.store().flush();
        secondary.store().compact(false);
        assert!(propagator.has_converged(&table, &secondary));

        secondary.store().compact(true);
        assert!(propagator.has_converged(&table, &secondary));
    }

    #[test]
    fn test_shadows_only_deleted_tables() {
        let deleted = DeletedTables::new();
        let rows = vec![Row::new("users,,1", "x")];
        assert!(!deleted.shadows(&rows));

        deleted.mark(TableName::new("users"), 4);
        assert!(deleted.shadows(&rows));
        assert!(!deleted.shadows(&[Row::new("users2,,1", "x")]));
        assert!(!deleted.shadows(&[Row::new("orders,,1", "x")]));
    }
}
