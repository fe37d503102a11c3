//! In-memory backing store.
//!
//! Tables are ordered maps keyed by the four key columns, which gives the
//! unique index for free. Transactions hold the table lock for their whole
//! lifetime and work on a staged copy that replaces the live tables on
//! commit, so they are serializable.
//!
//! The store records every `select` and supports fault injection so tests
//! can assert exactly what the datastore asked for and how it recovers.

use hoard_core::{LeafKey, ModuleId, Predicate, Row, StoreError, TableSchema};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{BackingStore, StoreTransaction};

type RowKey = (ModuleId, String, String, LeafKey);
type Table = BTreeMap<RowKey, Value>;
type Tables = HashMap<String, Table>;

#[derive(Debug, Default, Clone)]
struct Faults {
    fail_selects: bool,
    fail_deletes: bool,
    fail_rollback: bool,
    fail_upsert_key: Option<LeafKey>,
}

/// In-memory [`BackingStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
    select_log: Mutex<Vec<Vec<Predicate>>>,
    begins: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the schema's table already created.
    pub fn with_table(schema: &TableSchema) -> Self {
        let store = Self::new();
        store.create_table(schema);
        store
    }

    pub fn create_table(&self, schema: &TableSchema) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.entry(schema.table.clone()).or_default();
        }
    }

    /// Every row in the table, in key order.
    pub fn rows(&self, schema: &TableSchema) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(select_rows(table(&tables, schema)?, &[]))
    }

    /// Number of `select` calls so far.
    pub fn select_count(&self) -> usize {
        self.select_log.lock().map(|log| log.len()).unwrap_or(0)
    }

    /// Predicates of every `select` so far, oldest first.
    pub fn select_log(&self) -> Vec<Vec<Predicate>> {
        self.select_log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Number of transactions started so far.
    pub fn begin_count(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn clear_select_log(&self) {
        if let Ok(mut log) = self.select_log.lock() {
            log.clear();
        }
    }

    pub fn set_fail_selects(&self, fail: bool) {
        self.with_faults(|f| f.fail_selects = fail);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.with_faults(|f| f.fail_deletes = fail);
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.with_faults(|f| f.fail_rollback = fail);
    }

    /// Fail any upsert or bulk insert touching this leaf key.
    pub fn set_fail_upsert_key(&self, key: Option<LeafKey>) {
        self.with_faults(|f| f.fail_upsert_key = key);
    }

    fn with_faults(&self, apply: impl FnOnce(&mut Faults)) {
        if let Ok(mut faults) = self.faults.lock() {
            apply(&mut faults);
        }
    }

    fn faults(&self) -> Faults {
        self.faults.lock().map(|f| f.clone()).unwrap_or_default()
    }

    fn check_write(&self, schema: &TableSchema, row: &Row) -> Result<(), StoreError> {
        if self.faults().fail_upsert_key.as_ref() == Some(&row.key_id) {
            return Err(StoreError::WriteFailed {
                table: schema.table.clone(),
                reason: format!("injected failure for key {}", row.key_id),
            });
        }
        Ok(())
    }

    fn check_delete(&self, schema: &TableSchema) -> Result<(), StoreError> {
        if self.faults().fail_deletes {
            return Err(StoreError::WriteFailed {
                table: schema.table.clone(),
                reason: "injected delete failure".to_string(),
            });
        }
        Ok(())
    }

    fn lock_tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn table<'t>(tables: &'t Tables, schema: &TableSchema) -> Result<&'t Table, StoreError> {
    tables.get(&schema.table).ok_or_else(|| StoreError::UnknownTable {
        table: schema.table.clone(),
    })
}

fn table_mut<'t>(tables: &'t mut Tables, schema: &TableSchema) -> Result<&'t mut Table, StoreError> {
    tables
        .get_mut(&schema.table)
        .ok_or_else(|| StoreError::UnknownTable {
            table: schema.table.clone(),
        })
}

fn to_row(key: &RowKey, value: &Value) -> Row {
    Row {
        module_id: key.0,
        type_id: key.1.clone(),
        branch_id: key.2.clone(),
        key_id: key.3.clone(),
        value: value.clone(),
    }
}

fn row_key(row: &Row) -> RowKey {
    (
        row.module_id,
        row.type_id.clone(),
        row.branch_id.clone(),
        row.key_id.clone(),
    )
}

fn select_rows(table: &Table, predicates: &[Predicate]) -> Vec<Row> {
    table
        .iter()
        .map(|(key, value)| to_row(key, value))
        .filter(|row| predicates.iter().all(|p| p.matches(row)))
        .collect()
}

fn upsert_row(table: &mut Table, row: &Row) -> u64 {
    match table.insert(row_key(row), row.value.clone()) {
        Some(previous) if previous == row.value => 0,
        _ => 1,
    }
}

fn delete_rows(table: &mut Table, predicates: &[Predicate]) -> u64 {
    let before = table.len();
    table.retain(|key, value| !predicates.iter().all(|p| p.matches(&to_row(key, value))));
    (before - table.len()) as u64
}

fn update_rows(table: &mut Table, value: &Value, predicates: &[Predicate]) -> u64 {
    let mut changed = 0;
    for (key, current) in table.iter_mut() {
        if predicates.iter().all(|p| p.matches(&to_row(key, current))) && current != value {
            *current = value.clone();
            changed += 1;
        }
    }
    changed
}

impl BackingStore for MemoryStore {
    fn select(&self, schema: &TableSchema, predicates: &[Predicate]) -> Result<Vec<Row>, StoreError> {
        if let Ok(mut log) = self.select_log.lock() {
            log.push(predicates.to_vec());
        }
        if self.faults().fail_selects {
            return Err(StoreError::QueryFailed {
                table: schema.table.clone(),
                reason: "injected select failure".to_string(),
            });
        }
        let tables = self.lock_tables()?;
        Ok(select_rows(table(&tables, schema)?, predicates))
    }

    fn upsert(&self, schema: &TableSchema, row: &Row) -> Result<u64, StoreError> {
        self.check_write(schema, row)?;
        let mut tables = self.lock_tables()?;
        Ok(upsert_row(table_mut(&mut tables, schema)?, row))
    }

    fn bulk_insert(&self, schema: &TableSchema, rows: &[Row]) -> Result<u64, StoreError> {
        rows.iter().try_for_each(|row| self.check_write(schema, row))?;
        let mut tables = self.lock_tables()?;
        let table = table_mut(&mut tables, schema)?;
        for row in rows {
            upsert_row(table, row);
        }
        Ok(rows.len() as u64)
    }

    fn update(
        &self,
        schema: &TableSchema,
        value: &Value,
        predicates: &[Predicate],
    ) -> Result<u64, StoreError> {
        let mut tables = self.lock_tables()?;
        Ok(update_rows(table_mut(&mut tables, schema)?, value, predicates))
    }

    fn delete(&self, schema: &TableSchema, predicates: &[Predicate]) -> Result<u64, StoreError> {
        self.check_delete(schema)?;
        let mut tables = self.lock_tables()?;
        Ok(delete_rows(table_mut(&mut tables, schema)?, predicates))
    }

    fn truncate(&self, schema: &TableSchema) -> Result<u64, StoreError> {
        self.check_delete(schema)?;
        let mut tables = self.lock_tables()?;
        let table = table_mut(&mut tables, schema)?;
        let count = table.len() as u64;
        table.clear();
        Ok(count)
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        let live = self.lock_tables()?;
        self.begins.fetch_add(1, Ordering::SeqCst);
        let staged = live.clone();
        Ok(Box::new(MemoryTransaction {
            store: self,
            live,
            staged,
        }))
    }
}

/// Transaction over a staged copy of every table.
struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    live: MutexGuard<'a, Tables>,
    staged: Tables,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn upsert(&mut self, schema: &TableSchema, row: &Row) -> Result<u64, StoreError> {
        self.store.check_write(schema, row)?;
        Ok(upsert_row(table_mut(&mut self.staged, schema)?, row))
    }

    fn bulk_insert(&mut self, schema: &TableSchema, rows: &[Row]) -> Result<u64, StoreError> {
        rows.iter()
            .try_for_each(|row| self.store.check_write(schema, row))?;
        let table = table_mut(&mut self.staged, schema)?;
        for row in rows {
            upsert_row(table, row);
        }
        Ok(rows.len() as u64)
    }

    fn delete(&mut self, schema: &TableSchema, predicates: &[Predicate]) -> Result<u64, StoreError> {
        self.store.check_delete(schema)?;
        Ok(delete_rows(table_mut(&mut self.staged, schema)?, predicates))
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut live, staged, ..
        } = *self;
        *live = staged;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        if self.store.faults().fail_rollback {
            return Err(StoreError::TransactionFailed {
                reason: "injected rollback failure".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoard_core::Column;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::standard("rows", "ns")
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::with_table(&schema());
        store
            .bulk_insert(
                &schema(),
                &[
                    Row::new(1, "a", "x", 1, json!("v1")),
                    Row::new(1, "a", "x", 2, json!("v2")),
                    Row::new(2, "b", "y", 1, json!("v3")),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_unknown_table() {
        let store = MemoryStore::new();
        let err = store.select(&schema(), &[]).unwrap_err();
        assert!(matches!(err, StoreError::UnknownTable { .. }));
    }

    #[test]
    fn test_upsert_reports_changes() {
        let store = MemoryStore::with_table(&schema());
        let row = Row::new(1, "a", "x", 1, json!("v"));
        assert_eq!(store.upsert(&schema(), &row).unwrap(), 1);
        assert_eq!(store.upsert(&schema(), &row).unwrap(), 0);
        let changed = Row::new(1, "a", "x", 1, json!("w"));
        assert_eq!(store.upsert(&schema(), &changed).unwrap(), 1);
        assert_eq!(store.rows(&schema()).unwrap().len(), 1);
    }

    #[test]
    fn test_select_filters_and_logs() {
        let store = seeded();
        let rows = store
            .select(&schema(), &[Predicate::eq(Column::ModuleId, json!(1))])
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(store.select_count(), 1);
        assert_eq!(store.select_log()[0].len(), 1);

        let nested = store.select_nested(&schema(), &[]).unwrap();
        assert_eq!(nested.len(), 2);
    }

    #[test]
    fn test_update_and_delete() {
        let store = seeded();
        let by_module = [Predicate::eq(Column::ModuleId, json!(1))];
        assert_eq!(store.update(&schema(), &json!("z"), &by_module).unwrap(), 2);
        assert_eq!(store.update(&schema(), &json!("z"), &by_module).unwrap(), 0);
        assert_eq!(store.delete(&schema(), &by_module).unwrap(), 2);
        assert_eq!(store.truncate(&schema()).unwrap(), 1);
        assert!(store.rows(&schema()).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_commit_publishes_writes() {
        let store = MemoryStore::with_table(&schema());
        let mut txn = store.begin().unwrap();
        txn.upsert(&schema(), &Row::new(1, "a", "x", 1, json!(1))).unwrap();
        txn.upsert(&schema(), &Row::new(2, "a", "x", 1, json!(2))).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.rows(&schema()).unwrap().len(), 2);
    }

    #[test]
    fn test_transaction_rollback_discards_writes() {
        let store = seeded();
        let mut txn = store.begin().unwrap();
        txn.delete(&schema(), &[]).unwrap();
        txn.upsert(&schema(), &Row::new(9, "a", "x", 1, json!(1))).unwrap();
        txn.rollback().unwrap();
        assert_eq!(store.rows(&schema()).unwrap().len(), 3);
    }

    #[test]
    fn test_dropped_transaction_discards_writes() {
        let store = MemoryStore::with_table(&schema());
        {
            let mut txn = store.begin().unwrap();
            txn.upsert(&schema(), &Row::new(1, "a", "x", 1, json!(1))).unwrap();
        }
        assert!(store.rows(&schema()).unwrap().is_empty());
    }

    #[test]
    fn test_fault_injection() {
        let store = seeded();
        store.set_fail_upsert_key(Some(LeafKey::Int(2)));
        let mut txn = store.begin().unwrap();
        assert!(txn.upsert(&schema(), &Row::new(1, "a", "x", 1, json!(0))).is_ok());
        assert!(txn.upsert(&schema(), &Row::new(1, "a", "x", 2, json!(0))).is_err());
        store.set_fail_rollback(true);
        assert!(matches!(
            txn.rollback(),
            Err(StoreError::TransactionFailed { .. })
        ));

        store.set_fail_selects(true);
        assert!(matches!(
            store.select(&schema(), &[]),
            Err(StoreError::QueryFailed { .. })
        ));
        store.set_fail_deletes(true);
        assert!(store.delete(&schema(), &[]).is_err());
    }
}
