//! Backing store traits.
//!
//! The backing store is the table of record. The datastore only talks to it
//! through predicate-based CRUD and single-level transactions, so any
//! relational engine with a unique index on the four key columns can sit
//! behind these traits.

pub mod memory;

pub use memory::MemoryStore;

use hoard_core::{nest_rows, ModuleId, Predicate, Row, StoreError, TableSchema, TypeMap};
use serde_json::Value;
use std::collections::BTreeMap;

/// Predicate-based access to the table of record.
pub trait BackingStore: Send + Sync {
    /// Rows matching every predicate, flat.
    fn select(&self, schema: &TableSchema, predicates: &[Predicate]) -> Result<Vec<Row>, StoreError>;

    /// Rows matching every predicate, keyed module → type → branch → key.
    fn select_nested(
        &self,
        schema: &TableSchema,
        predicates: &[Predicate],
    ) -> Result<BTreeMap<ModuleId, TypeMap>, StoreError> {
        Ok(nest_rows(self.select(schema, predicates)?))
    }

    /// Insert or replace one row by its key. Returns 1 when a row was
    /// inserted or its value changed, 0 when the stored value was identical.
    fn upsert(&self, schema: &TableSchema, row: &Row) -> Result<u64, StoreError>;

    /// Insert rows, replacing any with the same key. Returns rows written.
    fn bulk_insert(&self, schema: &TableSchema, rows: &[Row]) -> Result<u64, StoreError>;

    /// Set the value of every matching row. Returns rows changed.
    fn update(
        &self,
        schema: &TableSchema,
        value: &Value,
        predicates: &[Predicate],
    ) -> Result<u64, StoreError>;

    /// Delete every matching row. Returns rows deleted.
    fn delete(&self, schema: &TableSchema, predicates: &[Predicate]) -> Result<u64, StoreError>;

    /// Delete every row in the table. Returns rows deleted.
    fn truncate(&self, schema: &TableSchema) -> Result<u64, StoreError>;

    /// Start a transaction. A transaction cannot start another, so nesting
    /// never exceeds one level.
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;
}

/// An open transaction. Dropping it without committing discards its writes.
pub trait StoreTransaction {
    fn upsert(&mut self, schema: &TableSchema, row: &Row) -> Result<u64, StoreError>;

    fn bulk_insert(&mut self, schema: &TableSchema, rows: &[Row]) -> Result<u64, StoreError>;

    fn delete(&mut self, schema: &TableSchema, predicates: &[Predicate]) -> Result<u64, StoreError>;

    /// Make every write visible. Consumes the transaction.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every write. Consumes the transaction.
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
