//! Transactional write-back.
//!
//! The store is written while the affected pages are locked. Pages are
//! patched only once the store write is final, so a rolled-back write never
//! reaches the cache.

use hoard_core::{
    flatten_rows, CacheKey, CachePage, HoardError, HoardResult, LeafKey, ModuleId, Operation, Row,
    StoreError, TypeMap, ValidationError,
};
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, warn};

use super::Datastore;
use crate::cache::CacheBackend;
use crate::lease::PageLease;
use crate::store::{BackingStore, StoreTransaction};

impl<C: CacheBackend + ?Sized, S: BackingStore + ?Sized> Datastore<C, S> {
    /// Write one leaf. Returns 1 when the stored value changed, 0 when it
    /// was already identical.
    pub fn set_key(
        &self,
        module_id: ModuleId,
        type_id: &str,
        branch_id: &str,
        key_id: impl Into<LeafKey>,
        value: Value,
    ) -> HoardResult<u64> {
        let row = Row::new(module_id, type_id, branch_id, key_id, value);
        self.write_rows(Operation::SetKey, vec![row])
    }

    /// Write a batch of leaves, possibly spanning modules.
    ///
    /// One row is a single upsert. Several rows run in one transaction with
    /// every affected page locked throughout; any failed row rolls the whole
    /// batch back and leaves every page untouched.
    pub fn set_key_multi(&self, rows: Vec<Row>) -> HoardResult<u64> {
        self.write_rows(Operation::SetKeyMulti, rows)
    }

    /// Replace a module's entire subtree with `data`.
    ///
    /// Deletes every row of the module and inserts the replacement in one
    /// transaction, then rebuilds the page with every supplied type marked
    /// complete. Returns rows deleted plus rows inserted.
    pub fn set_policy(&self, module_id: ModuleId, data: TypeMap) -> HoardResult<u64> {
        let operation = Operation::SetPolicy;
        let target = CacheKey::module(module_id);
        let rows = flatten_rows(module_id, &data);
        rows.iter()
            .enumerate()
            .try_for_each(|(index, row)| row.validate(index))?;

        let mut lease = self.acquire(operation, &target, &[module_id])?;
        let changed = self.transact(operation, &target, |tx| {
            let deleted = tx.delete(&self.schema, &target.predicates())?;
            let inserted = if rows.is_empty() {
                0
            } else {
                tx.bulk_insert(&self.schema, &rows)?
            };
            Ok(deleted + inserted)
        })?;

        if let Some(page) = lease.page_mut(module_id) {
            *page = policy_page(data);
        }
        self.write_back(operation, &target, lease)?;
        debug!(namespace = %self.namespace(), module_id, rows = changed, "policy replaced");
        Ok(changed)
    }

    fn write_rows(&self, operation: Operation, rows: Vec<Row>) -> HoardResult<u64> {
        if rows.is_empty() {
            return Err(ValidationError::NoRows { operation }.into());
        }
        rows.iter()
            .enumerate()
            .try_for_each(|(index, row)| row.validate(index))?;

        let modules = super::dedup(rows.iter().map(|row| row.module_id));
        let target = RowsTarget::new(&rows);
        let mut lease = self.acquire(operation, &target, &modules)?;

        let changed = match rows.as_slice() {
            [row] => self
                .store
                .upsert(&self.schema, row)
                .map_err(|e| HoardError::store(operation, &target, e))?,
            _ => self.transact(operation, &target, |tx| {
                let mut changed = 0;
                for row in &rows {
                    changed += tx.upsert(&self.schema, row)?;
                }
                Ok(changed)
            })?,
        };

        for row in rows {
            if let Some(page) = lease.page_mut(row.module_id) {
                page.set_leaf(&row.type_id, &row.branch_id, row.key_id, row.value);
            }
        }
        self.write_back(operation, &target, lease)?;
        debug!(
            namespace = %self.namespace(),
            operation = %operation,
            target = %target,
            rows = changed,
            "rows written"
        );
        Ok(changed)
    }

    /// Run `work` in a store transaction, rolling back when it fails.
    ///
    /// A failed rollback is reported as [`HoardError::Rollback`]: the store
    /// state is then unknown.
    pub(super) fn transact(
        &self,
        operation: Operation,
        target: &dyn fmt::Display,
        work: impl FnOnce(&mut dyn StoreTransaction) -> Result<u64, StoreError>,
    ) -> HoardResult<u64> {
        let mut tx = self
            .store
            .begin()
            .map_err(|e| HoardError::store(operation, target, e))?;

        match work(&mut *tx) {
            Ok(changed) => {
                tx.commit()
                    .map_err(|e| HoardError::store(operation, target, e))?;
                Ok(changed)
            }
            Err(cause) => match tx.rollback() {
                Ok(()) => {
                    warn!(
                        namespace = %self.namespace(),
                        operation = %operation,
                        target = %target,
                        error = %cause,
                        "transaction rolled back"
                    );
                    Err(HoardError::store(operation, target, cause))
                }
                Err(source) => {
                    error!(
                        namespace = %self.namespace(),
                        operation = %operation,
                        target = %target,
                        cause = %cause,
                        error = %source,
                        "rollback failed, store state unknown"
                    );
                    Err(HoardError::Rollback {
                        operation,
                        target: target.to_string(),
                        cause,
                        source,
                    })
                }
            },
        }
    }

    /// Commit a lease after the store write is final.
    ///
    /// When the cache rejects the write the store already holds the new
    /// rows. The lease flushes the affected pages before unlocking them, so
    /// no other writer can restore the stale image.
    pub(super) fn write_back(
        &self,
        operation: Operation,
        target: &dyn fmt::Display,
        lease: PageLease<'_, C>,
    ) -> HoardResult<()> {
        let modules = lease.modules();
        match lease.commit() {
            Ok(pages) => {
                self.remember(pages);
                Ok(())
            }
            Err(e) => {
                error!(
                    namespace = %self.namespace(),
                    operation = %operation,
                    target = %target,
                    error = %e,
                    "cache write failed after store commit"
                );
                self.forget(&modules);
                Err(HoardError::cache_write(operation, target, true, e))
            }
        }
    }
}

/// The page for a freshly replaced module: every supplied type is complete.
fn policy_page(data: TypeMap) -> CachePage {
    let mut page = CachePage::new();
    for (type_id, branches) in data {
        page.replace_type(&type_id, branches);
    }
    page.prune();
    page
}

/// Error context for a row batch: the row's key for one row, otherwise the
/// batch size and the modules it spans.
struct RowsTarget {
    rendered: String,
}

impl RowsTarget {
    fn new(rows: &[Row]) -> Self {
        let rendered = match rows {
            [row] => row.cache_key().to_string(),
            _ => format!(
                "rows={} module={:?}",
                rows.len(),
                super::dedup(rows.iter().map(|row| row.module_id))
            ),
        };
        Self { rendered }
    }
}

impl fmt::Display for RowsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::store::MemoryStore;
    use hoard_core::{BranchMap, Ids, KeyMap, TableSchema};
    use serde_json::json;
    use std::sync::Arc;

    type Ds = Datastore<MemoryCacheBackend, MemoryStore>;

    fn datastore() -> Ds {
        let schema = TableSchema::standard("rows", "ns");
        let store = MemoryStore::with_table(&schema);
        Datastore::new(Arc::new(MemoryCacheBackend::new()), Arc::new(store), schema)
    }

    fn policy(entries: &[(&str, &str, i64, Value)]) -> TypeMap {
        let mut data = TypeMap::new();
        for (t, b, k, v) in entries {
            data.entry(t.to_string())
                .or_insert_with(BranchMap::new)
                .entry(b.to_string())
                .or_insert_with(KeyMap::new)
                .insert(LeafKey::Int(*k), v.clone());
        }
        data
    }

    #[test]
    fn test_set_key_writes_store_then_page() {
        let ds = datastore();
        assert_eq!(ds.set_key(1, "profile", "settings", 42, json!("dark_mode")).unwrap(), 1);
        assert_eq!(ds.set_key(1, "profile", "settings", 42, json!("dark_mode")).unwrap(), 0);

        let page = ds.cache().peek("ns", 1).unwrap();
        assert_eq!(
            page.leaf("profile", "settings", &LeafKey::Int(42)),
            Some(&json!("dark_mode"))
        );
        assert!(!page.all_cached);
        assert_eq!(ds.store().rows(ds.schema()).unwrap().len(), 1);
        assert!(ds.cache().held_locks().unwrap().is_empty());
    }

    #[test]
    fn test_set_key_rejects_empty_components() {
        let ds = datastore();
        let err = ds.set_key(1, "", "b", 1, json!(1)).unwrap_err();
        assert!(matches!(
            err,
            HoardError::Validation(ValidationError::InvalidRow { index: 0, .. })
        ));
        assert!(ds.cache().peek("ns", 1).is_none());
    }

    #[test]
    fn test_set_key_multi_rejects_empty_batch() {
        let ds = datastore();
        let err = ds.set_key_multi(Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            HoardError::Validation(ValidationError::NoRows {
                operation: Operation::SetKeyMulti
            })
        ));
    }

    #[test]
    fn test_multi_row_write_spans_modules() {
        let ds = datastore();
        let changed = ds
            .set_key_multi(vec![
                Row::new(1, "t", "b", 1, json!("a")),
                Row::new(2, "t", "b", 1, json!("b")),
                Row::new(2, "t", "c", "name", json!("c")),
            ])
            .unwrap();
        assert_eq!(changed, 3);
        assert_eq!(ds.cache().peek("ns", 2).unwrap().leaf_count(), 2);
        assert!(ds.cache().held_locks().unwrap().is_empty());
    }

    #[test]
    fn test_failed_row_rolls_back_batch_and_pages() {
        let ds = datastore();
        ds.set_key(1, "t", "b", 1, json!("old")).unwrap();
        let before = ds.cache().peek("ns", 1);

        ds.store().set_fail_upsert_key(Some(LeafKey::Int(3)));
        let err = ds
            .set_key_multi(vec![
                Row::new(1, "t", "b", 1, json!("new")),
                Row::new(1, "t", "b", 2, json!("new")),
                Row::new(1, "t", "b", 3, json!("new")),
            ])
            .unwrap_err();

        assert!(matches!(
            err,
            HoardError::Store {
                operation: Operation::SetKeyMulti,
                source: StoreError::WriteFailed { .. },
                ..
            }
        ));
        assert_eq!(ds.store().rows(ds.schema()).unwrap().len(), 1);
        assert_eq!(ds.cache().peek("ns", 1), before);
        assert!(ds.cache().held_locks().unwrap().is_empty());
    }

    #[test]
    fn test_failed_rollback_is_distinct() {
        let ds = datastore();
        ds.store().set_fail_upsert_key(Some(LeafKey::Int(2)));
        ds.store().set_fail_rollback(true);
        let err = ds
            .set_key_multi(vec![
                Row::new(1, "t", "b", 1, json!(1)),
                Row::new(1, "t", "b", 2, json!(2)),
            ])
            .unwrap_err();

        assert!(matches!(err, HoardError::Rollback { .. }));
        assert!(!err.is_retryable());
        assert!(ds.cache().held_locks().unwrap().is_empty());
    }

    #[test]
    fn test_cache_failure_after_commit_flushes_page() {
        let ds = datastore();
        ds.load_module(1).unwrap();
        ds.set_key(1, "t", "b", 1, json!("old")).unwrap();

        ds.cache().set_fail_writes(true);
        let err = ds.set_key(1, "t", "b", 1, json!("new")).unwrap_err();
        assert!(matches!(err, HoardError::CacheWrite { committed: true, .. }));
        assert!(!err.is_retryable());
        assert!(ds.cache().peek("ns", 1).is_none());
        assert!(ds.cache().held_locks().unwrap().is_empty());

        ds.cache().set_fail_writes(false);
        let read = ds.get_key(1, "t", "b", Ids::one(1)).unwrap();
        assert_eq!(read.into_single(), Some(json!("new")));
    }

    #[test]
    fn test_set_policy_replaces_module() {
        let ds = datastore();
        ds.set_key_multi(vec![
            Row::new(1, "old", "b", 1, json!(1)),
            Row::new(1, "old", "b", 2, json!(2)),
            Row::new(2, "old", "b", 1, json!(3)),
        ])
        .unwrap();

        let data = policy(&[("acl", "read", 1, json!(true)), ("acl", "write", 1, json!(false))]);
        assert_eq!(ds.set_policy(1, data.clone()).unwrap(), 4);

        let page = ds.cache().peek("ns", 1).unwrap();
        assert_eq!(page.keys, data);
        assert!(page.type_cached.contains("acl"));
        assert!(page.validate().is_ok());
        assert_eq!(ds.store().rows(ds.schema()).unwrap().len(), 3);

        let before = ds.store().select_count();
        assert!(ds.get_branch(1, "acl", Ids::many(["read", "write"])).unwrap().valid);
        assert_eq!(ds.store().select_count(), before);
    }

    #[test]
    fn test_empty_policy_clears_module() {
        let ds = datastore();
        ds.set_key(1, "t", "b", 1, json!(1)).unwrap();
        assert_eq!(ds.set_policy(1, TypeMap::new()).unwrap(), 1);
        assert!(ds.cache().peek("ns", 1).is_none());
        assert!(ds.store().rows(ds.schema()).unwrap().is_empty());
    }

    #[test]
    fn test_policy_failure_keeps_old_rows() {
        let ds = datastore();
        ds.set_key(1, "t", "b", 1, json!(1)).unwrap();
        ds.store().set_fail_upsert_key(Some(LeafKey::Int(9)));

        let err = ds
            .set_policy(1, policy(&[("t", "b", 9, json!(9))]))
            .unwrap_err();
        assert!(matches!(err, HoardError::Store { operation: Operation::SetPolicy, .. }));
        assert_eq!(ds.store().rows(ds.schema()).unwrap().len(), 1);
        assert_eq!(
            ds.cache().peek("ns", 1).unwrap().leaf("t", "b", &LeafKey::Int(1)),
            Some(&json!(1))
        );
    }

    #[test]
    fn test_rows_target_renders_context() {
        let one = RowsTarget::new(&[Row::new(1, "t", "b", 2, json!(0))]);
        assert_eq!(one.to_string(), "module=1 type=t branch=b key=2");

        let many = RowsTarget::new(&[
            Row::new(2, "t", "b", 1, json!(0)),
            Row::new(1, "t", "b", 1, json!(0)),
        ]);
        assert_eq!(many.to_string(), "rows=2 module=[1, 2]");
    }
}
