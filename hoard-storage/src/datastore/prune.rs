//! Prune-on-delete.
//!
//! Scoped drops delete rows under one module's lock and remove the matching
//! subtree from its page. Drops across all modules cannot patch pages one by
//! one, so they flush the whole namespace instead. They lock every module
//! that holds a matching row for the delete and the flush, so a writer that
//! read one of those pages earlier cannot store it back afterwards.

use hoard_core::{
    CacheKey, CachePage, Column, HoardError, HoardResult, LeafKey, ModuleId, Operation, Predicate,
    SiteKey,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

use super::Datastore;
use crate::cache::CacheBackend;
use crate::store::BackingStore;

impl<C: CacheBackend + ?Sized, S: BackingStore + ?Sized> Datastore<C, S> {
    /// Delete one leaf. Returns whether a row existed.
    pub fn drop_key(
        &self,
        module_id: ModuleId,
        type_id: &str,
        branch_id: &str,
        key_id: impl Into<LeafKey>,
    ) -> HoardResult<bool> {
        let key = CacheKey::leaf(module_id, type_id, branch_id, key_id)?;
        let deleted = self.drop_scoped(Operation::DropKey, &key, |page| {
            if let (Some(t), Some(b), Some(k)) = (key.type_id(), key.branch_id(), key.key_id()) {
                page.remove_leaf(t, b, k);
            }
        })?;
        Ok(deleted > 0)
    }

    pub fn drop_branch(&self, module_id: ModuleId, type_id: &str, branch_id: &str) -> HoardResult<u64> {
        let key = CacheKey::branch(module_id, type_id, branch_id)?;
        self.drop_scoped(Operation::DropBranch, &key, |page| {
            page.remove_branch(type_id, branch_id);
        })
    }

    pub fn drop_type(&self, module_id: ModuleId, type_id: &str) -> HoardResult<u64> {
        let key = CacheKey::of_type(module_id, type_id)?;
        self.drop_scoped(Operation::DropType, &key, |page| page.remove_type(type_id))
    }

    /// Delete every row of a module. The page is removed with them.
    pub fn drop_module(&self, module_id: ModuleId) -> HoardResult<u64> {
        let key = CacheKey::module(module_id);
        self.drop_scoped(Operation::DropModule, &key, |page| {
            *page = CachePage::default();
        })
    }

    /// Delete one leaf in every module.
    pub fn drop_site_key(
        &self,
        type_id: &str,
        branch_id: &str,
        key_id: impl Into<LeafKey>,
    ) -> HoardResult<u64> {
        let key = SiteKey::new(type_id, Some(branch_id.to_string()), Some(key_id.into()))?;
        self.drop_site(Operation::DropSiteKey, &key)
    }

    pub fn drop_site_branch(&self, type_id: &str, branch_id: &str) -> HoardResult<u64> {
        let key = SiteKey::new(type_id, Some(branch_id.to_string()), None)?;
        self.drop_site(Operation::DropSiteBranch, &key)
    }

    pub fn drop_site_type(&self, type_id: &str) -> HoardResult<u64> {
        let key = SiteKey::new(type_id, None, None)?;
        self.drop_site(Operation::DropSiteType, &key)
    }

    /// Delete every row in the table and flush the namespace.
    ///
    /// Modules holding rows are locked first. A module whose first row lands
    /// after that is not locked, and its page may outlive the flush.
    pub fn drop_all(&self) -> HoardResult<u64> {
        let operation = Operation::DropAll;
        let target = format!("table={}", self.schema.table);
        let modules = self.modules_matching(operation, &target, &[])?;
        if modules.is_empty() {
            return Ok(0);
        }
        let lease = self.acquire(operation, &target, &modules)?;
        let deleted = self
            .store
            .truncate(&self.schema)
            .map_err(|e| HoardError::store(operation, &target, e))?;
        if deleted > 0 {
            self.flush_namespace(operation, &target)?;
        }
        lease
            .release()
            .map_err(|e| HoardError::cache_lock(operation, &target, e))?;
        Ok(deleted)
    }

    /// Delete under `key` with its module locked and prune the page.
    ///
    /// When nothing was deleted the page is left exactly as it was.
    fn drop_scoped(
        &self,
        operation: Operation,
        key: &CacheKey,
        prune: impl FnOnce(&mut CachePage),
    ) -> HoardResult<u64> {
        let module_id = key.module_id();
        let mut lease = self.acquire(operation, key, &[module_id])?;
        let deleted = self
            .store
            .delete(&self.schema, &key.predicates())
            .map_err(|e| HoardError::store(operation, key, e))?;

        if deleted > 0 {
            if let Some(page) = lease.page_mut(module_id) {
                prune(page);
                page.prune();
            }
        }
        self.write_back(operation, key, lease)?;
        debug!(namespace = %self.namespace(), key = %key, rows = deleted, "rows dropped");
        Ok(deleted)
    }

    /// Delete `key` in every module that holds it, with those modules locked.
    ///
    /// Only rows in the locked modules are deleted. A matching row written
    /// to another module after the modules were chosen survives the drop.
    fn drop_site(&self, operation: Operation, key: &SiteKey) -> HoardResult<u64> {
        let mut predicates = key.predicates();
        let modules = self.modules_matching(operation, key, &predicates)?;
        if modules.is_empty() {
            debug!(namespace = %self.namespace(), key = %key, "no site rows to drop");
            return Ok(0);
        }

        let lease = self.acquire(operation, key, &modules)?;
        predicates.push(Predicate::matching(
            Column::ModuleId,
            modules.iter().map(|m| Value::from(*m)).collect(),
        ));
        let deleted = self
            .store
            .delete(&self.schema, &predicates)
            .map_err(|e| HoardError::store(operation, key, e))?;
        if deleted > 0 {
            self.flush_namespace(operation, key)?;
        }
        lease
            .release()
            .map_err(|e| HoardError::cache_lock(operation, key, e))?;
        debug!(namespace = %self.namespace(), key = %key, rows = deleted, "site rows dropped");
        Ok(deleted)
    }

    /// Distinct modules with rows matching `predicates`, ascending.
    fn modules_matching(
        &self,
        operation: Operation,
        target: &dyn fmt::Display,
        predicates: &[Predicate],
    ) -> HoardResult<Vec<ModuleId>> {
        let rows = self
            .store
            .select(&self.schema, predicates)
            .map_err(|e| HoardError::store(operation, target, e))?;
        let modules: BTreeSet<ModuleId> = rows.iter().map(|row| row.module_id).collect();
        Ok(modules.into_iter().collect())
    }

    // Pages of modules outside the caller's lease are flushed without their
    // locks. Those pages hold none of the deleted rows.
    fn flush_namespace(&self, operation: Operation, target: &dyn fmt::Display) -> HoardResult<()> {
        self.forget_local();
        let flushed = self
            .cache
            .flush_all(self.namespace())
            .map_err(|e| HoardError::cache_write(operation, target, true, e))?;
        debug!(namespace = %self.namespace(), pages = flushed, "namespace flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::store::MemoryStore;
    use hoard_core::{Ids, Row, StoreError, TableSchema, ValidationError};
    use crate::lease::PageLease;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    type Ds = Datastore<MemoryCacheBackend, MemoryStore>;

    fn seeded() -> Ds {
        let schema = TableSchema::standard("rows", "ns");
        let ds = Datastore::new(
            Arc::new(MemoryCacheBackend::new()),
            Arc::new(MemoryStore::with_table(&schema)),
            schema,
        );
        ds.set_key_multi(vec![
            Row::new(1, "t", "a", 1, json!("t-a-1")),
            Row::new(1, "t", "a", 2, json!("t-a-2")),
            Row::new(1, "t", "b", 1, json!("t-b-1")),
            Row::new(1, "u", "a", 1, json!("u-a-1")),
            Row::new(2, "t", "a", 1, json!("2-t-a-1")),
        ])
        .unwrap();
        ds
    }

    fn page(ds: &Ds, m: ModuleId) -> CachePage {
        ds.cache().peek("ns", m).unwrap_or_default()
    }

    #[test]
    fn test_drop_key_example_scenario() {
        let ds = seeded();
        ds.set_key(1, "profile", "settings", 42, json!("dark_mode")).unwrap();
        assert!(ds.drop_key(1, "profile", "settings", 42).unwrap());
        let read = ds.get_key(1, "profile", "settings", Ids::one(42)).unwrap();
        assert!(!read.valid);
        assert_eq!(read.into_single(), None);
        assert!(page(&ds, 1).type_map("profile").is_none());
    }

    #[test]
    fn test_drop_missing_target_leaves_page_identical() {
        let ds = seeded();
        let before = serde_json::to_vec(&page(&ds, 1)).unwrap();
        assert!(!ds.drop_key(1, "t", "a", 99).unwrap());
        assert_eq!(ds.drop_branch(1, "t", "zz").unwrap(), 0);
        assert_eq!(ds.drop_type(1, "zz").unwrap(), 0);
        assert_eq!(serde_json::to_vec(&page(&ds, 1)).unwrap(), before);
        assert!(ds.cache().held_locks().unwrap().is_empty());
    }

    #[test]
    fn test_drop_last_branch_prunes_type() {
        let ds = seeded();
        ds.load(&hoard_core::LoadQuery::module(1).with_types(vec!["u".into()]))
            .unwrap();
        assert!(page(&ds, 1).type_cached.contains("u"));

        assert_eq!(ds.drop_branch(1, "u", "a").unwrap(), 1);
        let p = page(&ds, 1);
        assert!(p.type_map("u").is_none());
        assert!(!p.type_cached.contains("u"));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_drop_last_key_keeps_branch_flag() {
        let ds = seeded();
        ds.get_branch(1, "t", Ids::one("b")).unwrap();
        assert!(ds.drop_key(1, "t", "b", 1).unwrap());

        let p = page(&ds, 1);
        assert!(p.branch_map("t", "b").is_none());
        assert!(p.is_branch_complete("t", "b"));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_drop_type_and_module() {
        let ds = seeded();
        assert_eq!(ds.drop_type(1, "t").unwrap(), 3);
        assert_eq!(page(&ds, 1).leaf_count(), 1);

        assert_eq!(ds.drop_module(1).unwrap(), 1);
        assert!(ds.cache().peek("ns", 1).is_none());
        assert_eq!(page(&ds, 2).leaf_count(), 1);
    }

    #[test]
    fn test_store_failure_keeps_page_and_releases_lock() {
        let ds = seeded();
        let before = page(&ds, 1);
        ds.store().set_fail_deletes(true);

        let err = ds.drop_type(1, "t").unwrap_err();
        assert!(matches!(
            err,
            HoardError::Store {
                operation: Operation::DropType,
                source: StoreError::WriteFailed { .. },
                ..
            }
        ));
        assert_eq!(page(&ds, 1), before);
        assert!(ds.cache().held_locks().unwrap().is_empty());
    }

    #[test]
    fn test_site_drops_flush_namespace() {
        let ds = seeded();
        assert_eq!(ds.drop_site_key("t", "a", 1).unwrap(), 2);
        assert!(ds.cache().peek("ns", 1).is_none());
        assert!(ds.cache().peek("ns", 2).is_none());

        let read = ds.get_key(1, "t", "a", Ids::many([1, 2])).unwrap();
        assert!(!read.valid);
        assert!(read.get(&LeafKey::Int(2)).is_some());
    }

    #[test]
    fn test_site_drop_waits_for_writer_holding_page() {
        let ds = seeded();
        ds.load_module(1).unwrap();

        // A writer that read module 1 before the drop still has the leaf in
        // its image and writes that image back.
        let mut lease =
            PageLease::acquire(&**ds.cache(), "ns", &[1], Duration::from_millis(50)).unwrap();
        lease
            .page_mut(1)
            .unwrap()
            .set_leaf("t", "a", LeafKey::Int(1), json!("t-a-1"));

        thread::scope(|s| {
            let dropper = s.spawn(|| ds.drop_site_key("t", "a", 1));
            thread::sleep(Duration::from_millis(20));
            lease.commit().unwrap();
            assert_eq!(dropper.join().unwrap().unwrap(), 2);
        });

        assert_eq!(page(&ds, 1).leaf("t", "a", &LeafKey::Int(1)), None);
        assert!(ds.cache().held_locks().unwrap().is_empty());
        let read = ds.get_key(1, "t", "a", Ids::one(1)).unwrap();
        assert!(!read.valid);
    }

    #[test]
    fn test_site_drop_without_rows_keeps_cache() {
        let ds = seeded();
        assert_eq!(ds.drop_site_type("missing").unwrap(), 0);
        assert_eq!(ds.drop_site_branch("t", "missing").unwrap(), 0);
        assert!(ds.cache().peek("ns", 1).is_some());
    }

    #[test]
    fn test_drop_all_truncates() {
        let ds = seeded();
        assert_eq!(ds.drop_all().unwrap(), 5);
        assert!(ds.cache().peek("ns", 1).is_none());
        assert_eq!(ds.drop_all().unwrap(), 0);
    }

    #[test]
    fn test_drop_validates_components() {
        let ds = seeded();
        assert!(matches!(
            ds.drop_branch(1, "t", ""),
            Err(HoardError::Validation(ValidationError::EmptyComponent { .. }))
        ));
        assert!(matches!(
            ds.drop_site_type(""),
            Err(HoardError::Validation(ValidationError::EmptyComponent { .. }))
        ));
    }
}
