//! Progressive fill.
//!
//! A fill selects rows for a [`LoadQuery`], merges them into the locked page
//! images and promotes authority flags according to which levels the query
//! left open:
//!
//! | query supplies            | promotion                              |
//! |---------------------------|----------------------------------------|
//! | modules                   | `all_cached` on each returned module   |
//! | modules + types           | each requested type cached             |
//! | modules + types + branches| each requested `(type, branch)` cached |
//! | all four levels           | none; leaves only                      |
//!
//! Only modules that appear in the result are touched. An empty result
//! changes nothing.

use hoard_core::{
    nest_rows, CacheError, HoardError, HoardResult, KeyDepth, LoadQuery, ModuleId, Operation, TypeMap,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::Datastore;
use crate::cache::CacheBackend;
use crate::lease::PageLease;
use crate::store::BackingStore;

impl<C: CacheBackend + ?Sized, S: BackingStore + ?Sized> Datastore<C, S> {
    /// Fill pages from the store, reading fresh images under lock.
    ///
    /// Returns the number of rows fetched.
    pub fn load(&self, query: &LoadQuery) -> HoardResult<usize> {
        query.validate()?;
        let modules = super::dedup(query.modules.iter().copied());
        let mut lease = self.acquire(Operation::Load, query, &modules)?;
        let fetched = self.load_held(&mut lease, query)?;
        let pages = lease
            .commit()
            .map_err(|e| HoardError::cache_write(Operation::Load, query, false, e))?;
        self.remember(pages);
        Ok(fetched)
    }

    /// Fill every type of one module and mark it complete.
    pub fn load_module(&self, module_id: ModuleId) -> HoardResult<usize> {
        self.load(&LoadQuery::module(module_id))
    }

    /// Fill into images the caller already holds, without re-reading the
    /// cache. The lease must hold every module in the query. Nothing is
    /// written back; the caller commits the lease.
    pub fn load_held(&self, lease: &mut PageLease<'_, C>, query: &LoadQuery) -> HoardResult<usize> {
        self.fill(Operation::Load, lease, query)
    }

    /// Shared by `load_held` and cache-miss fills; `operation` names the
    /// caller in any error.
    pub(super) fn fill(
        &self,
        operation: Operation,
        lease: &mut PageLease<'_, C>,
        query: &LoadQuery,
    ) -> HoardResult<usize> {
        query.validate()?;
        let unheld: Vec<ModuleId> = query
            .modules
            .iter()
            .copied()
            .filter(|m| !lease.holds(*m))
            .collect();
        if !unheld.is_empty() {
            return Err(HoardError::cache_lock(
                operation,
                query,
                CacheError::LockNotHeld { modules: unheld },
            ));
        }

        let rows = self
            .store
            .select(&self.schema, &query.predicates())
            .map_err(|e| HoardError::store(operation, query, e))?;
        if rows.is_empty() {
            debug!(namespace = %self.namespace(), query = %query, "fill found no rows");
            return Ok(0);
        }

        let fetched = rows.len();
        merge(lease, query, nest_rows(rows));
        self.record_fill(fetched);
        debug!(namespace = %self.namespace(), query = %query, rows = fetched, "fill merged");
        Ok(fetched)
    }
}

/// Merge fetched subtrees into held pages and promote flags.
fn merge<C: CacheBackend + ?Sized>(
    lease: &mut PageLease<'_, C>,
    query: &LoadQuery,
    fetched: BTreeMap<ModuleId, TypeMap>,
) {
    // Deduplicated so a repeated id cannot replace a subtree twice.
    let types: BTreeSet<&str> = query.types.iter().flatten().map(String::as_str).collect();
    let branches: BTreeSet<&str> = query.branches.iter().flatten().map(String::as_str).collect();

    for (module_id, mut data) in fetched {
        let Some(page) = lease.page_mut(module_id) else {
            continue;
        };
        match query.completes() {
            Some(KeyDepth::Module) => page.replace_module(data),
            Some(KeyDepth::Type) => {
                for type_id in &types {
                    page.replace_type(type_id, data.remove(*type_id).unwrap_or_default());
                }
            }
            Some(KeyDepth::Branch) => {
                for type_id in &types {
                    let mut fetched_branches = data.remove(*type_id).unwrap_or_default();
                    for branch_id in &branches {
                        page.replace_branch(
                            type_id,
                            branch_id,
                            fetched_branches.remove(*branch_id).unwrap_or_default(),
                        );
                    }
                }
            }
            Some(KeyDepth::Leaf) | None => {
                for (type_id, branch_map) in data {
                    for (branch_id, keys) in branch_map {
                        for (key_id, value) in keys {
                            page.set_leaf(&type_id, &branch_id, key_id, value);
                        }
                    }
                }
            }
        }
        page.prune();
        debug_assert!(page.validate().is_ok(), "page {} violates invariants", module_id);
    }
}
