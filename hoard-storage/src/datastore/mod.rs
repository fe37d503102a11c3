//! The hierarchical datastore.
//!
//! [`Datastore`] ties a [`CacheBackend`] and a [`BackingStore`] together and
//! keeps them coherent:
//!
//! - `load` fills pages from the store and promotes authority flags.
//! - `get_*` answer from the page when its flags allow, filling only misses.
//! - `set_*` write the store first and patch pages only after commit.
//! - `drop_*` delete rows and prune the matching page entries.
//!
//! Every page mutation happens under a [`PageLease`], so the write-back and
//! the lock release are one step and no exit path leaks a lock.

mod load;
mod prune;
mod read;
mod write;

pub use read::{Fetched, LookupResult, Read};

use hoard_core::{
    CachePage, DatastoreConfig, HoardError, HoardResult, ModuleId, Operation, TableSchema,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::cache::{CacheBackend, CacheStats};
use crate::lease::PageLease;
use crate::store::BackingStore;

/// Default wait for contended page locks.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fills: AtomicU64,
    rows_fetched: AtomicU64,
}

/// Usage statistics for one datastore handle plus its cache backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatastoreStats {
    pub cache: CacheStats,
    /// Requested ids answered from a page without a fill.
    pub lookup_hits: u64,
    /// Requested ids that needed a fill.
    pub lookup_misses: u64,
    /// Fills that returned rows.
    pub fills: u64,
    /// Rows fetched by fills.
    pub rows_fetched: u64,
}

impl DatastoreStats {
    pub fn lookup_hit_rate(&self) -> f64 {
        let total = self.lookup_hits + self.lookup_misses;
        if total == 0 {
            0.0
        } else {
            self.lookup_hits as f64 / total as f64
        }
    }
}

/// A cache-coherent view of one table.
///
/// Cheap to share: wrap it in an `Arc` and call it from any thread. Several
/// handles may share one cache backend and one store; the page locks keep
/// them coherent.
pub struct Datastore<C: CacheBackend + ?Sized, S: BackingStore + ?Sized> {
    cache: Arc<C>,
    store: Arc<S>,
    schema: TableSchema,
    lock_timeout: Duration,
    /// Pages this handle has already read, refreshed after every write.
    local: RwLock<HashMap<ModuleId, CachePage>>,
    counters: Counters,
}

impl<C: CacheBackend + ?Sized, S: BackingStore + ?Sized> Datastore<C, S> {
    pub fn new(cache: Arc<C>, store: Arc<S>, schema: TableSchema) -> Self {
        Self {
            cache,
            store,
            schema,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            local: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Build from a validated config.
    pub fn from_config(cache: Arc<C>, store: Arc<S>, config: &DatastoreConfig) -> HoardResult<Self> {
        config.validate()?;
        Ok(Self::new(cache, store, config.schema()).with_lock_timeout(config.lock_timeout))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn namespace(&self) -> &str {
        &self.schema.namespace
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Lock pages for a caller that wants to run [`load_held`](Self::load_held)
    /// or other work against fresh images. Finish with
    /// [`commit_lease`](Self::commit_lease).
    pub fn lease(&self, modules: &[ModuleId]) -> HoardResult<PageLease<'_, C>> {
        let target = ModuleList(modules);
        self.acquire(Operation::Load, &target, modules)
    }

    /// Write back (or just unlock) a lease and refresh the local copies.
    pub fn commit_lease(&self, lease: PageLease<'_, C>) -> HoardResult<()> {
        let target = ModuleList(&lease.modules()).to_string();
        let pages = lease
            .commit()
            .map_err(|e| HoardError::cache_write(Operation::Load, &target, false, e))?;
        self.remember(pages);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop one module's cached page everywhere.
    pub fn flush_module(&self, module_id: ModuleId) -> HoardResult<bool> {
        self.forget(&[module_id]);
        let flushed = self
            .cache
            .flush_pages(self.namespace(), &[module_id])
            .map_err(|e| {
                HoardError::cache_write(Operation::Flush, format!("module={}", module_id), false, e)
            })?;
        Ok(flushed > 0)
    }

    /// Drop every cached page in this datastore's namespace.
    pub fn flush_all(&self) -> HoardResult<u64> {
        self.forget_local();
        self.cache.flush_all(self.namespace()).map_err(|e| {
            HoardError::cache_write(
                Operation::Flush,
                format!("namespace={}", self.namespace()),
                false,
                e,
            )
        })
    }

    /// Discard this handle's local copies; the next read goes to the cache.
    pub fn forget_local(&self) {
        if let Ok(mut local) = self.local.write() {
            local.clear();
        }
    }

    pub fn stats(&self) -> HoardResult<DatastoreStats> {
        let cache = self.cache.stats().map_err(|e| {
            HoardError::cache_read(
                Operation::Get,
                format!("namespace={}", self.namespace()),
                e,
            )
        })?;
        Ok(DatastoreStats {
            cache,
            lookup_hits: self.counters.hits.load(Ordering::Relaxed),
            lookup_misses: self.counters.misses.load(Ordering::Relaxed),
            fills: self.counters.fills.load(Ordering::Relaxed),
            rows_fetched: self.counters.rows_fetched.load(Ordering::Relaxed),
        })
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    fn acquire(
        &self,
        operation: Operation,
        target: &dyn fmt::Display,
        modules: &[ModuleId],
    ) -> HoardResult<PageLease<'_, C>> {
        PageLease::acquire(&*self.cache, self.namespace(), modules, self.lock_timeout)
            .map_err(|e| HoardError::cache_lock(operation, target, e))
    }

    /// Local copies for `modules`, reading absent ones from the cache.
    fn local_pages(
        &self,
        operation: Operation,
        target: &dyn fmt::Display,
        modules: &[ModuleId],
    ) -> HoardResult<BTreeMap<ModuleId, CachePage>> {
        let mut pages = BTreeMap::new();
        let mut absent = Vec::new();
        if let Ok(local) = self.local.read() {
            for module_id in modules {
                match local.get(module_id) {
                    Some(page) => {
                        pages.insert(*module_id, page.clone());
                    }
                    None => absent.push(*module_id),
                }
            }
        } else {
            absent.extend_from_slice(modules);
        }

        if !absent.is_empty() {
            let fetched = self
                .cache
                .read_pages(self.namespace(), &absent)
                .map_err(|e| HoardError::cache_read(operation, target, e))?;
            debug!(namespace = %self.namespace(), modules = ?absent, "pages read from cache");
            self.remember(fetched.clone());
            pages.extend(fetched);
        }
        Ok(pages)
    }

    fn remember(&self, pages: BTreeMap<ModuleId, CachePage>) {
        if let Ok(mut local) = self.local.write() {
            local.extend(pages);
        }
    }

    fn forget(&self, modules: &[ModuleId]) {
        if let Ok(mut local) = self.local.write() {
            for module_id in modules {
                local.remove(module_id);
            }
        }
    }

    fn record_lookups(&self, hits: usize, misses: usize) {
        self.counters.hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.counters
            .misses
            .fetch_add(misses as u64, Ordering::Relaxed);
    }

    fn record_fill(&self, rows: usize) {
        self.counters.fills.fetch_add(1, Ordering::Relaxed);
        self.counters
            .rows_fetched
            .fetch_add(rows as u64, Ordering::Relaxed);
    }
}

/// Renders a module set as error context.
struct ModuleList<'a>(&'a [ModuleId]);

impl fmt::Display for ModuleList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module={:?}", self.0)
    }
}

fn dedup<T: Ord + Clone>(ids: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut ids: Vec<T> = ids.into_iter().collect();
    ids.sort();
    ids.dedup();
    ids
}
