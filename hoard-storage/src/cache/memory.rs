//! In-process cache backend.

use hoard_core::{CacheError, CachePage, ModuleId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use super::lock_table::{HeldLock, LockTable};
use super::page_key::PageKey;
use super::traits::{CacheBackend, CacheStats, LockToken, LockedPages};

/// Cache backend holding pages in a shared map.
///
/// Share one instance (behind an `Arc`) between datastore handles to get
/// the cross-handle coherence a networked cache would provide.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    pages: RwLock<HashMap<PageKey, CachePage>>,
    locks: LockTable,
    stats: RwLock<CacheStats>,
    fail_writes: AtomicBool,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `write_pages` fail. The locks stay held, as
    /// for any failed write.
    /// Used to exercise post-commit failure handling.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stored page, if any, without touching statistics.
    pub fn peek(&self, namespace: &str, module_id: ModuleId) -> Option<CachePage> {
        self.pages
            .read()
            .ok()?
            .get(&PageKey::new(namespace, module_id))
            .cloned()
    }

    /// Currently held page locks.
    pub fn held_locks(&self) -> Result<Vec<HeldLock>, CacheError> {
        self.locks.held()
    }

    fn load(&self, namespace: &str, modules: &[ModuleId]) -> Result<BTreeMap<ModuleId, CachePage>, CacheError> {
        let pages = self.pages.read().map_err(|_| CacheError::Poisoned)?;
        let mut out = BTreeMap::new();
        let (mut hits, mut misses) = (0, 0);
        for module_id in modules {
            match pages.get(&PageKey::new(namespace, *module_id)) {
                Some(page) => {
                    hits += 1;
                    out.insert(*module_id, page.clone());
                }
                None => {
                    misses += 1;
                    out.insert(*module_id, CachePage::default());
                }
            }
        }
        drop(pages);
        if let Ok(mut stats) = self.stats.write() {
            stats.hits += hits;
            stats.misses += misses;
        }
        Ok(out)
    }

    fn record_evictions(&self, count: u64) {
        if let Ok(mut stats) = self.stats.write() {
            stats.evictions += count;
        }
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn lock_pages(
        &self,
        namespace: &str,
        modules: &[ModuleId],
        timeout: Duration,
    ) -> Result<LockedPages, CacheError> {
        let token = self.locks.acquire(namespace, modules, timeout)?;
        match self.load(namespace, modules) {
            Ok(pages) => Ok(LockedPages { token, pages }),
            Err(e) => {
                self.locks.release(namespace, &token, modules)?;
                Err(e)
            }
        }
    }

    fn read_pages(
        &self,
        namespace: &str,
        modules: &[ModuleId],
    ) -> Result<BTreeMap<ModuleId, CachePage>, CacheError> {
        self.load(namespace, modules)
    }

    fn write_pages(
        &self,
        namespace: &str,
        token: &LockToken,
        pages: &BTreeMap<ModuleId, CachePage>,
    ) -> Result<(), CacheError> {
        let modules: Vec<ModuleId> = pages.keys().copied().collect();
        self.locks.check(namespace, token, &modules)?;

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("write rejected".to_string()));
        }

        {
            let mut stored = self.pages.write().map_err(|_| CacheError::Poisoned)?;
            for (module_id, page) in pages {
                let key = PageKey::new(namespace, *module_id);
                if page.is_empty() {
                    stored.remove(&key);
                } else {
                    stored.insert(key, page.clone());
                }
            }
        }
        self.locks.release(namespace, token, &modules)
    }

    fn unlock_pages(
        &self,
        namespace: &str,
        token: &LockToken,
        modules: &[ModuleId],
    ) -> Result<(), CacheError> {
        self.locks.release(namespace, token, modules)
    }

    fn flush_pages(&self, namespace: &str, modules: &[ModuleId]) -> Result<u64, CacheError> {
        let mut stored = self.pages.write().map_err(|_| CacheError::Poisoned)?;
        let removed = modules
            .iter()
            .filter(|m| stored.remove(&PageKey::new(namespace, **m)).is_some())
            .count() as u64;
        drop(stored);
        self.record_evictions(removed);
        Ok(removed)
    }

    fn flush_all(&self, namespace: &str) -> Result<u64, CacheError> {
        let mut stored = self.pages.write().map_err(|_| CacheError::Poisoned)?;
        let before = stored.len();
        stored.retain(|key, _| key.namespace() != namespace);
        let removed = (before - stored.len()) as u64;
        drop(stored);
        self.record_evictions(removed);
        Ok(removed)
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let pages = self.pages.read().map_err(|_| CacheError::Poisoned)?;
        let memory_bytes = pages
            .values()
            .map(|page| serde_json::to_vec(page).map(|b| b.len() as u64).unwrap_or(0))
            .sum();
        let mut stats = self.stats.read().map_err(|_| CacheError::Poisoned)?.clone();
        stats.entry_count = pages.len() as u64;
        stats.memory_bytes = memory_bytes;
        Ok(stats)
    }
}
