//! Concurrent handles on one cache and store.
//!
//! Page locks serialise read-modify-write on a page, so writers racing on
//! the same module must never lose each other's leaves.

use hoard_core::{nest_rows, CacheError, CachePage, HoardError, Ids, LeafKey, ModuleId, Row};
use hoard_storage::{
    CacheBackend, CacheStats, Datastore, LockToken, LockedPages, MemoryCacheBackend, MemoryStore,
};
use hoard_test_utils::{assertions, fixtures, init_tracing};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use fixtures::NAMESPACE;

const THREADS: i64 = 4;
const WRITES: i64 = 25;

#[test]
fn test_racing_writers_lose_no_leaves() {
    init_tracing();
    let ds = fixtures::memory_datastore();
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let handle = fixtures::second_handle(&ds);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..WRITES {
                    let module_id = i % 3 + 1;
                    handle
                        .set_key(module_id, "acl", "read", t * 100 + i, json!(t))
                        .expect("write");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("writer thread");
    }

    let stored = nest_rows(ds.store().rows(ds.schema()).unwrap());
    assert_eq!(stored.values().map(|types| types["acl"]["read"].len()).sum::<usize>(), 100);
    for (module_id, types) in stored {
        let page = ds.cache().peek(NAMESPACE, module_id).expect("page");
        assertions::assert_page_invariants(&page);
        assert_eq!(page.keys, types, "module {} page lost writes", module_id);
    }
    assertions::assert_no_locks(ds.cache().held_locks());
}

#[test]
fn test_shared_handle_across_threads() {
    let ds = Arc::new(fixtures::seeded_datastore(&fixtures::sample_rows()));

    let readers: Vec<_> = (0..THREADS)
        .map(|_| {
            let ds = Arc::clone(&ds);
            thread::spawn(move || {
                for _ in 0..10 {
                    let read = ds.get_key(1, "acl", "read", Ids::one(10)).expect("read");
                    assert_eq!(read.into_single(), Some(json!(true)));
                    let read = ds.get_module(Ids::one(2)).expect("module read");
                    assert!(read.valid);
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().expect("reader thread");
    }

    // Later readers find what earlier ones filled.
    let selects = ds.store().select_count();
    assert!(selects <= 2 * THREADS as usize, "too many fills: {}", selects);
    assertions::assert_no_locks(ds.cache().held_locks());
}

#[test]
fn test_writer_waits_for_held_lease() {
    let ds = fixtures::memory_datastore();
    let writer = fixtures::second_handle(&ds);
    let done = Arc::new(AtomicBool::new(false));

    let lease = ds.lease(&[1]).unwrap();
    let flag = Arc::clone(&done);
    let worker = thread::spawn(move || {
        writer.set_key(1, "t", "b", 1, json!("after")).expect("write");
        flag.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst));
    assert!(ds.store().rows(ds.schema()).unwrap().is_empty());

    lease.release().unwrap();
    worker.join().expect("writer thread");
    assert!(done.load(Ordering::SeqCst));
    let page = ds.cache().peek(NAMESPACE, 1).expect("page");
    assert_eq!(page.leaf("t", "b", &LeafKey::Int(1)), Some(&json!("after")));
}

#[test]
fn test_fill_and_write_race_keeps_page_coherent() {
    init_tracing();
    let rows: Vec<Row> = (0..20)
        .map(|k| Row::new(1, "nav", "menu", k, json!(k)))
        .collect();
    let ds = fixtures::seeded_datastore(&rows);
    let barrier = Arc::new(Barrier::new(2));

    let loader = {
        let handle = fixtures::second_handle(&ds);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..10 {
                handle.forget_local();
                handle.get_branch(1, "nav", Ids::one("menu")).expect("fill");
            }
        })
    };
    let writer = {
        let handle = fixtures::second_handle(&ds);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for k in 20..40 {
                handle.set_key(1, "nav", "menu", k, json!(k)).expect("write");
            }
        })
    };
    loader.join().expect("loader thread");
    writer.join().expect("writer thread");

    let stored = nest_rows(ds.store().rows(ds.schema()).unwrap());
    let page = ds.cache().peek(NAMESPACE, 1).expect("page");
    assertions::assert_page_invariants(&page);
    assert_eq!(page.branch_map("nav", "menu").map(|keys| keys.len()), Some(40));
    assert_eq!(page.keys, stored[&1]);
}

// ============================================================================
// FAILED WRITE-BACK
// ============================================================================

/// Memory cache with a second writer that takes the page lock at the first
/// moment it is free, keeps the image it read, and writes that image back
/// once the test lets it finish.
struct IntrudingCache {
    inner: MemoryCacheBackend,
    armed: AtomicBool,
    grabbed: Mutex<Option<LockedPages>>,
}

impl IntrudingCache {
    fn new() -> Self {
        Self {
            inner: MemoryCacheBackend::new(),
            armed: AtomicBool::new(false),
            grabbed: Mutex::new(None),
        }
    }

    fn try_intrude(&self, namespace: &str, modules: &[ModuleId]) {
        if !self.armed.load(Ordering::SeqCst) {
            return;
        }
        let mut grabbed = self.grabbed.lock().unwrap();
        if grabbed.is_none() {
            if let Ok(locked) = self
                .inner
                .lock_pages(namespace, modules, Duration::from_millis(1))
            {
                *grabbed = Some(locked);
            }
        }
    }

    fn finish(&self, namespace: &str) {
        self.armed.store(false, Ordering::SeqCst);
        self.inner.set_fail_writes(false);
        let locked = self
            .grabbed
            .lock()
            .unwrap()
            .take()
            .expect("second writer never got the lock");
        self.inner
            .write_pages(namespace, &locked.token, &locked.pages)
            .unwrap();
    }
}

impl CacheBackend for IntrudingCache {
    fn lock_pages(
        &self,
        namespace: &str,
        modules: &[ModuleId],
        timeout: Duration,
    ) -> Result<LockedPages, CacheError> {
        self.inner.lock_pages(namespace, modules, timeout)
    }

    fn read_pages(
        &self,
        namespace: &str,
        modules: &[ModuleId],
    ) -> Result<BTreeMap<ModuleId, CachePage>, CacheError> {
        self.inner.read_pages(namespace, modules)
    }

    fn write_pages(
        &self,
        namespace: &str,
        token: &LockToken,
        pages: &BTreeMap<ModuleId, CachePage>,
    ) -> Result<(), CacheError> {
        let written = self.inner.write_pages(namespace, token, pages);
        if written.is_err() {
            let modules: Vec<ModuleId> = pages.keys().copied().collect();
            self.try_intrude(namespace, &modules);
        }
        written
    }

    fn unlock_pages(
        &self,
        namespace: &str,
        token: &LockToken,
        modules: &[ModuleId],
    ) -> Result<(), CacheError> {
        let unlocked = self.inner.unlock_pages(namespace, token, modules);
        self.try_intrude(namespace, modules);
        unlocked
    }

    fn flush_pages(&self, namespace: &str, modules: &[ModuleId]) -> Result<u64, CacheError> {
        self.try_intrude(namespace, modules);
        self.inner.flush_pages(namespace, modules)
    }

    fn flush_all(&self, namespace: &str) -> Result<u64, CacheError> {
        self.inner.flush_all(namespace)
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        self.inner.stats()
    }
}

#[test]
fn test_failed_write_back_leaves_no_stale_page_for_next_writer() {
    init_tracing();
    let cache = Arc::new(IntrudingCache::new());
    let store = Arc::new(MemoryStore::with_table(&fixtures::schema()));
    let ds = Datastore::new(Arc::clone(&cache), store, fixtures::schema());

    ds.set_key(1, "acl", "read", 1, json!("old")).unwrap();
    ds.load_module(1).unwrap();
    assert!(cache.inner.peek(NAMESPACE, 1).unwrap().all_cached);

    cache.inner.set_fail_writes(true);
    cache.armed.store(true, Ordering::SeqCst);
    let err = ds.set_key(1, "acl", "read", 1, json!("new")).unwrap_err();
    assert!(matches!(err, HoardError::CacheWrite { committed: true, .. }));

    // The second writer only got in after the flush, so what it stores back
    // holds nothing of the pre-write image.
    cache.finish(NAMESPACE);
    let page = cache.inner.peek(NAMESPACE, 1).unwrap_or_default();
    assert!(!page.all_cached);
    assert_eq!(page.leaf("acl", "read", &LeafKey::Int(1)), None);
    assertions::assert_no_locks(cache.inner.held_locks());

    ds.forget_local();
    let read = ds.get_key(1, "acl", "read", Ids::one(1)).unwrap();
    assert_eq!(read.into_single(), Some(json!("new")));
}
