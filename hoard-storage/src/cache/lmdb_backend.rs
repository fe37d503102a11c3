//! LMDB-backed cache implementation with namespace isolation.
//!
//! Uses the heed crate (Rust bindings for LMDB) to keep page images in a
//! memory-mapped key-value store that survives process restarts.
//!
//! # Namespace Isolation
//!
//! All pages are stored under a [`PageKey`], so a namespace flush only
//! deletes keys carrying that namespace's prefix.
//!
//! # Locking
//!
//! Page locks live in an in-process [`LockTable`]; every datastore handle
//! that shares this backend shares its locks. LMDB itself serialises the
//! write transactions.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use hoard_core::{CacheError, CachePage, DatastoreConfig, ModuleId};

use super::lock_table::{HeldLock, LockTable};
use super::page_key::PageKey;
use super::traits::{CacheBackend, CacheStats, LockToken, LockedPages};

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The config names no LMDB directory.
    #[error("No LMDB path configured")]
    NotConfigured,
}

/// Convert LmdbCacheError to CacheError.
impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::Serialization(msg) => CacheError::Serialization(msg),
            LmdbCacheError::Deserialization(msg) => CacheError::Deserialization(msg),
            other => CacheError::Backend(other.to_string()),
        }
    }
}

/// LMDB-backed page cache.
///
/// # Example
///
/// ```ignore
/// use hoard_storage::cache::LmdbCacheBackend;
///
/// let backend = Arc::new(LmdbCacheBackend::new("/var/lib/hoard", 256)?);
/// let datastore = Datastore::new(backend, store, TableSchema::standard("rows", "acl"));
/// ```
pub struct LmdbCacheBackend {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Page locks shared by every handle on this backend.
    locks: LockTable,
    /// Global statistics.
    stats: RwLock<CacheStats>,
}

impl LmdbCacheBackend {
    /// Create a new LMDB cache backend.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        // Ensure directory exists
        std::fs::create_dir_all(&path)?;

        // Open LMDB environment
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        // Open the default database
        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            locks: LockTable::new(),
            stats: RwLock::new(CacheStats::default()),
        })
    }

    /// Open the environment named by `config.lmdb_path`.
    pub fn from_config(config: &DatastoreConfig) -> Result<Self, LmdbCacheError> {
        let path = config
            .lmdb_path
            .as_ref()
            .ok_or(LmdbCacheError::NotConfigured)?;
        Self::new(path, config.lmdb_map_size_mb)
    }

    /// Currently held page locks.
    pub fn held_locks(&self) -> Result<Vec<HeldLock>, CacheError> {
        self.locks.held()
    }

    fn load(
        &self,
        namespace: &str,
        modules: &[ModuleId],
    ) -> Result<BTreeMap<ModuleId, CachePage>, LmdbCacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut pages = BTreeMap::new();
        let (mut hits, mut misses) = (0, 0);
        for module_id in modules {
            let key = PageKey::new(namespace, *module_id).encode();
            let stored = self
                .db
                .get(&rtxn, &key)
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            let page = match stored {
                Some(bytes) => {
                    hits += 1;
                    serde_json::from_slice(bytes)
                        .map_err(|e| LmdbCacheError::Deserialization(e.to_string()))?
                }
                None => {
                    misses += 1;
                    CachePage::default()
                }
            };
            pages.insert(*module_id, page);
        }

        if let Ok(mut stats) = self.stats.write() {
            stats.hits += hits;
            stats.misses += misses;
        }
        Ok(pages)
    }

    fn store(
        &self,
        namespace: &str,
        pages: &BTreeMap<ModuleId, CachePage>,
    ) -> Result<(), LmdbCacheError> {
        let mut encoded = Vec::with_capacity(pages.len());
        for (module_id, page) in pages {
            let key = PageKey::new(namespace, *module_id).encode();
            let value = if page.is_empty() {
                None
            } else {
                Some(
                    serde_json::to_vec(page)
                        .map_err(|e| LmdbCacheError::Serialization(e.to_string()))?,
                )
            };
            encoded.push((key, value));
        }

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        for (key, value) in &encoded {
            match value {
                Some(bytes) => self.db.put(&mut wtxn, key, bytes),
                None => self.db.delete(&mut wtxn, key).map(|_| ()),
            }
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        }

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))
    }

    fn delete_keys(&self, keys: &[Vec<u8>]) -> Result<u64, LmdbCacheError> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut deleted = 0u64;
        for key in keys {
            if self
                .db
                .delete(&mut wtxn, key)
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            {
                deleted += 1;
            }
        }

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        if let Ok(mut stats) = self.stats.write() {
            stats.evictions += deleted;
        }
        Ok(deleted)
    }

    /// Iterate over keys matching a prefix and collect them.
    fn collect_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, LmdbCacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut keys = Vec::new();
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        for result in iter {
            let (key, _) = result.map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            if key.starts_with(prefix) {
                keys.push(key.to_vec());
            }
        }

        Ok(keys)
    }
}

impl CacheBackend for LmdbCacheBackend {
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
                Err(e.into())
            }
        }
    }

    fn read_pages(
        &self,
        namespace: &str,
        modules: &[ModuleId],
    ) -> Result<BTreeMap<ModuleId, CachePage>, CacheError> {
        Ok(self.load(namespace, modules)?)
    }

    fn write_pages(
        &self,
        namespace: &str,
        token: &LockToken,
        pages: &BTreeMap<ModuleId, CachePage>,
    ) -> Result<(), CacheError> {
        let modules: Vec<ModuleId> = pages.keys().copied().collect();
        self.locks.check(namespace, token, &modules)?;
        self.store(namespace, pages)?;
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
        let keys: Vec<Vec<u8>> = modules
            .iter()
            .map(|m| PageKey::new(namespace, *m).encode())
            .collect();
        Ok(self.delete_keys(&keys)?)
    }

    fn flush_all(&self, namespace: &str) -> Result<u64, CacheError> {
        let prefix = PageKey::namespace_prefix(namespace);
        let keys = self.collect_keys_with_prefix(&prefix)?;
        Ok(self.delete_keys(&keys)?)
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut entry_count = 0u64;
        let mut memory_bytes = 0u64;
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
        for result in iter {
            let (key, value) = result.map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            entry_count += 1;
            memory_bytes += (key.len() + value.len()) as u64;
        }

        let mut stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.entry_count = entry_count;
        stats.memory_bytes = memory_bytes;
        Ok(stats)
    }
}
