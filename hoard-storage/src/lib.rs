//! HOARD Storage - Cache Backends, Backing Stores and the Datastore
//!
//! Defines the cache and store abstractions and the [`Datastore`] that keeps
//! them coherent. The bundled backends are an in-memory cache, an LMDB cache
//! and an in-memory store.

pub mod cache;
pub mod datastore;
pub mod lease;
pub mod store;

// Re-export cache types
pub use cache::{
    CacheBackend, CacheStats, HeldLock, LmdbCacheBackend, LmdbCacheError, LockRecord, LockTable,
    LockToken, LockedPages, MemoryCacheBackend, PageKey,
};

pub use datastore::{Datastore, DatastoreStats, Fetched, LookupResult, Read, DEFAULT_LOCK_TIMEOUT};
pub use lease::PageLease;
pub use store::{BackingStore, MemoryStore, StoreTransaction};
