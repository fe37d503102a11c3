//! Page cache backends.
//!
//! A cache backend stores one [`CachePage`](hoard_core::CachePage) per
//! module inside a namespace and owns the exclusive page locks that
//! serialise writers. Two backends are bundled:
//!
//! - [`MemoryCacheBackend`]: a shared in-process map.
//! - [`LmdbCacheBackend`]: pages persisted in LMDB via heed.
//!
//! Both key pages with [`PageKey`], which cannot be built without a
//! namespace, and both lock through a [`LockTable`].

pub mod lmdb_backend;
pub mod lock_table;
pub mod memory;
pub mod page_key;
pub mod traits;

pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use lock_table::{HeldLock, LockRecord, LockTable};
pub use memory::MemoryCacheBackend;
pub use page_key::PageKey;
pub use traits::{CacheBackend, CacheStats, LockToken, LockedPages};
