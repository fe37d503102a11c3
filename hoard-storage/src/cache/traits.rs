//! Cache backend trait and lock tokens.
//!
//! A backend stores one [`CachePage`] per `(namespace, module_id)` and
//! mediates exclusive page locks. Implementations must be thread-safe; the
//! datastore calls them from many threads at once.

use hoard_core::{CacheError, CachePage, ModuleId};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Proof of holding a set of page locks.
///
/// Tokens are UUIDv7 so lock diagnostics sort by acquisition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pages returned by a successful lock-and-read.
#[derive(Debug, Clone)]
pub struct LockedPages {
    pub token: LockToken,
    /// One entry per requested module; absent pages are empty skeletons.
    pub pages: BTreeMap<ModuleId, CachePage>,
}

/// Cache backend trait for pluggable page stores.
///
/// # Locking
///
/// `lock_pages` acquires every requested page lock or none of them.
/// `write_pages` persists images and releases the locks on the written
/// modules as its last effect. A failed write leaves the locks held, so the
/// caller can discard the pages before anyone else reads them.
/// `unlock_pages` releases without writing. Both reject a token that does
/// not hold the locks.
///
/// # Serialization
///
/// Implementations choose how pages are encoded at rest.
pub trait CacheBackend: Send + Sync {
    /// Lock and read pages, waiting at most `timeout` for contended locks.
    fn lock_pages(
        &self,
        namespace: &str,
        modules: &[ModuleId],
        timeout: Duration,
    ) -> Result<LockedPages, CacheError>;

    /// Read pages without locking. Absent pages are empty skeletons.
    fn read_pages(
        &self,
        namespace: &str,
        modules: &[ModuleId],
    ) -> Result<BTreeMap<ModuleId, CachePage>, CacheError>;

    /// Persist images and release their locks. On error the locks stay held.
    fn write_pages(
        &self,
        namespace: &str,
        token: &LockToken,
        pages: &BTreeMap<ModuleId, CachePage>,
    ) -> Result<(), CacheError>;

    /// Release locks without writing.
    fn unlock_pages(
        &self,
        namespace: &str,
        token: &LockToken,
        modules: &[ModuleId],
    ) -> Result<(), CacheError>;

    /// Unconditionally drop cached pages. Returns how many existed.
    fn flush_pages(&self, namespace: &str, modules: &[ModuleId]) -> Result<u64, CacheError>;

    /// Unconditionally drop every page in a namespace.
    fn flush_all(&self, namespace: &str) -> Result<u64, CacheError>;

    /// Get cache statistics.
    fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Page reads that found a stored page.
    pub hits: u64,
    /// Page reads that found nothing.
    pub misses: u64,
    /// Number of pages currently stored.
    pub entry_count: u64,
    /// Approximate encoded size of stored pages in bytes.
    pub memory_bytes: u64,
    /// Pages removed by flushes.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_lock_tokens_are_unique() {
        assert_ne!(LockToken::new(), LockToken::new());
    }
}
