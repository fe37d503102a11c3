//! Scoped page locks.
//!
//! A [`PageLease`] owns a set of locked page images. The locks are released
//! exactly once: by [`PageLease::commit`] (write-back when the images were
//! touched, plain unlock otherwise), by [`PageLease::release`], or by `Drop`
//! on any early return or unwind.
//!
//! A failed write-back flushes the held pages before unlocking, so no other
//! lease can read the pre-write image and store it again.

use hoard_core::{CacheError, CachePage, ModuleId};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::cache::{CacheBackend, LockToken};

pub struct PageLease<'a, C: CacheBackend + ?Sized> {
    backend: &'a C,
    namespace: String,
    token: LockToken,
    pages: BTreeMap<ModuleId, CachePage>,
    dirty: bool,
    released: bool,
}

impl<'a, C: CacheBackend + ?Sized> PageLease<'a, C> {
    /// Lock and read every page in `modules`.
    pub fn acquire(
        backend: &'a C,
        namespace: &str,
        modules: &[ModuleId],
        timeout: Duration,
    ) -> Result<Self, CacheError> {
        let locked = backend.lock_pages(namespace, modules, timeout)?;
        debug!(
            namespace,
            modules = ?modules,
            token = %locked.token,
            "page lease acquired"
        );
        Ok(Self {
            backend,
            namespace: namespace.to_string(),
            token: locked.token,
            pages: locked.pages,
            dirty: false,
            released: false,
        })
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    pub fn modules(&self) -> Vec<ModuleId> {
        self.pages.keys().copied().collect()
    }

    pub fn holds(&self, module_id: ModuleId) -> bool {
        self.pages.contains_key(&module_id)
    }

    pub fn page(&self, module_id: ModuleId) -> Option<&CachePage> {
        self.pages.get(&module_id)
    }

    pub fn pages(&self) -> &BTreeMap<ModuleId, CachePage> {
        &self.pages
    }

    /// Mutable access to a held page. Marks the lease for write-back.
    pub fn page_mut(&mut self, module_id: ModuleId) -> Option<&mut CachePage> {
        let page = self.pages.get_mut(&module_id)?;
        self.dirty = true;
        Some(page)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the images back if any were touched, otherwise just unlock.
    /// Returns the final images. When the write fails the pages are flushed
    /// under the still-held locks and then unlocked.
    pub fn commit(mut self) -> Result<BTreeMap<ModuleId, CachePage>, CacheError> {
        self.released = true;
        let pages = std::mem::take(&mut self.pages);
        if self.dirty {
            match self.backend.write_pages(&self.namespace, &self.token, &pages) {
                Ok(()) => {
                    debug!(namespace = %self.namespace, token = %self.token, "page lease written back");
                    Ok(pages)
                }
                Err(e) => {
                    let modules: Vec<ModuleId> = pages.keys().copied().collect();
                    self.discard_locked(&modules);
                    Err(e)
                }
            }
        } else {
            let modules: Vec<ModuleId> = pages.keys().copied().collect();
            self.backend
                .unlock_pages(&self.namespace, &self.token, &modules)?;
            debug!(namespace = %self.namespace, token = %self.token, "page lease released unchanged");
            Ok(pages)
        }
    }

    /// Flush pages whose write-back failed, then unlock them. Failures here
    /// are logged; the caller already reports the write error.
    fn discard_locked(&self, modules: &[ModuleId]) {
        if let Err(flush) = self.backend.flush_pages(&self.namespace, modules) {
            error!(
                namespace = %self.namespace,
                modules = ?modules,
                token = %self.token,
                error = %flush,
                "could not flush pages after failed write-back"
            );
        }
        if let Err(unlock) = self
            .backend
            .unlock_pages(&self.namespace, &self.token, modules)
        {
            warn!(
                namespace = %self.namespace,
                token = %self.token,
                error = %unlock,
                "unlock after failed write-back"
            );
        }
    }

    /// Unlock without writing, discarding any changes.
    pub fn release(mut self) -> Result<(), CacheError> {
        self.released = true;
        let modules = self.modules();
        self.backend
            .unlock_pages(&self.namespace, &self.token, &modules)
    }
}

impl<C: CacheBackend + ?Sized> Drop for PageLease<'_, C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let modules = self.modules();
        if let Err(e) = self
            .backend
            .unlock_pages(&self.namespace, &self.token, &modules)
        {
            warn!(
                namespace = %self.namespace,
                modules = ?modules,
                token = %self.token,
                error = %e,
                "failed to release page locks on abandoned lease"
            );
        }
    }
}
