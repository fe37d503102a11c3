//! In-process exclusive page locks.
//!
//! Acquisition is all-or-nothing: a caller either gets every requested page
//! or waits without holding any, so two multi-page writers can never
//! deadlock on lock order.
//!
//! ```text
//! (free) ─── acquire() ──→ held(token) ─── release(token) ──→ (free)
//!                               │
//!                          check(token) ↺
//! ```

use chrono::{DateTime, Utc};
use hoard_core::{CacheError, ModuleId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::page_key::PageKey;
use super::traits::LockToken;

/// Who holds a page lock and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
}

/// Snapshot entry returned by [`LockTable::held`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub key: PageKey,
    pub record: LockRecord,
}

#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashMap<PageKey, LockRecord>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every page lock in `modules`, waiting up to `timeout`.
    pub fn acquire(
        &self,
        namespace: &str,
        modules: &[ModuleId],
        timeout: Duration,
    ) -> Result<LockToken, CacheError> {
        let keys = page_keys(namespace, modules);
        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = self.held.lock().map_err(|_| CacheError::Poisoned)?;

        loop {
            if keys.iter().all(|k| !held.contains_key(k)) {
                let record = LockRecord {
                    token: LockToken::new(),
                    acquired_at: Utc::now(),
                };
                let token = record.token;
                for key in keys {
                    held.insert(key, record.clone());
                }
                return Ok(token);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CacheError::LockTimeout {
                    modules: sorted_modules(modules),
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .map_err(|_| CacheError::Poisoned)?;
            held = guard;
        }
    }

    /// Verify that `token` holds every listed page.
    pub fn check(
        &self,
        namespace: &str,
        token: &LockToken,
        modules: &[ModuleId],
    ) -> Result<(), CacheError> {
        let held = self.held.lock().map_err(|_| CacheError::Poisoned)?;
        owned_by(&held, namespace, token, modules)
    }

    /// Release the listed pages. Nothing is released unless `token` holds
    /// all of them.
    pub fn release(
        &self,
        namespace: &str,
        token: &LockToken,
        modules: &[ModuleId],
    ) -> Result<(), CacheError> {
        let mut held = self.held.lock().map_err(|_| CacheError::Poisoned)?;
        owned_by(&held, namespace, token, modules)?;
        for key in page_keys(namespace, modules) {
            held.remove(&key);
        }
        drop(held);
        self.released.notify_all();
        Ok(())
    }

    /// Currently held locks, oldest first.
    pub fn held(&self) -> Result<Vec<HeldLock>, CacheError> {
        let held = self.held.lock().map_err(|_| CacheError::Poisoned)?;
        let mut locks: Vec<HeldLock> = held
            .iter()
            .map(|(key, record)| HeldLock {
                key: key.clone(),
                record: record.clone(),
            })
            .collect();
        locks.sort_by(|a, b| {
            (a.record.acquired_at, &a.key).cmp(&(b.record.acquired_at, &b.key))
        });
        Ok(locks)
    }
}

fn page_keys(namespace: &str, modules: &[ModuleId]) -> BTreeSet<PageKey> {
    modules.iter().map(|m| PageKey::new(namespace, *m)).collect()
}

fn sorted_modules(modules: &[ModuleId]) -> Vec<ModuleId> {
    let set: BTreeSet<ModuleId> = modules.iter().copied().collect();
    set.into_iter().collect()
}

fn owned_by(
    held: &HashMap<PageKey, LockRecord>,
    namespace: &str,
    token: &LockToken,
    modules: &[ModuleId],
) -> Result<(), CacheError> {
    let foreign: BTreeSet<ModuleId> = modules
        .iter()
        .copied()
        .filter(|m| {
            held.get(&PageKey::new(namespace, *m))
                .map_or(true, |record| record.token != *token)
        })
        .collect();
    if foreign.is_empty() {
        Ok(())
    } else {
        Err(CacheError::LockNotHeld {
            modules: foreign.into_iter().collect(),
        })
    }
}
