//! Read fan-out.
//!
//! Every `get` resolves a list of ids at one level against the handle's
//! local page copies. Ids the page flags cannot vouch for are misses; misses
//! are filled in one store query under the page lock, then every id is read
//! back from the refreshed page.

use hoard_core::{
    BranchMap, CachePage, HoardError, HoardResult, Ids, KeyDepth, KeyMap, LeafKey, LoadQuery,
    Lookup, ModuleId, Operation, TypeMap, ValidationError,
};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use super::Datastore;
use crate::cache::CacheBackend;
use crate::store::BackingStore;

/// A lookup result shaped by the caller's cardinality: a single id yields
/// `Single`, a list yields `Many` keyed by id.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<K: Ord, T> {
    Single(Option<T>),
    Many(BTreeMap<K, Option<T>>),
}

/// The value of a `get` plus whether every requested id resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Read<K: Ord, T> {
    pub value: Fetched<K, T>,
    pub valid: bool,
}

impl<K: Ord, T> Read<K, T> {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The value of a single-id read. `None` for list reads.
    pub fn single(&self) -> Option<&T> {
        match &self.value {
            Fetched::Single(value) => value.as_ref(),
            Fetched::Many(_) => None,
        }
    }

    pub fn into_single(self) -> Option<T> {
        match self.value {
            Fetched::Single(value) => value,
            Fetched::Many(_) => None,
        }
    }

    /// One entry of a list read. `None` for single-id reads.
    pub fn get(&self, id: &K) -> Option<&T> {
        match &self.value {
            Fetched::Single(_) => None,
            Fetched::Many(found) => found.get(id).and_then(Option::as_ref),
        }
    }
}

/// Result of [`Datastore::get`], tagged by the level the lookup targeted.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult {
    Modules(Read<ModuleId, TypeMap>),
    Types(Read<String, BranchMap>),
    Branches(Read<String, KeyMap>),
    Keys(Read<LeafKey, Value>),
}

impl LookupResult {
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Modules(read) => read.valid,
            Self::Types(read) => read.valid,
            Self::Branches(read) => read.valid,
            Self::Keys(read) => read.valid,
        }
    }
}

type Pages = BTreeMap<ModuleId, CachePage>;

impl<C: CacheBackend + ?Sized, S: BackingStore + ?Sized> Datastore<C, S> {
    /// Read at whichever level the lookup targets.
    pub fn get(&self, lookup: &Lookup) -> HoardResult<LookupResult> {
        let depth = lookup.validate()?;
        if depth == KeyDepth::Module {
            return Ok(LookupResult::Modules(self.get_module(lookup.modules.clone())?));
        }

        let module_id = *sole(&lookup.modules, "module_id", "type_id")?;
        Ok(match (&lookup.types, &lookup.branches, &lookup.keys) {
            (Some(types), None, _) => LookupResult::Types(self.get_type(module_id, types.clone())?),
            (Some(types), Some(branches), None) => {
                let type_id = sole(types, "type_id", "branch_id")?;
                LookupResult::Branches(self.get_branch(module_id, type_id, branches.clone())?)
            }
            (Some(types), Some(branches), Some(keys)) => {
                let type_id = sole(types, "type_id", "branch_id")?;
                let branch_id = sole(branches, "branch_id", "key_id")?;
                LookupResult::Keys(self.get_key(module_id, type_id, branch_id, keys.clone())?)
            }
            (None, _, _) => {
                return Err(ValidationError::MissingComponent {
                    component: "type_id",
                }
                .into())
            }
        })
    }

    /// Whole modules. A module answers from the page only once it is
    /// complete; an empty module resolves to `None`.
    pub fn get_module(&self, modules: Ids<ModuleId>) -> HoardResult<Read<ModuleId, TypeMap>> {
        let lookup = Lookup::modules(modules.clone());
        lookup.validate()?;
        let module_ids = super::dedup(modules.iter().copied());
        self.resolve(
            &lookup,
            &module_ids,
            &modules,
            |pages, m| pages.get(m).is_some_and(|p| p.all_cached),
            LoadQuery::modules,
            |pages, m| {
                pages
                    .get(m)
                    .filter(|p| !p.keys.is_empty())
                    .map(|p| p.keys.clone())
            },
        )
    }

    pub fn get_type(
        &self,
        module_id: ModuleId,
        types: Ids<String>,
    ) -> HoardResult<Read<String, BranchMap>> {
        let lookup = Lookup::modules(Ids::One(module_id)).with_types(types.clone());
        lookup.validate()?;
        self.resolve(
            &lookup,
            &[module_id],
            &types,
            |pages, t| pages.get(&module_id).is_some_and(|p| p.is_type_complete(t)),
            |misses| LoadQuery::module(module_id).with_types(misses),
            |pages, t| pages.get(&module_id).and_then(|p| p.type_map(t)).cloned(),
        )
    }

    pub fn get_branch(
        &self,
        module_id: ModuleId,
        type_id: &str,
        branches: Ids<String>,
    ) -> HoardResult<Read<String, KeyMap>> {
        let lookup = Lookup::modules(Ids::One(module_id))
            .with_types(Ids::one(type_id))
            .with_branches(branches.clone());
        lookup.validate()?;
        self.resolve(
            &lookup,
            &[module_id],
            &branches,
            |pages, b| {
                pages
                    .get(&module_id)
                    .is_some_and(|p| p.is_branch_complete(type_id, b))
            },
            |misses| {
                LoadQuery::module(module_id)
                    .with_types(vec![type_id.to_string()])
                    .with_branches(misses)
            },
            |pages, b| {
                pages
                    .get(&module_id)
                    .and_then(|p| p.branch_map(type_id, b))
                    .cloned()
            },
        )
    }

    /// Leaf values. A leaf is a hit when present or when its branch is
    /// complete, in which case an absent leaf is known not to exist.
    pub fn get_key(
        &self,
        module_id: ModuleId,
        type_id: &str,
        branch_id: &str,
        keys: Ids<LeafKey>,
    ) -> HoardResult<Read<LeafKey, Value>> {
        let lookup = Lookup::modules(Ids::One(module_id))
            .with_types(Ids::one(type_id))
            .with_branches(Ids::one(branch_id))
            .with_keys(keys.clone());
        lookup.validate()?;
        self.resolve(
            &lookup,
            &[module_id],
            &keys,
            |pages, k| {
                pages
                    .get(&module_id)
                    .is_some_and(|p| p.knows_leaf(type_id, branch_id, k))
            },
            |misses| {
                LoadQuery::module(module_id)
                    .with_types(vec![type_id.to_string()])
                    .with_branches(vec![branch_id.to_string()])
                    .with_keys(misses)
            },
            |pages, k| {
                pages
                    .get(&module_id)
                    .and_then(|p| p.leaf(type_id, branch_id, k))
                    .cloned()
            },
        )
    }

    /// Answer `ids` from local pages, filling misses first.
    ///
    /// `known` says whether a page can answer for an id, `query` builds the
    /// fill for a list of misses and `extract` reads one id back.
    fn resolve<K, T>(
        &self,
        lookup: &Lookup,
        modules: &[ModuleId],
        ids: &Ids<K>,
        known: impl Fn(&Pages, &K) -> bool,
        query: impl Fn(Vec<K>) -> LoadQuery,
        extract: impl Fn(&Pages, &K) -> Option<T>,
    ) -> HoardResult<Read<K, T>>
    where
        K: Ord + Clone,
    {
        let requested = super::dedup(ids.iter().cloned());
        let mut pages = self.local_pages(Operation::Get, lookup, modules)?;
        let misses: Vec<K> = requested
            .iter()
            .filter(|id| !known(&pages, *id))
            .cloned()
            .collect();
        self.record_lookups(requested.len() - misses.len(), misses.len());
        debug!(
            namespace = %self.namespace(),
            lookup = %lookup,
            hits = requested.len() - misses.len(),
            misses = misses.len(),
            "lookup resolved against local pages"
        );

        if !misses.is_empty() {
            let fill = query(misses.clone());
            let locked = super::dedup(fill.modules.iter().copied());
            let mut lease = self.acquire(Operation::Get, lookup, &locked)?;

            // Another writer may have filled some of these while we waited.
            let remaining: Vec<K> = misses
                .into_iter()
                .filter(|id| !known(lease.pages(), id))
                .collect();
            if !remaining.is_empty() {
                self.fill(Operation::Get, &mut lease, &query(remaining))?;
            }
            let fresh = lease
                .commit()
                .map_err(|e| HoardError::cache_write(Operation::Get, lookup, false, e))?;
            self.remember(fresh.clone());
            pages.extend(fresh);
        }

        let found: BTreeMap<K, Option<T>> = requested
            .into_iter()
            .map(|id| {
                let value = extract(&pages, &id);
                (id, value)
            })
            .collect();
        let valid = found.values().all(Option::is_some);
        let value = match ids {
            Ids::One(_) => Fetched::Single(found.into_values().next().flatten()),
            Ids::Many(_) => Fetched::Many(found),
        };
        Ok(Read { value, valid })
    }
}

fn sole<'a, T>(
    ids: &'a Ids<T>,
    outer: &'static str,
    inner: &'static str,
) -> Result<&'a T, ValidationError> {
    ids.single()
        .ok_or(ValidationError::OuterFanout { outer, inner })
}
