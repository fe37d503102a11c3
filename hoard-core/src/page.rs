//! The per-module cache page and its authority flags.
//!
//! A page mirrors a subset of one module's rows. Presence in `keys` says a
//! leaf is known; the flags say when *absence* is authoritative as well:
//!
//! - `all_cached`: every row of the module is present.
//! - `type_cached`: every row of the listed types is present.
//! - `branch_cached`: every row of the listed `(type, branch)` pairs is present.
//!
//! Flags are kept minimal. A type flag is never stored beside `all_cached`,
//! and a branch flag is never stored under a complete type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::key::LeafKey;

/// `key_id → value`
pub type KeyMap = BTreeMap<LeafKey, Value>;
/// `branch_id → key_id → value`
pub type BranchMap = BTreeMap<String, KeyMap>;
/// `type_id → branch_id → key_id → value`
pub type TypeMap = BTreeMap<String, BranchMap>;

/// Structural invariant broken by a page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PageViolation {
    #[error("type flag {type_id} stored beside all_cached")]
    TypeFlagUnderAllCached { type_id: String },

    #[error("branch flags stored beside all_cached")]
    BranchFlagUnderAllCached,

    #[error("branch flags stored under complete type {type_id}")]
    BranchFlagUnderCachedType { type_id: String },

    #[error("empty branch flag set for type {type_id}")]
    EmptyBranchFlagSet { type_id: String },

    #[error("empty type map {type_id}")]
    EmptyTypeMap { type_id: String },

    #[error("empty branch map {type_id}/{branch_id}")]
    EmptyBranchMap { type_id: String, branch_id: String },
}

/// Cached view of one module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachePage {
    #[serde(default)]
    pub keys: TypeMap,
    #[serde(default)]
    pub all_cached: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub type_cached: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branch_cached: BTreeMap<String, BTreeSet<String>>,
}

impl CachePage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A page holding a module's complete contents.
    pub fn complete(keys: TypeMap) -> Self {
        Self {
            keys,
            all_cached: true,
            ..Self::default()
        }
    }

    /// True when the page carries neither data nor flags.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
            && !self.all_cached
            && self.type_cached.is_empty()
            && self.branch_cached.is_empty()
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn type_map(&self, type_id: &str) -> Option<&BranchMap> {
        self.keys.get(type_id)
    }

    pub fn branch_map(&self, type_id: &str, branch_id: &str) -> Option<&KeyMap> {
        self.keys.get(type_id)?.get(branch_id)
    }

    pub fn leaf(&self, type_id: &str, branch_id: &str, key_id: &LeafKey) -> Option<&Value> {
        self.branch_map(type_id, branch_id)?.get(key_id)
    }

    pub fn is_type_complete(&self, type_id: &str) -> bool {
        self.all_cached || self.type_cached.contains(type_id)
    }

    pub fn is_branch_complete(&self, type_id: &str, branch_id: &str) -> bool {
        self.is_type_complete(type_id)
            || self
                .branch_cached
                .get(type_id)
                .is_some_and(|branches| branches.contains(branch_id))
    }

    /// Whether the page can answer for this leaf without a fill: either the
    /// leaf is present or its branch is complete.
    pub fn knows_leaf(&self, type_id: &str, branch_id: &str, key_id: &LeafKey) -> bool {
        self.is_branch_complete(type_id, branch_id) || self.leaf(type_id, branch_id, key_id).is_some()
    }

    // ------------------------------------------------------------------
    // Flag promotion
    // ------------------------------------------------------------------

    /// Mark the module complete. Finer flags become redundant and are cleared.
    pub fn mark_all_cached(&mut self) {
        self.all_cached = true;
        self.type_cached.clear();
        self.branch_cached.clear();
    }

    /// Mark a type complete, absorbing its branch flags.
    pub fn mark_type_cached(&mut self, type_id: &str) {
        if self.all_cached {
            return;
        }
        self.type_cached.insert(type_id.to_string());
        self.branch_cached.remove(type_id);
    }

    /// Mark a branch complete unless its type already is.
    pub fn mark_branch_cached(&mut self, type_id: &str, branch_id: &str) {
        if self.is_type_complete(type_id) {
            return;
        }
        self.branch_cached
            .entry(type_id.to_string())
            .or_default()
            .insert(branch_id.to_string());
    }

    // ------------------------------------------------------------------
    // Data mutation
    // ------------------------------------------------------------------

    pub fn set_leaf(&mut self, type_id: &str, branch_id: &str, key_id: LeafKey, value: Value) {
        self.keys
            .entry(type_id.to_string())
            .or_default()
            .entry(branch_id.to_string())
            .or_default()
            .insert(key_id, value);
    }

    /// Replace the whole module subtree with store contents and mark it
    /// complete.
    pub fn replace_module(&mut self, keys: TypeMap) {
        self.keys = keys;
        self.mark_all_cached();
    }

    /// Replace one type subtree and mark it complete. An empty `branches`
    /// records the type as known-empty.
    pub fn replace_type(&mut self, type_id: &str, branches: BranchMap) {
        if branches.is_empty() {
            self.keys.remove(type_id);
        } else {
            self.keys.insert(type_id.to_string(), branches);
        }
        self.mark_type_cached(type_id);
    }

    /// Replace one branch and mark it complete.
    pub fn replace_branch(&mut self, type_id: &str, branch_id: &str, keys: KeyMap) {
        if keys.is_empty() {
            if let Some(branches) = self.keys.get_mut(type_id) {
                branches.remove(branch_id);
            }
            self.prune();
        } else {
            self.keys
                .entry(type_id.to_string())
                .or_default()
                .insert(branch_id.to_string(), keys);
        }
        self.mark_branch_cached(type_id, branch_id);
    }

    /// Remove one leaf. Flags stay: the branch is still fully known, just
    /// one entry smaller.
    pub fn remove_leaf(&mut self, type_id: &str, branch_id: &str, key_id: &LeafKey) -> bool {
        let removed = self
            .keys
            .get_mut(type_id)
            .and_then(|branches| branches.get_mut(branch_id))
            .and_then(|keys| keys.remove(key_id))
            .is_some();
        if removed {
            self.prune();
        }
        removed
    }

    /// Remove a branch and its flag. When the type has no branches left the
    /// type flag goes too.
    pub fn remove_branch(&mut self, type_id: &str, branch_id: &str) {
        if let Some(branches) = self.keys.get_mut(type_id) {
            branches.remove(branch_id);
        }
        if let Some(flags) = self.branch_cached.get_mut(type_id) {
            flags.remove(branch_id);
        }
        self.prune();
        if !self.keys.contains_key(type_id) {
            self.type_cached.remove(type_id);
            self.branch_cached.remove(type_id);
        }
    }

    /// Remove a type with all of its flags.
    pub fn remove_type(&mut self, type_id: &str) {
        self.keys.remove(type_id);
        self.type_cached.remove(type_id);
        self.branch_cached.remove(type_id);
    }

    /// Drop empty branch maps, empty type maps and empty flag sets.
    pub fn prune(&mut self) {
        for branches in self.keys.values_mut() {
            branches.retain(|_, keys| !keys.is_empty());
        }
        self.keys.retain(|_, branches| !branches.is_empty());
        self.branch_cached.retain(|_, flags| !flags.is_empty());
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<(), PageViolation> {
        if self.all_cached {
            if let Some(type_id) = self.type_cached.iter().next() {
                return Err(PageViolation::TypeFlagUnderAllCached {
                    type_id: type_id.clone(),
                });
            }
            if !self.branch_cached.is_empty() {
                return Err(PageViolation::BranchFlagUnderAllCached);
            }
        }
        for (type_id, flags) in &self.branch_cached {
            if flags.is_empty() {
                return Err(PageViolation::EmptyBranchFlagSet {
                    type_id: type_id.clone(),
                });
            }
            if self.type_cached.contains(type_id) {
                return Err(PageViolation::BranchFlagUnderCachedType {
                    type_id: type_id.clone(),
                });
            }
        }
        for (type_id, branches) in &self.keys {
            if branches.is_empty() {
                return Err(PageViolation::EmptyTypeMap {
                    type_id: type_id.clone(),
                });
            }
            for (branch_id, keys) in branches {
                if keys.is_empty() {
                    return Err(PageViolation::EmptyBranchMap {
                        type_id: type_id.clone(),
                        branch_id: branch_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of leaves held.
    pub fn leaf_count(&self) -> usize {
        self.keys
            .values()
            .flat_map(|branches| branches.values())
            .map(|keys| keys.len())
            .sum()
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Step {
        Set(String, String, i64),
        RemoveLeaf(String, String, i64),
        RemoveBranch(String, String),
        RemoveType(String),
        MarkAll,
        MarkType(String),
        MarkBranch(String, String),
    }

    fn name() -> impl Strategy<Value = String> {
        prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("c".to_string())]
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (name(), name(), 0i64..4).prop_map(|(t, b, k)| Step::Set(t, b, k)),
            (name(), name(), 0i64..4).prop_map(|(t, b, k)| Step::RemoveLeaf(t, b, k)),
            (name(), name()).prop_map(|(t, b)| Step::RemoveBranch(t, b)),
            name().prop_map(Step::RemoveType),
            Just(Step::MarkAll),
            name().prop_map(Step::MarkType),
            (name(), name()).prop_map(|(t, b)| Step::MarkBranch(t, b)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]

        /// Any sequence of page operations leaves the invariants intact.
        #[test]
        fn prop_operations_preserve_invariants(steps in prop::collection::vec(step(), 0..40)) {
            let mut page = CachePage::new();
            for s in steps {
                match s {
                    Step::Set(t, b, k) => page.set_leaf(&t, &b, LeafKey::Int(k), Value::from(k)),
                    Step::RemoveLeaf(t, b, k) => {
                        page.remove_leaf(&t, &b, &LeafKey::Int(k));
                    }
                    Step::RemoveBranch(t, b) => page.remove_branch(&t, &b),
                    Step::RemoveType(t) => page.remove_type(&t),
                    Step::MarkAll => page.mark_all_cached(),
                    Step::MarkType(t) => page.mark_type_cached(&t),
                    Step::MarkBranch(t, b) => page.mark_branch_cached(&t, &b),
                }
                prop_assert!(page.validate().is_ok(), "violated: {:?}", page.validate());
            }
        }

        /// Pages survive serialisation unchanged.
        #[test]
        fn prop_json_round_trip(steps in prop::collection::vec(step(), 0..20)) {
            let mut page = CachePage::new();
            for s in steps {
                if let Step::Set(t, b, k) = s {
                    page.set_leaf(&t, &b, LeafKey::Int(k), Value::from(k));
                } else if let Step::MarkBranch(t, b) = s {
                    page.mark_branch_cached(&t, &b);
                }
            }
            let bytes = serde_json::to_vec(&page).unwrap();
            let back: CachePage = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(back, page);
        }
    }
}
