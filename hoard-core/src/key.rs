//! Hierarchical addressing: module → type → branch → leaf key.
//!
//! A [`CacheKey`] names a single node of the tree. [`Lookup`] and
//! [`LoadQuery`] name sets of nodes and are what the read and fill paths
//! consume.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use crate::error::ValidationError;
use crate::row::{Column, Predicate};

/// Top-level partition of the tree, and the unit of page locking.
pub type ModuleId = i64;

// ============================================================================
// LEAF KEY
// ============================================================================

/// Scalar leaf key.
///
/// Canonical decimal strings address the same leaf as the integer they
/// spell: `Str("42")` and `Int(42)` compare, order and hash as equal, and
/// serialise identically. This also keeps integer keys intact when a page is
/// round-tripped through a JSON object, where map keys are strings.
#[derive(Debug, Clone)]
pub enum LeafKey {
    Int(i64),
    Str(String),
}

/// Borrowed canonical form backing equality, ordering and hashing.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Canonical<'a> {
    Int(i64),
    Str(&'a str),
}

fn canonical_int(s: &str) -> Option<i64> {
    s.parse::<i64>().ok().filter(|n| n.to_string() == s)
}

impl LeafKey {
    /// Build a key from text, normalising canonical integers.
    pub fn parse(s: &str) -> Self {
        match canonical_int(s) {
            Some(n) => LeafKey::Int(n),
            None => LeafKey::Str(s.to_string()),
        }
    }

    /// The same key with canonical integer strings turned into `Int`.
    pub fn normalized(self) -> Self {
        match self {
            LeafKey::Str(s) => match canonical_int(&s) {
                Some(n) => LeafKey::Int(n),
                None => LeafKey::Str(s),
            },
            key => key,
        }
    }

    fn canonical(&self) -> Canonical<'_> {
        match self {
            LeafKey::Int(n) => Canonical::Int(*n),
            LeafKey::Str(s) => match canonical_int(s) {
                Some(n) => Canonical::Int(n),
                None => Canonical::Str(s),
            },
        }
    }

    /// True for the empty string key, which is never a valid address.
    pub fn is_empty(&self) -> bool {
        matches!(self, LeafKey::Str(s) if s.is_empty())
    }

    /// Column value used in predicates and rows.
    pub fn to_value(&self) -> Value {
        match self.canonical() {
            Canonical::Int(n) => Value::from(n),
            Canonical::Str(s) => Value::String(s.to_string()),
        }
    }

    /// Inverse of [`LeafKey::to_value`]; `None` for non-scalar values.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(LeafKey::Int),
            Value::String(s) => Some(LeafKey::parse(s)),
            _ => None,
        }
    }
}

impl PartialEq for LeafKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for LeafKey {}

impl PartialOrd for LeafKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LeafKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical().cmp(&other.canonical())
    }
}

impl std::hash::Hash for LeafKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for LeafKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeafKey::Int(n) => write!(f, "{}", n),
            LeafKey::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for LeafKey {
    fn from(n: i64) -> Self {
        LeafKey::Int(n)
    }
}

impl From<i32> for LeafKey {
    fn from(n: i32) -> Self {
        LeafKey::Int(n as i64)
    }
}

impl From<u32> for LeafKey {
    fn from(n: u32) -> Self {
        LeafKey::Int(n as i64)
    }
}

impl From<&str> for LeafKey {
    fn from(s: &str) -> Self {
        LeafKey::parse(s)
    }
}

impl From<String> for LeafKey {
    fn from(s: String) -> Self {
        LeafKey::parse(&s)
    }
}

impl Serialize for LeafKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.canonical() {
            Canonical::Int(n) => serializer.serialize_i64(n),
            Canonical::Str(s) => serializer.serialize_str(s),
        }
    }
}

struct LeafKeyVisitor;

impl<'de> Visitor<'de> for LeafKeyVisitor {
    type Value = LeafKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an integer or string leaf key")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<LeafKey, E> {
        Ok(LeafKey::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<LeafKey, E> {
        i64::try_from(v)
            .map(LeafKey::Int)
            .map_err(|_| E::custom(format!("leaf key {} out of range", v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<LeafKey, E> {
        Ok(LeafKey::parse(v))
    }
}

impl<'de> Deserialize<'de> for LeafKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(LeafKeyVisitor)
    }
}

// ============================================================================
// CACHE KEY
// ============================================================================

/// How deep into the tree a key or request reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyDepth {
    Module,
    Type,
    Branch,
    Leaf,
}

/// A partial 4-level key. Trailing components may be absent; a component is
/// never present while its parent is missing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    module_id: ModuleId,
    type_id: Option<String>,
    branch_id: Option<String>,
    key_id: Option<LeafKey>,
}

impl CacheKey {
    /// Build a key from optional components, rejecting skipped levels and
    /// empty components.
    pub fn new(
        module_id: ModuleId,
        type_id: Option<String>,
        branch_id: Option<String>,
        key_id: Option<LeafKey>,
    ) -> Result<Self, ValidationError> {
        if branch_id.is_some() && type_id.is_none() {
            return Err(ValidationError::SkippedLevel {
                component: "branch_id",
                parent: "type_id",
            });
        }
        if key_id.is_some() && branch_id.is_none() {
            return Err(ValidationError::SkippedLevel {
                component: "key_id",
                parent: "branch_id",
            });
        }
        if let Some(t) = &type_id {
            require_text("type_id", t)?;
        }
        if let Some(b) = &branch_id {
            require_text("branch_id", b)?;
        }
        if let Some(k) = &key_id {
            require_key(k)?;
        }
        Ok(Self {
            module_id,
            type_id,
            branch_id,
            key_id: key_id.map(LeafKey::normalized),
        })
    }

    /// Assemble without validation; used for rendering error context.
    pub(crate) fn from_parts(
        module_id: ModuleId,
        type_id: Option<String>,
        branch_id: Option<String>,
        key_id: Option<LeafKey>,
    ) -> Self {
        Self {
            module_id,
            type_id,
            branch_id,
            key_id,
        }
    }

    pub fn module(module_id: ModuleId) -> Self {
        Self {
            module_id,
            type_id: None,
            branch_id: None,
            key_id: None,
        }
    }

    pub fn of_type(module_id: ModuleId, type_id: &str) -> Result<Self, ValidationError> {
        Self::new(module_id, Some(type_id.to_string()), None, None)
    }

    pub fn branch(
        module_id: ModuleId,
        type_id: &str,
        branch_id: &str,
    ) -> Result<Self, ValidationError> {
        Self::new(
            module_id,
            Some(type_id.to_string()),
            Some(branch_id.to_string()),
            None,
        )
    }

    pub fn leaf(
        module_id: ModuleId,
        type_id: &str,
        branch_id: &str,
        key_id: impl Into<LeafKey>,
    ) -> Result<Self, ValidationError> {
        Self::new(
            module_id,
            Some(type_id.to_string()),
            Some(branch_id.to_string()),
            Some(key_id.into()),
        )
    }

    /// Chain the next level: `CacheKey::module(1).with_type("t")?.with_branch("b")?`.
    pub fn with_type(self, type_id: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(self.module_id, Some(type_id.into()), self.branch_id, self.key_id)
    }

    pub fn with_branch(self, branch_id: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(self.module_id, self.type_id, Some(branch_id.into()), self.key_id)
    }

    pub fn with_key(self, key_id: impl Into<LeafKey>) -> Result<Self, ValidationError> {
        Self::new(self.module_id, self.type_id, self.branch_id, Some(key_id.into()))
    }

    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    pub fn type_id(&self) -> Option<&str> {
        self.type_id.as_deref()
    }

    pub fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }

    pub fn key_id(&self) -> Option<&LeafKey> {
        self.key_id.as_ref()
    }

    pub fn depth(&self) -> KeyDepth {
        match (&self.type_id, &self.branch_id, &self.key_id) {
            (None, _, _) => KeyDepth::Module,
            (Some(_), None, _) => KeyDepth::Type,
            (Some(_), Some(_), None) => KeyDepth::Branch,
            (Some(_), Some(_), Some(_)) => KeyDepth::Leaf,
        }
    }

    /// Predicates selecting every row under this key.
    pub fn predicates(&self) -> Vec<Predicate> {
        let mut predicates = vec![Predicate::eq(Column::ModuleId, Value::from(self.module_id))];
        if let Some(t) = &self.type_id {
            predicates.push(Predicate::eq(Column::TypeId, Value::String(t.clone())));
        }
        if let Some(b) = &self.branch_id {
            predicates.push(Predicate::eq(Column::BranchId, Value::String(b.clone())));
        }
        if let Some(k) = &self.key_id {
            predicates.push(Predicate::eq(Column::KeyId, k.to_value()));
        }
        predicates
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module={}", self.module_id)?;
        if let Some(t) = &self.type_id {
            write!(f, " type={}", t)?;
        }
        if let Some(b) = &self.branch_id {
            write!(f, " branch={}", b)?;
        }
        if let Some(k) = &self.key_id {
            write!(f, " key={}", k)?;
        }
        Ok(())
    }
}

pub(crate) fn require_text(component: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        Err(ValidationError::EmptyComponent { component })
    } else {
        Ok(())
    }
}

pub(crate) fn require_key(key: &LeafKey) -> Result<(), ValidationError> {
    if key.is_empty() {
        Err(ValidationError::EmptyComponent {
            component: "key_id",
        })
    } else {
        Ok(())
    }
}

// ============================================================================
// SITE KEYS
// ============================================================================

/// A key below the module level that matches across every module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SiteKey {
    type_id: String,
    branch_id: Option<String>,
    key_id: Option<LeafKey>,
}

impl SiteKey {
    pub fn new(
        type_id: impl Into<String>,
        branch_id: Option<String>,
        key_id: Option<LeafKey>,
    ) -> Result<Self, ValidationError> {
        let type_id = type_id.into();
        if key_id.is_some() && branch_id.is_none() {
            return Err(ValidationError::SkippedLevel {
                component: "key_id",
                parent: "branch_id",
            });
        }
        require_text("type_id", &type_id)?;
        if let Some(b) = &branch_id {
            require_text("branch_id", b)?;
        }
        if let Some(k) = &key_id {
            require_key(k)?;
        }
        Ok(Self {
            type_id,
            branch_id,
            key_id: key_id.map(LeafKey::normalized),
        })
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }

    pub fn key_id(&self) -> Option<&LeafKey> {
        self.key_id.as_ref()
    }

    pub fn predicates(&self) -> Vec<Predicate> {
        let mut predicates = vec![Predicate::eq(
            Column::TypeId,
            Value::String(self.type_id.clone()),
        )];
        if let Some(b) = &self.branch_id {
            predicates.push(Predicate::eq(Column::BranchId, Value::String(b.clone())));
        }
        if let Some(k) = &self.key_id {
            predicates.push(Predicate::eq(Column::KeyId, k.to_value()));
        }
        predicates
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module=* type={}", self.type_id)?;
        if let Some(b) = &self.branch_id {
            write!(f, " branch={}", b)?;
        }
        if let Some(k) = &self.key_id {
            write!(f, " key={}", k)?;
        }
        Ok(())
    }
}

// ============================================================================
// ID SETS
// ============================================================================

/// One id or a list of ids at a single level, remembering which the caller
/// supplied so results can be shaped to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ids<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Ids<T> {
    pub fn one(id: impl Into<T>) -> Self {
        Ids::One(id.into())
    }

    pub fn many<I, V>(ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<T>,
    {
        Ids::Many(ids.into_iter().map(Into::into).collect())
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Ids::One(_))
    }

    /// More than one id, i.e. a fan-out at this level.
    pub fn is_fanout(&self) -> bool {
        matches!(self, Ids::Many(ids) if ids.len() > 1)
    }

    pub fn len(&self) -> usize {
        match self {
            Ids::One(_) => 1,
            Ids::Many(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            Ids::One(id) => std::slice::from_ref(id).iter(),
            Ids::Many(ids) => ids.iter(),
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Ids::One(id) => vec![id],
            Ids::Many(ids) => ids,
        }
    }

    /// The single id when exactly one was supplied, in either form.
    pub fn single(&self) -> Option<&T> {
        match self {
            Ids::One(id) => Some(id),
            Ids::Many(ids) if ids.len() == 1 => ids.first(),
            Ids::Many(_) => None,
        }
    }
}

impl<T> From<Vec<T>> for Ids<T> {
    fn from(ids: Vec<T>) -> Self {
        Ids::Many(ids)
    }
}

impl<T: fmt::Display> fmt::Display for Ids<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ids::One(id) => write!(f, "{}", id),
            Ids::Many(ids) => {
                f.write_str("[")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", id)?;
                }
                f.write_str("]")
            }
        }
    }
}

// ============================================================================
// LOOKUP (read requests)
// ============================================================================

/// A read request. Only the innermost supplied level may carry several ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub modules: Ids<ModuleId>,
    pub types: Option<Ids<String>>,
    pub branches: Option<Ids<String>>,
    pub keys: Option<Ids<LeafKey>>,
}

impl Lookup {
    pub fn modules(modules: Ids<ModuleId>) -> Self {
        Self {
            modules,
            types: None,
            branches: None,
            keys: None,
        }
    }

    pub fn with_types(mut self, types: Ids<String>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_branches(mut self, branches: Ids<String>) -> Self {
        self.branches = Some(branches);
        self
    }

    pub fn with_keys(mut self, keys: Ids<LeafKey>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Check the request shape and return the depth it targets.
    pub fn validate(&self) -> Result<KeyDepth, ValidationError> {
        if self.branches.is_some() && self.types.is_none() {
            return Err(ValidationError::SkippedLevel {
                component: "branch_id",
                parent: "type_id",
            });
        }
        if self.keys.is_some() && self.branches.is_none() {
            return Err(ValidationError::SkippedLevel {
                component: "key_id",
                parent: "branch_id",
            });
        }

        require_ids("module_id", &self.modules)?;
        if let Some(types) = &self.types {
            require_ids("type_id", types)?;
            types.iter().try_for_each(|t| require_text("type_id", t))?;
            reject_fanout(&self.modules, "module_id", "type_id")?;
        }
        if let Some(branches) = &self.branches {
            require_ids("branch_id", branches)?;
            branches
                .iter()
                .try_for_each(|b| require_text("branch_id", b))?;
            if let Some(types) = &self.types {
                reject_fanout(types, "type_id", "branch_id")?;
            }
        }
        if let Some(keys) = &self.keys {
            require_ids("key_id", keys)?;
            keys.iter().try_for_each(require_key)?;
            if let Some(branches) = &self.branches {
                reject_fanout(branches, "branch_id", "key_id")?;
            }
        }

        Ok(match (&self.types, &self.branches, &self.keys) {
            (None, _, _) => KeyDepth::Module,
            (Some(_), None, _) => KeyDepth::Type,
            (Some(_), Some(_), None) => KeyDepth::Branch,
            (Some(_), Some(_), Some(_)) => KeyDepth::Leaf,
        })
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module={}", self.modules)?;
        if let Some(t) = &self.types {
            write!(f, " type={}", t)?;
        }
        if let Some(b) = &self.branches {
            write!(f, " branch={}", b)?;
        }
        if let Some(k) = &self.keys {
            write!(f, " key={}", k)?;
        }
        Ok(())
    }
}

fn require_ids<T>(component: &'static str, ids: &Ids<T>) -> Result<(), ValidationError> {
    if ids.is_empty() {
        Err(ValidationError::EmptyIdList { component })
    } else {
        Ok(())
    }
}

fn reject_fanout<T>(
    outer_ids: &Ids<T>,
    outer: &'static str,
    inner: &'static str,
) -> Result<(), ValidationError> {
    if outer_ids.is_fanout() {
        Err(ValidationError::OuterFanout { outer, inner })
    } else {
        Ok(())
    }
}

// ============================================================================
// LOAD QUERY (fill requests)
// ============================================================================

/// A fill request. `None` at a level means every value at that level, and
/// marks that subtree as fully known once the fill succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadQuery {
    pub modules: Vec<ModuleId>,
    pub types: Option<Vec<String>>,
    pub branches: Option<Vec<String>>,
    pub keys: Option<Vec<LeafKey>>,
}

impl LoadQuery {
    pub fn modules(modules: Vec<ModuleId>) -> Self {
        Self {
            modules,
            types: None,
            branches: None,
            keys: None,
        }
    }

    pub fn module(module_id: ModuleId) -> Self {
        Self::modules(vec![module_id])
    }

    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_branches(mut self, branches: Vec<String>) -> Self {
        self.branches = Some(branches);
        self
    }

    pub fn with_keys(mut self, keys: Vec<LeafKey>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.modules.is_empty() {
            return Err(ValidationError::MissingComponent {
                component: "module_id",
            });
        }
        if self.branches.is_some() && self.types.is_none() {
            return Err(ValidationError::SkippedLevel {
                component: "branch_id",
                parent: "type_id",
            });
        }
        if self.keys.is_some() && self.branches.is_none() {
            return Err(ValidationError::SkippedLevel {
                component: "key_id",
                parent: "branch_id",
            });
        }
        if let Some(types) = &self.types {
            if types.is_empty() {
                return Err(ValidationError::EmptyIdList {
                    component: "type_id",
                });
            }
            types.iter().try_for_each(|t| require_text("type_id", t))?;
        }
        if let Some(branches) = &self.branches {
            if branches.is_empty() {
                return Err(ValidationError::EmptyIdList {
                    component: "branch_id",
                });
            }
            branches
                .iter()
                .try_for_each(|b| require_text("branch_id", b))?;
        }
        if let Some(keys) = &self.keys {
            if keys.is_empty() {
                return Err(ValidationError::EmptyIdList {
                    component: "key_id",
                });
            }
            keys.iter().try_for_each(require_key)?;
        }
        Ok(())
    }

    /// The level whose whole subtree this query covers, if any.
    ///
    /// `Module` when types were omitted, `Type` when branches were omitted,
    /// `Branch` when keys were omitted, `None` for leaf-level queries.
    pub fn completes(&self) -> Option<KeyDepth> {
        match (&self.types, &self.branches, &self.keys) {
            (None, _, _) => Some(KeyDepth::Module),
            (Some(_), None, _) => Some(KeyDepth::Type),
            (Some(_), Some(_), None) => Some(KeyDepth::Branch),
            (Some(_), Some(_), Some(_)) => None,
        }
    }

    /// Predicates built from the supplied components.
    pub fn predicates(&self) -> Vec<Predicate> {
        let mut predicates = vec![Predicate::matching(
            Column::ModuleId,
            self.modules.iter().map(|m| Value::from(*m)).collect(),
        )];
        if let Some(types) = &self.types {
            predicates.push(Predicate::matching(
                Column::TypeId,
                types.iter().cloned().map(Value::String).collect(),
            ));
        }
        if let Some(branches) = &self.branches {
            predicates.push(Predicate::matching(
                Column::BranchId,
                branches.iter().cloned().map(Value::String).collect(),
            ));
        }
        if let Some(keys) = &self.keys {
            predicates.push(Predicate::matching(
                Column::KeyId,
                keys.iter().map(LeafKey::to_value).collect(),
            ));
        }
        predicates
    }
}

impl fmt::Display for LoadQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module={}", Ids::Many(self.modules.clone()))?;
        if let Some(t) = &self.types {
            write!(f, " type={}", Ids::Many(t.clone()))?;
        }
        if let Some(b) = &self.branches {
            write!(f, " branch={}", Ids::Many(b.clone()))?;
        }
        if let Some(k) = &self.keys {
            write!(f, " key={}", Ids::Many(k.clone()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Operator, PredicateValue};

    #[test]
    fn test_leaf_key_normalises_numeric_strings() {
        assert_eq!(LeafKey::from("42"), LeafKey::Int(42));
        assert_eq!(LeafKey::from("-7"), LeafKey::Int(-7));
        assert_eq!(LeafKey::from("007"), LeafKey::Str("007".to_string()));
        assert_eq!(LeafKey::from("dark"), LeafKey::Str("dark".to_string()));
        assert!(LeafKey::from("").is_empty());
    }

    #[test]
    fn test_directly_built_numeric_string_key_is_the_integer_key() {
        let raw = LeafKey::Str("42".to_string());
        assert_eq!(raw, LeafKey::Int(42));
        assert_eq!(raw.cmp(&LeafKey::Int(42)), std::cmp::Ordering::Equal);
        assert_eq!(raw.to_value(), serde_json::json!(42));
        assert_eq!(serde_json::to_string(&raw).unwrap(), "42");
        assert!(matches!(raw.clone().normalized(), LeafKey::Int(42)));

        let mut hashed = std::collections::HashSet::new();
        hashed.insert(raw);
        assert!(hashed.contains(&LeafKey::Int(42)));

        let key = CacheKey::leaf(1, "t", "b", LeafKey::Str("42".to_string())).unwrap();
        assert!(matches!(key.key_id(), Some(LeafKey::Int(42))));
        assert_ne!(LeafKey::Str("042".to_string()), LeafKey::Int(42));
    }

    #[test]
    fn test_site_key_rejects_skipped_and_empty_levels() {
        assert!(matches!(
            SiteKey::new("t", None, Some(LeafKey::Int(1))),
            Err(ValidationError::SkippedLevel { .. })
        ));
        assert!(matches!(
            SiteKey::new("", None, None),
            Err(ValidationError::EmptyComponent { component: "type_id" })
        ));

        let key = SiteKey::new("t", Some("b".to_string()), Some(LeafKey::Int(3))).unwrap();
        assert_eq!(key.predicates().len(), 3);
        assert_eq!(key.to_string(), "module=* type=t branch=b key=3");
    }

    #[test]
    fn test_leaf_key_survives_json_object_keys() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(LeafKey::Int(42), 1);
        map.insert(LeafKey::from("name"), 2);

        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<LeafKey, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_cache_key_rejects_skipped_levels() {
        let err = CacheKey::new(1, None, Some("b".to_string()), None).unwrap_err();
        assert_eq!(
            err,
            ValidationError::SkippedLevel {
                component: "branch_id",
                parent: "type_id"
            }
        );

        let err =
            CacheKey::new(1, Some("t".to_string()), None, Some(LeafKey::Int(1))).unwrap_err();
        assert!(matches!(err, ValidationError::SkippedLevel { component: "key_id", .. }));
    }

    #[test]
    fn test_cache_key_chaining_builder() {
        let key = CacheKey::module(1)
            .with_type("profile")
            .and_then(|k| k.with_branch("settings"))
            .and_then(|k| k.with_key("42"))
            .unwrap();
        assert_eq!(key, CacheKey::leaf(1, "profile", "settings", 42).unwrap());

        let err = CacheKey::module(1).with_branch("settings").unwrap_err();
        assert!(matches!(err, ValidationError::SkippedLevel { .. }));
    }

    #[test]
    fn test_cache_key_rejects_empty_components() {
        assert!(CacheKey::of_type(1, "").is_err());
        assert!(CacheKey::branch(1, "t", "").is_err());
        assert!(CacheKey::leaf(1, "t", "b", "").is_err());
    }

    #[test]
    fn test_cache_key_depth_and_display() {
        let key = CacheKey::leaf(1, "profile", "settings", 42).unwrap();
        assert_eq!(key.depth(), KeyDepth::Leaf);
        assert_eq!(key.to_string(), "module=1 type=profile branch=settings key=42");
        assert_eq!(CacheKey::module(3).depth(), KeyDepth::Module);
        assert_eq!(key.predicates().len(), 4);
    }

    #[test]
    fn test_lookup_rejects_outer_fanout() {
        let lookup = Lookup::modules(Ids::many([1, 2])).with_types(Ids::one("t"));
        assert_eq!(
            lookup.validate(),
            Err(ValidationError::OuterFanout {
                outer: "module_id",
                inner: "type_id"
            })
        );

        let lookup = Lookup::modules(Ids::one(1))
            .with_types(Ids::many(["a", "b"]))
            .with_branches(Ids::one("x"));
        assert!(matches!(
            lookup.validate(),
            Err(ValidationError::OuterFanout { outer: "type_id", .. })
        ));
    }

    #[test]
    fn test_lookup_accepts_innermost_fanout() {
        let lookup = Lookup::modules(Ids::one(1))
            .with_types(Ids::one("t"))
            .with_branches(Ids::one("b"))
            .with_keys(Ids::many([1, 2, 3]));
        assert_eq!(lookup.validate(), Ok(KeyDepth::Leaf));

        let lookup = Lookup::modules(Ids::many([1, 2, 3]));
        assert_eq!(lookup.validate(), Ok(KeyDepth::Module));
    }

    #[test]
    fn test_lookup_rejects_empty_id_list() {
        let lookup = Lookup::modules(Ids::Many(vec![]));
        assert_eq!(
            lookup.validate(),
            Err(ValidationError::EmptyIdList {
                component: "module_id"
            })
        );
    }

    #[test]
    fn test_load_query_completion_level() {
        assert_eq!(LoadQuery::module(1).completes(), Some(KeyDepth::Module));
        let q = LoadQuery::module(1).with_types(vec!["t".into()]);
        assert_eq!(q.completes(), Some(KeyDepth::Type));
        let q = q.with_branches(vec!["b".into()]);
        assert_eq!(q.completes(), Some(KeyDepth::Branch));
        let q = q.with_keys(vec![LeafKey::Int(1)]);
        assert_eq!(q.completes(), None);
    }

    #[test]
    fn test_load_query_predicates_use_in_for_lists() {
        let q = LoadQuery::module(1)
            .with_types(vec!["t".into()])
            .with_branches(vec!["b".into()])
            .with_keys(vec![LeafKey::Int(1), LeafKey::Int(3)]);
        let predicates = q.predicates();
        assert_eq!(predicates.len(), 4);
        assert_eq!(predicates[0].op, Operator::Eq);
        assert_eq!(predicates[3].op, Operator::In);
        assert_eq!(
            predicates[3].value,
            PredicateValue::Many(vec![Value::from(1), Value::from(3)])
        );
    }

    #[test]
    fn test_load_query_validation() {
        assert!(LoadQuery::modules(vec![]).validate().is_err());
        let q = LoadQuery {
            modules: vec![1],
            types: None,
            branches: Some(vec!["b".into()]),
            keys: None,
        };
        assert!(q.validate().is_err());
        assert!(LoadQuery::module(1).with_types(vec![]).validate().is_err());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Integer keys and their decimal text address the same leaf.
        #[test]
        fn prop_integer_text_normalises(n in any::<i64>()) {
            prop_assert_eq!(LeafKey::parse(&n.to_string()), LeafKey::Int(n));
        }

        /// Non-numeric text never turns into an integer key.
        #[test]
        fn prop_alpha_text_stays_text(s in "[a-z_]{1,16}") {
            prop_assert_eq!(LeafKey::parse(&s), LeafKey::Str(s.clone()));
        }
    }
}
