//! HOARD Test Utilities
//!
//! Shared test infrastructure for the hoard workspace:
//! - Proptest generators for keys, rows and module subtrees
//! - Fixtures that build in-memory datastores
//! - Assertions for page invariants and error variants
//! - Tracing setup for tests

pub use hoard_core::{
    BranchMap, CacheError, CacheKey, CachePage, DatastoreConfig, HoardError, HoardResult, Ids,
    KeyMap, LeafKey, LoadQuery, Lookup, ModuleId, Operation, Row, StoreError, TableSchema,
    TypeMap, ValidationError,
};
pub use hoard_storage::{
    BackingStore, CacheBackend, Datastore, HeldLock, MemoryCacheBackend, MemoryStore,
};

use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to `hoard_storage=debug`. Later calls are
/// no-ops.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hoard_storage=debug,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for hoard keys and data.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    /// A small module id range so generated writes collide.
    pub fn arb_module_id() -> impl Strategy<Value = ModuleId> {
        1i64..6
    }

    pub fn arb_type_id() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("profile".to_string()),
            Just("acl".to_string()),
            Just("nav".to_string()),
            Just("geo".to_string()),
        ]
    }

    pub fn arb_branch_id() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("settings".to_string()),
            Just("read".to_string()),
            Just("write".to_string()),
            "[a-z]{1,4}",
        ]
    }

    /// Integer keys and non-numeric string keys.
    pub fn arb_leaf_key() -> impl Strategy<Value = LeafKey> {
        prop_oneof![
            3 => (0i64..40).prop_map(LeafKey::Int),
            1 => "[a-z]{1,6}".prop_map(LeafKey::Str),
        ]
    }

    pub fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[a-zA-Z0-9 _-]{0,16}".prop_map(Value::from),
            (any::<i32>(), "[a-z]{1,8}").prop_map(|(n, s)| json!({ "n": n, "s": s })),
        ]
    }

    pub fn arb_row() -> impl Strategy<Value = Row> {
        (
            arb_module_id(),
            arb_type_id(),
            arb_branch_id(),
            arb_leaf_key(),
            arb_value(),
        )
            .prop_map(|(m, t, b, k, v)| Row::new(m, t, b, k, v))
    }

    pub fn arb_rows(max: usize) -> impl Strategy<Value = Vec<Row>> {
        prop::collection::vec(arb_row(), 1..=max)
    }

    /// A non-empty module subtree with no empty inner maps.
    pub fn arb_type_map() -> impl Strategy<Value = TypeMap> {
        prop::collection::btree_map(
            arb_type_id(),
            prop::collection::btree_map(
                arb_branch_id(),
                prop::collection::btree_map(arb_leaf_key(), arb_value(), 1..4),
                1..3,
            ),
            1..3,
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made datastores and data.

    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    pub type MemoryDatastore = Datastore<MemoryCacheBackend, MemoryStore>;

    pub const NAMESPACE: &str = "test";
    pub const TABLE: &str = "hoard_rows";

    pub fn schema() -> TableSchema {
        TableSchema::standard(TABLE, NAMESPACE)
    }

    /// An empty datastore over a fresh cache and store.
    pub fn memory_datastore() -> MemoryDatastore {
        let schema = schema();
        let store = MemoryStore::with_table(&schema);
        Datastore::new(Arc::new(MemoryCacheBackend::new()), Arc::new(store), schema)
    }

    /// A datastore whose store already holds `rows`. The cache starts cold.
    pub fn seeded_datastore(rows: &[Row]) -> MemoryDatastore {
        let schema = schema();
        let store = MemoryStore::with_table(&schema);
        if !rows.is_empty() {
            if let Err(e) = store.bulk_insert(&schema, rows) {
                panic!("seeding the store failed: {}", e);
            }
        }
        Datastore::new(Arc::new(MemoryCacheBackend::new()), Arc::new(store), schema)
    }

    /// Another handle on the same cache and store, with its own local copies.
    pub fn second_handle(ds: &MemoryDatastore) -> MemoryDatastore {
        Datastore::new(
            Arc::clone(ds.cache()),
            Arc::clone(ds.store()),
            ds.schema().clone(),
        )
    }

    /// Two modules of profile, acl and nav data.
    pub fn sample_rows() -> Vec<Row> {
        vec![
            Row::new(1, "profile", "settings", 1, json!("light")),
            Row::new(1, "profile", "settings", 2, json!("compact")),
            Row::new(1, "profile", "avatar", "url", json!("https://img/1")),
            Row::new(1, "acl", "read", 10, json!(true)),
            Row::new(1, "acl", "write", 10, json!(false)),
            Row::new(2, "profile", "settings", 1, json!("dark")),
            Row::new(2, "nav", "menu", "home", json!({"href": "/", "order": 1})),
        ]
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for page invariants and hoard error variants.

    use super::*;

    /// Assert that a page satisfies every structural invariant.
    #[track_caller]
    pub fn assert_page_invariants(page: &CachePage) {
        if let Err(violation) = page.validate() {
            panic!("page violates invariants: {} ({:?})", violation, page);
        }
    }

    /// Assert that no page lock is held.
    #[track_caller]
    pub fn assert_no_locks(held: Result<Vec<HeldLock>, CacheError>) {
        match held {
            Ok(held) => assert!(held.is_empty(), "locks still held: {:?}", held),
            Err(e) => panic!("could not list held locks: {}", e),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &HoardResult<T>) {
        match result {
            Err(HoardError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    /// Assert a store error raised by `operation`.
    #[track_caller]
    pub fn assert_store_error<T: std::fmt::Debug>(result: &HoardResult<T>, operation: Operation) {
        match result {
            Err(HoardError::Store { operation: op, .. }) => {
                assert_eq!(*op, operation, "Wrong operation in Store error");
            }
            other => panic!("Expected Store error from {}, got: {:?}", operation, other),
        }
    }

    #[track_caller]
    pub fn assert_rollback_error<T: std::fmt::Debug>(result: &HoardResult<T>) {
        match result {
            Err(HoardError::Rollback { .. }) => {}
            other => panic!("Expected Rollback error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cache_lock_error<T: std::fmt::Debug>(result: &HoardResult<T>) {
        match result {
            Err(HoardError::CacheLock { .. }) => {}
            other => panic!("Expected CacheLock error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_cache_write_error<T: std::fmt::Debug>(result: &HoardResult<T>, committed: bool) {
        match result {
            Err(HoardError::CacheWrite { committed: c, .. }) => {
                assert_eq!(*c, committed, "Wrong committed flag in CacheWrite error");
            }
            other => panic!("Expected CacheWrite error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_seeded_datastore_starts_cold() {
        let ds = fixtures::seeded_datastore(&fixtures::sample_rows());
        assert_eq!(ds.store().rows(ds.schema()).unwrap().len(), 7);
        assert!(ds.cache().peek(fixtures::NAMESPACE, 1).is_none());
    }

    #[test]
    fn test_second_handle_shares_cache() {
        let ds = fixtures::memory_datastore();
        let other = fixtures::second_handle(&ds);
        ds.set_key(1, "t", "b", 1, serde_json::json!(1)).unwrap();
        assert!(other.cache().peek(fixtures::NAMESPACE, 1).is_some());
    }

    #[test]
    fn test_assertion_store_error() {
        let result: HoardResult<()> = Err(HoardError::store(
            Operation::DropKey,
            "module=1",
            StoreError::LockPoisoned,
        ));
        assertions::assert_store_error(&result, Operation::DropKey);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_rows_are_valid(row in generators::arb_row()) {
            prop_assert!(row.validate(0).is_ok());
        }

        #[test]
        fn prop_generated_type_map_builds_valid_page(data in generators::arb_type_map()) {
            assertions::assert_page_invariants(&CachePage::complete(data));
        }
    }
}
