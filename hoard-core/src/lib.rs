//! HOARD Core - Data Types
//!
//! Keys, cache pages, rows and errors shared by every hoard crate. No I/O
//! lives here.

pub mod config;
pub mod error;
pub mod key;
pub mod page;
pub mod row;

pub use config::DatastoreConfig;
pub use error::{
    CacheError, ConfigError, ErrorCategory, HoardError, HoardResult, Operation, StoreError,
    ValidationError,
};
pub use key::{CacheKey, Ids, KeyDepth, LeafKey, LoadQuery, Lookup, ModuleId, SiteKey};
pub use page::{BranchMap, CachePage, KeyMap, PageViolation, TypeMap};
pub use row::{
    flatten_rows, nest_rows, Column, ColumnDef, ColumnKind, Operator, Predicate, PredicateValue,
    Row, TableSchema,
};
