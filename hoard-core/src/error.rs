//! Error types for hoard operations

use std::fmt;
use thiserror::Error;

use crate::ModuleId;

/// Operations that can fail, carried by every context-bearing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Load,
    Get,
    SetKey,
    SetKeyMulti,
    SetPolicy,
    DropKey,
    DropBranch,
    DropType,
    DropModule,
    DropSiteKey,
    DropSiteBranch,
    DropSiteType,
    DropAll,
    Flush,
}

impl Operation {
    /// Stable snake_case name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Load => "load",
            Operation::Get => "get",
            Operation::SetKey => "set_key",
            Operation::SetKeyMulti => "set_key_multi",
            Operation::SetPolicy => "set_policy",
            Operation::DropKey => "drop_key",
            Operation::DropBranch => "drop_branch",
            Operation::DropType => "drop_type",
            Operation::DropModule => "drop_module",
            Operation::DropSiteKey => "drop_site_key",
            Operation::DropSiteBranch => "drop_site_branch",
            Operation::DropSiteType => "drop_site_type",
            Operation::DropAll => "drop_all",
            Operation::Flush => "flush",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed requests, raised before any I/O.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required key component missing: {component}")]
    MissingComponent { component: &'static str },

    #[error("Key component {component} supplied without its parent {parent}")]
    SkippedLevel {
        component: &'static str,
        parent: &'static str,
    },

    #[error("Empty value for key component {component}")]
    EmptyComponent { component: &'static str },

    #[error("Multiple {outer} ids cannot be combined with a {inner} lookup")]
    OuterFanout {
        outer: &'static str,
        inner: &'static str,
    },

    #[error("Empty id list for {component}")]
    EmptyIdList { component: &'static str },

    #[error("No rows supplied for {operation}")]
    NoRows { operation: Operation },

    #[error("Invalid row #{index}: {reason}")]
    InvalidRow { index: usize, reason: String },
}

/// Backing store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Query failed on {table}: {reason}")]
    QueryFailed { table: String, reason: String },

    #[error("Write failed on {table}: {reason}")]
    WriteFailed { table: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Unknown table: {table}")]
    UnknownTable { table: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Cache backend failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Timed out after {waited_ms}ms waiting for page locks on modules {modules:?}")]
    LockTimeout { modules: Vec<ModuleId>, waited_ms: u64 },

    #[error("Page locks on modules {modules:?} are not held by this token")]
    LockNotHeld { modules: Vec<ModuleId> },

    #[error("Cache state poisoned")]
    Poisoned,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all hoard errors.
///
/// Every I/O failure carries the operation and the rendered key context of
/// the call that produced it, plus the nested cause.
#[derive(Debug, Error)]
pub enum HoardError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{operation} [{target}]: backing store error: {source}")]
    Store {
        operation: Operation,
        target: String,
        #[source]
        source: StoreError,
    },

    /// Rolling back after `cause` failed as well; store state is unknown.
    #[error("{operation} [{target}]: rollback failed ({source}) after: {cause}")]
    Rollback {
        operation: Operation,
        target: String,
        cause: StoreError,
        #[source]
        source: StoreError,
    },

    #[error("{operation} [{target}]: could not lock cache pages: {source}")]
    CacheLock {
        operation: Operation,
        target: String,
        #[source]
        source: CacheError,
    },

    #[error("{operation} [{target}]: could not read cache pages: {source}")]
    CacheRead {
        operation: Operation,
        target: String,
        #[source]
        source: CacheError,
    },

    /// `committed` is true when the store write already committed and the
    /// cache may now be stale.
    #[error("{operation} [{target}]: could not write cache pages (store committed: {committed}): {source}")]
    CacheWrite {
        operation: Operation,
        target: String,
        committed: bool,
        #[source]
        source: CacheError,
    },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for hoard operations.
pub type HoardResult<T> = Result<T, HoardError>;

impl HoardError {
    pub fn store(operation: Operation, target: impl fmt::Display, source: StoreError) -> Self {
        Self::Store {
            operation,
            target: target.to_string(),
            source,
        }
    }

    pub fn cache_lock(operation: Operation, target: impl fmt::Display, source: CacheError) -> Self {
        Self::CacheLock {
            operation,
            target: target.to_string(),
            source,
        }
    }

    pub fn cache_read(operation: Operation, target: impl fmt::Display, source: CacheError) -> Self {
        Self::CacheRead {
            operation,
            target: target.to_string(),
            source,
        }
    }

    pub fn cache_write(
        operation: Operation,
        target: impl fmt::Display,
        committed: bool,
        source: CacheError,
    ) -> Self {
        Self::CacheWrite {
            operation,
            target: target.to_string(),
            committed,
            source,
        }
    }

    /// The operation this error was raised from, if it carries one.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Store { operation, .. }
            | Self::Rollback { operation, .. }
            | Self::CacheLock { operation, .. }
            | Self::CacheRead { operation, .. }
            | Self::CacheWrite { operation, .. } => Some(*operation),
            Self::Validation(_) | Self::Config(_) => None,
        }
    }

    /// Returns the error category for logging/monitoring purposes.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Store { .. } => ErrorCategory::Store,
            Self::Rollback { .. } => ErrorCategory::Indeterminate,
            Self::CacheLock { .. } | Self::CacheRead { .. } => ErrorCategory::Cache,
            Self::CacheWrite { committed: true, .. } => ErrorCategory::Indeterminate,
            Self::CacheWrite { .. } => ErrorCategory::Cache,
            Self::Config(_) => ErrorCategory::Config,
        }
    }

    /// Whether repeating the identical call could succeed.
    ///
    /// Post-commit cache write failures are excluded: the store already
    /// holds the new rows.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } | Self::CacheLock { .. } | Self::CacheRead { .. } => true,
            Self::CacheWrite { committed, .. } => !committed,
            Self::Validation(_) | Self::Rollback { .. } | Self::Config(_) => false,
        }
    }
}

/// Categories of hoard errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Validation,
    Store,
    Cache,
    /// Store or cache state can no longer be trusted.
    Indeterminate,
    Config,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Store => write!(f, "store"),
            Self::Cache => write!(f, "cache"),
            Self::Indeterminate => write!(f, "indeterminate"),
            Self::Config => write!(f, "config"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
