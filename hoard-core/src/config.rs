//! Datastore configuration
//!
//! Loaded from environment variables with development defaults, then checked
//! with [`DatastoreConfig::validate`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::row::TableSchema;

/// Settings for one datastore instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreConfig {
    /// Cache namespace. Site-wide drops flush every page in it.
    pub namespace: String,

    /// Backing table name.
    pub table: String,

    /// How long to wait for page locks before giving up.
    pub lock_timeout: Duration,

    /// LMDB directory; `None` selects the in-memory cache backend.
    pub lmdb_path: Option<PathBuf>,

    /// LMDB map size in megabytes.
    pub lmdb_map_size_mb: usize,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            namespace: "hoard".to_string(),
            table: "hoard_rows".to_string(),
            lock_timeout: Duration::from_secs(5),
            lmdb_path: None,
            lmdb_map_size_mb: 256,
        }
    }
}

impl DatastoreConfig {
    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `HOARD_NAMESPACE`: cache namespace (default: "hoard")
    /// - `HOARD_TABLE`: backing table (default: "hoard_rows")
    /// - `HOARD_LOCK_TIMEOUT_MS`: page lock timeout (default: 5000)
    /// - `HOARD_LMDB_PATH`: LMDB directory (default: unset, in-memory cache)
    /// - `HOARD_LMDB_MAP_SIZE_MB`: LMDB map size (default: 256)
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let namespace = var("HOARD_NAMESPACE")
            .map(|s| s.trim().to_string())
            .unwrap_or(defaults.namespace);

        let table = var("HOARD_TABLE")
            .map(|s| s.trim().to_string())
            .unwrap_or(defaults.table);

        let lock_timeout = var("HOARD_LOCK_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_timeout);

        let lmdb_path = var("HOARD_LMDB_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let lmdb_map_size_mb = var("HOARD_LMDB_MAP_SIZE_MB")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.lmdb_map_size_mb);

        Self {
            namespace,
            table,
            lock_timeout,
            lmdb_path,
            lmdb_map_size_mb,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lmdb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lmdb_path = Some(path.into());
        self
    }

    pub fn with_lmdb_map_size_mb(mut self, size: usize) -> Self {
        self.lmdb_map_size_mb = size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "namespace".to_string(),
            });
        }
        if self.table.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "table".to_string(),
            });
        }
        if self.lock_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "lock_timeout".to_string(),
                value: format!("{:?}", self.lock_timeout),
                reason: "must be positive".to_string(),
            });
        }
        if self.lmdb_path.is_some() && self.lmdb_map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Schema for the configured table and namespace.
    pub fn schema(&self) -> TableSchema {
        TableSchema::standard(self.table.clone(), self.namespace.clone())
    }
}
