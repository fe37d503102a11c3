//! Backing-store rows, predicates and table schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ValidationError;
use crate::key::{require_key, require_text, CacheKey, LeafKey, ModuleId};
use crate::page::TypeMap;

/// One stored leaf: a full 4-level address plus its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub module_id: ModuleId,
    pub type_id: String,
    pub branch_id: String,
    pub key_id: LeafKey,
    pub value: Value,
}

impl Row {
    pub fn new(
        module_id: ModuleId,
        type_id: impl Into<String>,
        branch_id: impl Into<String>,
        key_id: impl Into<LeafKey>,
        value: Value,
    ) -> Self {
        Self {
            module_id,
            type_id: type_id.into(),
            branch_id: branch_id.into(),
            key_id: key_id.into().normalized(),
            value,
        }
    }

    /// Check that every key component is present; `index` is the row's
    /// position in the caller's batch.
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        require_text("type_id", &self.type_id)
            .and_then(|_| require_text("branch_id", &self.branch_id))
            .and_then(|_| require_key(&self.key_id))
            .map_err(|e| ValidationError::InvalidRow {
                index,
                reason: e.to_string(),
            })
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::from_parts(
            self.module_id,
            Some(self.type_id.clone()),
            Some(self.branch_id.clone()),
            Some(self.key_id.clone()),
        )
    }

    /// Column value as it would be compared by a predicate.
    pub fn column(&self, column: Column) -> Value {
        match column {
            Column::ModuleId => Value::from(self.module_id),
            Column::TypeId => Value::String(self.type_id.clone()),
            Column::BranchId => Value::String(self.branch_id.clone()),
            Column::KeyId => self.key_id.to_value(),
            Column::Value => self.value.clone(),
        }
    }
}

/// Group flat rows into per-module nested maps.
pub fn nest_rows(rows: impl IntoIterator<Item = Row>) -> BTreeMap<ModuleId, TypeMap> {
    let mut nested: BTreeMap<ModuleId, TypeMap> = BTreeMap::new();
    for row in rows {
        nested
            .entry(row.module_id)
            .or_default()
            .entry(row.type_id)
            .or_default()
            .entry(row.branch_id)
            .or_default()
            .insert(row.key_id, row.value);
    }
    nested
}

/// Flatten one module's nested map back into rows.
pub fn flatten_rows(module_id: ModuleId, data: &TypeMap) -> Vec<Row> {
    data.iter()
        .flat_map(|(type_id, branches)| {
            branches.iter().flat_map(move |(branch_id, keys)| {
                keys.iter().map(move |(key_id, value)| Row {
                    module_id,
                    type_id: type_id.clone(),
                    branch_id: branch_id.clone(),
                    key_id: key_id.clone(),
                    value: value.clone(),
                })
            })
        })
        .collect()
}

// ============================================================================
// PREDICATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    ModuleId,
    TypeId,
    BranchId,
    KeyId,
    Value,
}

impl Column {
    pub fn as_str(&self) -> &'static str {
        match self {
            Column::ModuleId => "module_id",
            Column::TypeId => "type_id",
            Column::BranchId => "branch_id",
            Column::KeyId => "key_id",
            Column::Value => "value",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    NotEq,
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredicateValue {
    One(Value),
    Many(Vec<Value>),
}

/// A column comparison. A request's predicates are ANDed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: Column,
    pub op: Operator,
    pub value: PredicateValue,
}

impl Predicate {
    pub fn eq(column: Column, value: Value) -> Self {
        Self {
            column,
            op: Operator::Eq,
            value: PredicateValue::One(value),
        }
    }

    pub fn not_eq(column: Column, value: Value) -> Self {
        Self {
            column,
            op: Operator::NotEq,
            value: PredicateValue::One(value),
        }
    }

    pub fn is_in(column: Column, values: Vec<Value>) -> Self {
        Self {
            column,
            op: Operator::In,
            value: PredicateValue::Many(values),
        }
    }

    /// `Eq` for a single value, `In` otherwise.
    pub fn matching(column: Column, mut values: Vec<Value>) -> Self {
        if values.len() == 1 {
            Self::eq(column, values.remove(0))
        } else {
            Self::is_in(column, values)
        }
    }

    /// Evaluate against a row. Key comparisons go through [`LeafKey`] so
    /// `"42"` and `42` compare equal.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.column(self.column);
        let same = |expected: &Value| {
            if self.column == Column::KeyId {
                LeafKey::from_value(expected).as_ref() == Some(&row.key_id)
            } else {
                *expected == actual
            }
        };
        match (&self.op, &self.value) {
            (Operator::Eq, PredicateValue::One(v)) => same(v),
            (Operator::NotEq, PredicateValue::One(v)) => !same(v),
            (Operator::In, PredicateValue::Many(vs)) => vs.iter().any(same),
            (Operator::In, PredicateValue::One(v)) => same(v),
            (Operator::Eq, PredicateValue::Many(vs)) => vs.len() == 1 && same(&vs[0]),
            (Operator::NotEq, PredicateValue::Many(vs)) => !vs.iter().any(same),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::In => "IN",
        };
        match &self.value {
            PredicateValue::One(v) => write!(f, "{} {} {}", self.column, op, v),
            PredicateValue::Many(vs) => {
                write!(f, "{} {} (", self.column, op)?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str(")")
            }
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Text,
    /// Integer or text, as stored by leaf keys.
    Scalar,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

/// Where a datastore's rows live and which cache namespace mirrors them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub namespace: String,
    pub columns: Vec<ColumnDef>,
    /// Columns forming the unique index: the four key levels.
    pub unique_index: Vec<String>,
}

impl TableSchema {
    /// The 5-column layout: four key levels plus a JSON value.
    pub fn standard(table: impl Into<String>, namespace: impl Into<String>) -> Self {
        let col = |name: &str, kind| ColumnDef {
            name: name.to_string(),
            kind,
        };
        Self {
            table: table.into(),
            namespace: namespace.into(),
            columns: vec![
                col("module_id", ColumnKind::Integer),
                col("type_id", ColumnKind::Text),
                col("branch_id", ColumnKind::Text),
                col("key_id", ColumnKind::Scalar),
                col("value", ColumnKind::Json),
            ],
            unique_index: ["module_id", "type_id", "branch_id", "key_id"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
