//! Table registry — the tables, columns and primary keys a store exposes.
//!
//! Stores build the registry once, by introspecting the database when they
//! connect. The applier and loader consult it for every mutation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::convert::ColumnType;
use crate::error::{Result, SinkError};

/// A destination column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub has_default: bool,
}

impl ColumnInfo {
    /// A nullable column without default.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            has_default: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    /// A column an insert must provide a value for.
    pub fn is_required(&self) -> bool {
        !self.nullable && !self.has_default
    }
}

/// A destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnInfo>,
    /// Primary key columns in key order.
    pub primary_key: Vec<String>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnInfo) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Look up a column by name.
    pub fn get(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// All tables known to a store.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<String, TableInfo>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a table.
    pub fn register(&mut self, table: TableInfo) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn with_table(mut self, table: TableInfo) -> Self {
        self.register(table);
        self
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    /// Table names, sorted.
    pub fn available_tables(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    /// Expand an opaque key into `column → value` using the table's single
    /// declared key column.
    pub fn primary_key(&self, table: &str, key: &str) -> Result<BTreeMap<String, String>> {
        let info = self.require(table)?;
        match info.primary_key.as_slice() {
            [column] => Ok(BTreeMap::from([(column.clone(), key.to_string())])),
            [] => Err(SinkError::KeyResolution {
                table: table.to_string(),
                reason: "table declares no primary key column".into(),
            }),
            columns => Err(SinkError::KeyResolution {
                table: table.to_string(),
                reason: format!(
                    "single key {key:?} given but the table has a composite primary key ({})",
                    columns.join(", ")
                ),
            }),
        }
    }

    /// Check that a composite key names exactly the declared key columns.
    pub fn check_composite_key(&self, table: &str, keys: &BTreeMap<String, String>) -> Result<()> {
        let info = self.require(table)?;
        let given: Vec<&str> = keys.keys().map(String::as_str).collect();
        let mut declared: Vec<&str> = info.primary_key.iter().map(String::as_str).collect();
        declared.sort_unstable();
        if given != declared {
            return Err(SinkError::KeyResolution {
                table: table.to_string(),
                reason: format!(
                    "composite key columns ({}) do not match the declared primary key ({})",
                    given.join(", "),
                    declared.join(", ")
                ),
            });
        }
        Ok(())
    }

    fn require(&self, table: &str) -> Result<&TableInfo> {
        self.tables.get(table).ok_or_else(|| SinkError::Schema {
            table: table.to_string(),
            identifier: "table registry".into(),
            available: self.available_tables().join(", "),
        })
    }
}
