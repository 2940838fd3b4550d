//! Live schema introspection.
//!
//! Everything here reads the schema at call time. Nothing is cached, because
//! an earlier step of the same batch may have changed it.

pub mod inspector;
pub(crate) mod rebuild;

use serde::Serialize;
use std::collections::BTreeMap;

pub use inspector::SchemaInspector;

/// Shape of a single column as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type, verbatim.
    pub data_type: String,
    /// Whether NULL is accepted.
    pub nullable: bool,
    /// Default expression, verbatim.
    pub default: Option<String>,
    /// 1-based position in the primary key, if part of it.
    pub primary_key: Option<u32>,
}

impl ColumnInfo {
    /// Whether the default expression equals `expected` (whitespace-insensitive at the ends).
    pub fn default_matches(&self, expected: Option<&str>) -> bool {
        self.default.as_deref().map(str::trim) == expected.map(str::trim)
    }
}

/// Columns of one table keyed by name.
pub type TableShape = BTreeMap<String, ColumnInfo>;

/// Point-in-time view of every user table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    /// Tables keyed by name.
    pub tables: BTreeMap<String, TableShape>,
}

impl SchemaSnapshot {
    /// Look up a table.
    pub fn table(&self, name: &str) -> Option<&TableShape> {
        self.tables.get(name)
    }

    /// Look up a column.
    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnInfo> {
        self.tables.get(table).and_then(|t| t.get(column))
    }
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Whether `sql` contains `ident` as a standalone identifier token.
pub(crate) fn mentions_identifier(sql: &str, ident: &str) -> bool {
    sql.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .any(|token| token.eq_ignore_ascii_case(ident))
}
