//! Read-only schema introspection over a SQLite connection.

use rusqlite::{Connection, OptionalExtension};

use super::{mentions_identifier, quote_ident, ColumnInfo, SchemaSnapshot, TableShape};
use crate::error::Result;

/// Prefix of the engine's own bookkeeping tables.
pub const INTERNAL_TABLE_PREFIX: &str = "_stratum_";

/// Read-only view of the live schema.
///
/// "Not found" is never an error here: missing tables and columns are
/// reported as absent so callers can build create-if-missing flows.
pub struct SchemaInspector<'c> {
    conn: &'c Connection,
}

impl<'c> SchemaInspector<'c> {
    /// Create an inspector over a borrowed connection.
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Whether a table exists.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether a column exists. False if the table itself is missing.
    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2 COLLATE NOCASE",
            [table, column],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether an index exists.
    pub fn index_exists(&self, index: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1 COLLATE NOCASE",
            [index],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Columns of a table keyed by name. Empty if the table does not exist.
    pub fn describe_table(&self, table: &str) -> Result<TableShape> {
        Ok(self
            .columns(table)?
            .into_iter()
            .map(|column| (column.name.clone(), column))
            .collect())
    }

    /// Columns of a table in declaration order. Empty if the table does not exist.
    pub fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let columns = stmt
            .query_map([table], |row| {
                let pk: u32 = row.get(4)?;
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                    nullable: row.get::<_, i64>(2)? == 0,
                    default: row.get(3)?,
                    primary_key: (pk > 0).then_some(pk),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    /// A single column, if present.
    pub fn column(&self, table: &str, column: &str) -> Result<Option<ColumnInfo>> {
        Ok(self
            .columns(table)?
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(column)))
    }

    /// Snapshot of every user table, excluding SQLite and engine internals.
    pub fn snapshot(&self) -> Result<SchemaSnapshot> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut snapshot = SchemaSnapshot::default();
        for name in names {
            if name.starts_with(INTERNAL_TABLE_PREFIX) {
                continue;
            }
            let shape = self.describe_table(&name)?;
            snapshot.tables.insert(name, shape);
        }
        Ok(snapshot)
    }

    /// Number of rows in `table` satisfying `predicate`.
    pub fn count_matching(&self, table: &str, predicate: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE ({})",
            quote_ident(table),
            predicate
        );
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Number of rows in `table`.
    pub fn row_count(&self, table: &str) -> Result<u64> {
        self.count_matching(table, "1")
    }

    /// Number of rows holding a non-NULL value in `column`.
    pub fn non_null_count(&self, table: &str, column: &str) -> Result<u64> {
        self.count_matching(table, &format!("{} IS NOT NULL", quote_ident(column)))
    }

    /// The CREATE statement of a table, if it exists.
    pub fn table_sql(&self, table: &str) -> Result<Option<String>> {
        let sql = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
                [table],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(sql.flatten())
    }

    /// Objects that would break or block if `column` were removed from `table`.
    pub fn column_dependents(&self, table: &str, column: &str) -> Result<Vec<String>> {
        let mut dependents = Vec::new();

        if let Some(info) = self.column(table, column)? {
            if info.primary_key.is_some() {
                dependents.push(format!("primary key of {table}"));
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT il.name FROM pragma_index_list(?1) AS il \
             JOIN pragma_index_info(il.name) AS ii \
             WHERE ii.name = ?2 COLLATE NOCASE ORDER BY il.name",
        )?;
        let indexes = stmt
            .query_map([table, column], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        dependents.extend(indexes.into_iter().map(|name| format!("index {name}")));

        let mut stmt = self.conn.prepare(
            "SELECT \"table\" FROM pragma_foreign_key_list(?1) WHERE \"from\" = ?2 COLLATE NOCASE",
        )?;
        let outgoing = stmt
            .query_map([table, column], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        dependents.extend(
            outgoing
                .into_iter()
                .map(|parent| format!("foreign key {table}.{column} -> {parent}")),
        );

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT m.name FROM sqlite_master AS m \
             JOIN pragma_foreign_key_list(m.name) AS fk \
             WHERE m.type = 'table' AND fk.\"table\" = ?1 COLLATE NOCASE \
             AND fk.\"to\" = ?2 COLLATE NOCASE ORDER BY m.name",
        )?;
        let incoming = stmt
            .query_map([table, column], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        dependents.extend(
            incoming
                .into_iter()
                .map(|child| format!("foreign key from {child}")),
        );

        for (kind, name, sql) in self.schema_objects(&["index", "trigger", "view"])? {
            let label = format!("{kind} {name}");
            if dependents.contains(&label) {
                continue;
            }
            if mentions_identifier(&sql, table) && mentions_identifier(&sql, column) {
                dependents.push(label);
            }
        }

        Ok(dependents)
    }

    /// Objects that would break or block if `table` were dropped.
    pub fn table_dependents(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT m.name FROM sqlite_master AS m \
             JOIN pragma_foreign_key_list(m.name) AS fk \
             WHERE m.type = 'table' AND m.name <> ?1 COLLATE NOCASE \
             AND fk.\"table\" = ?1 COLLATE NOCASE ORDER BY m.name",
        )?;
        let mut dependents = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|child| format!("foreign key from {child}"))
            .collect::<Vec<_>>();

        for (kind, name, sql) in self.schema_objects(&["view", "trigger"])? {
            if kind == "trigger" && self.trigger_table(&name)?.as_deref() == Some(table) {
                // Dropped together with the table.
                continue;
            }
            if mentions_identifier(&sql, table) {
                dependents.push(format!("{kind} {name}"));
            }
        }

        Ok(dependents)
    }

    /// Index and trigger statements attached to a table, in creation order.
    pub(crate) fn attached_sql(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT sql FROM sqlite_master \
             WHERE tbl_name = ?1 COLLATE NOCASE AND type IN ('index', 'trigger') AND sql IS NOT NULL \
             ORDER BY CASE type WHEN 'index' THEN 0 ELSE 1 END, rowid",
        )?;
        let sql = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sql)
    }

    fn trigger_table(&self, trigger: &str) -> Result<Option<String>> {
        let table = self
            .conn
            .query_row(
                "SELECT tbl_name FROM sqlite_master WHERE type = 'trigger' AND name = ?1",
                [trigger],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(table)
    }

    fn schema_objects(&self, kinds: &[&str]) -> Result<Vec<(String, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT type, name, sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY rowid",
        )?;
        let objects = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(objects
            .into_iter()
            .filter(|(kind, _, _)| kinds.contains(&kind.as_str()))
            .collect())
    }
}
