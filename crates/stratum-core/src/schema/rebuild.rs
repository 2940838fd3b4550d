//! Transactional table rebuild.
//!
//! SQLite cannot change a column's nullability in place. The change is made by
//! building a shadow table with the new column definition, copying every row,
//! and swapping it in, all inside one transaction. Either the new table
//! commits with every row intact or the original is left untouched.

use rusqlite::Connection;

use super::inspector::INTERNAL_TABLE_PREFIX;
use super::{mentions_identifier, quote_ident, ColumnInfo, SchemaInspector};
use crate::error::{MigrationError, Result};

/// Table features the rebuild cannot carry over faithfully.
const UNSUPPORTED_FEATURES: &[&str] = &["CHECK", "COLLATE", "GENERATED", "WITHOUT", "STRICT"];

/// New definition for one column.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ColumnRewrite<'a> {
    pub column: &'a str,
    pub nullable: bool,
    /// Replacement default; `None` keeps the current one.
    pub default: Option<&'a str>,
}

#[derive(Debug)]
struct ForeignKey {
    parent: String,
    from: Vec<String>,
    to: Vec<Option<String>>,
    on_update: String,
    on_delete: String,
}

/// Rebuild `table` with one column redefined.
pub(crate) fn rebuild_table(conn: &Connection, table: &str, rewrite: ColumnRewrite<'_>) -> Result<()> {
    let inspector = SchemaInspector::new(conn);
    let columns = inspector.columns(table)?;
    if columns.is_empty() {
        return Err(MigrationError::Missing {
            object: format!("table {table}"),
        });
    }
    if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(rewrite.column)) {
        return Err(MigrationError::Missing {
            object: format!("column {table}.{}", rewrite.column),
        });
    }

    let original_sql = inspector.table_sql(table)?.unwrap_or_default();
    if let Some(feature) = UNSUPPORTED_FEATURES
        .iter()
        .find(|feature| mentions_identifier(&original_sql, feature))
    {
        return Err(MigrationError::UnsafeOperation {
            operation: format!("rebuilding {table} (declares {feature})"),
            requirement: "express the change as a new column plus backfill instead".to_string(),
        });
    }

    let autoincrement = mentions_identifier(&original_sql, "AUTOINCREMENT");
    let foreign_keys = foreign_keys(conn, table)?;
    let unique = unique_constraints(conn, table)?;
    let attached = inspector.attached_sql(table)?;
    let shadow = format!("{INTERNAL_TABLE_PREFIX}rebuild_{table}");
    let create = create_table_sql(
        &shadow,
        &columns,
        rewrite,
        autoincrement,
        &foreign_keys,
        &unique,
    );

    tracing::debug!(table, column = rewrite.column, nullable = rewrite.nullable, "rebuilding table");

    let foreign_keys_on = pragma_flag(conn, "foreign_keys")?;
    let legacy_alter = pragma_flag(conn, "legacy_alter_table")?;
    if foreign_keys_on {
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    }
    if !legacy_alter {
        conn.execute_batch("PRAGMA legacy_alter_table = ON")?;
    }

    let result = copy_and_swap(conn, table, &shadow, &create, &columns, &attached);

    if !legacy_alter {
        conn.execute_batch("PRAGMA legacy_alter_table = OFF")?;
    }
    if foreign_keys_on {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
    }
    result
}

fn copy_and_swap(
    conn: &Connection,
    table: &str,
    shadow: &str,
    create: &str,
    columns: &[ColumnInfo],
    attached: &[String],
) -> Result<()> {
    let quoted_table = quote_ident(table);
    let quoted_shadow = quote_ident(shadow);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {quoted_shadow}"))?;
    tx.execute_batch(create)?;

    let copied = tx.execute(
        &format!("INSERT INTO {quoted_shadow} ({column_list}) SELECT {column_list} FROM {quoted_table}"),
        [],
    )?;
    let original: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {quoted_table}"), [], |row| {
        row.get(0)
    })?;
    if copied as i64 != original {
        return Err(MigrationError::VerificationFailed {
            message: format!("rebuild of {table} copied {copied} of {original} rows"),
        });
    }

    tx.execute_batch(&format!("DROP TABLE {quoted_table}"))?;
    tx.execute_batch(&format!("ALTER TABLE {quoted_shadow} RENAME TO {quoted_table}"))?;
    for sql in attached {
        tx.execute_batch(sql)?;
    }

    let violations: i64 = tx.query_row(
        "SELECT COUNT(*) FROM pragma_foreign_key_check(?1)",
        [table],
        |row| row.get(0),
    )?;
    if violations > 0 {
        return Err(MigrationError::VerificationFailed {
            message: format!("rebuild of {table} left {violations} foreign key violation(s)"),
        });
    }

    tx.commit()?;
    Ok(())
}

fn create_table_sql(
    name: &str,
    columns: &[ColumnInfo],
    rewrite: ColumnRewrite<'_>,
    autoincrement: bool,
    foreign_keys: &[ForeignKey],
    unique: &[Vec<String>],
) -> String {
    let mut pk: Vec<&ColumnInfo> = columns.iter().filter(|c| c.primary_key.is_some()).collect();
    pk.sort_by_key(|c| c.primary_key);
    let inline_pk = pk.len() == 1 && pk[0].data_type.eq_ignore_ascii_case("INTEGER");

    let mut parts: Vec<String> = columns
        .iter()
        .map(|column| {
            let mut sql = quote_ident(&column.name);
            if !column.data_type.is_empty() {
                sql.push(' ');
                sql.push_str(&column.data_type);
            }
            if inline_pk && column.primary_key.is_some() {
                sql.push_str(" PRIMARY KEY");
                if autoincrement {
                    sql.push_str(" AUTOINCREMENT");
                }
            }

            let (nullable, default) = if column.name.eq_ignore_ascii_case(rewrite.column) {
                (rewrite.nullable, rewrite.default.or(column.default.as_deref()))
            } else {
                (column.nullable, column.default.as_deref())
            };
            if !nullable {
                sql.push_str(" NOT NULL");
            }
            if let Some(default) = default {
                sql.push_str(" DEFAULT ");
                sql.push_str(&default_clause(default));
            }
            sql
        })
        .collect();

    if !inline_pk && !pk.is_empty() {
        let names = pk.iter().map(|c| quote_ident(&c.name)).collect::<Vec<_>>();
        parts.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }

    for columns in unique {
        let names = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>();
        parts.push(format!("UNIQUE ({})", names.join(", ")));
    }

    for fk in foreign_keys {
        let from = fk.from.iter().map(|c| quote_ident(c)).collect::<Vec<_>>();
        let mut sql = format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            from.join(", "),
            quote_ident(&fk.parent)
        );
        if let Some(to) = fk.to.iter().cloned().collect::<Option<Vec<_>>>() {
            let to = to.iter().map(|c| quote_ident(c)).collect::<Vec<_>>();
            sql.push_str(&format!(" ({})", to.join(", ")));
        }
        if fk.on_update != "NO ACTION" {
            sql.push_str(&format!(" ON UPDATE {}", fk.on_update));
        }
        if fk.on_delete != "NO ACTION" {
            sql.push_str(&format!(" ON DELETE {}", fk.on_delete));
        }
        parts.push(sql);
    }

    format!("CREATE TABLE {} (\n    {}\n)", quote_ident(name), parts.join(",\n    "))
}

/// Render a stored default so it parses again in a column definition.
pub(crate) fn default_clause(expr: &str) -> String {
    let trimmed = expr.trim();
    let upper = trimmed.to_ascii_uppercase();
    let is_literal = trimmed.starts_with('\'')
        || upper.starts_with("X'")
        || trimmed.trim_start_matches(['+', '-']).parse::<f64>().is_ok()
        || matches!(
            upper.as_str(),
            "NULL" | "TRUE" | "FALSE" | "CURRENT_TIME" | "CURRENT_DATE" | "CURRENT_TIMESTAMP"
        )
        || (trimmed.starts_with('(') && trimmed.ends_with(')'));
    if is_literal {
        trimmed.to_string()
    } else {
        format!("({trimmed})")
    }
}

fn foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKey>> {
    let mut stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete \
         FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
    )?;
    let rows = stmt
        .query_map([table], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut keys: Vec<(i64, ForeignKey)> = Vec::new();
    for (id, parent, from, to, on_update, on_delete) in rows {
        match keys.last_mut() {
            Some((last_id, fk)) if *last_id == id => {
                fk.from.push(from);
                fk.to.push(to);
            }
            _ => keys.push((
                id,
                ForeignKey {
                    parent,
                    from: vec![from],
                    to: vec![to],
                    on_update,
                    on_delete,
                },
            )),
        }
    }
    Ok(keys.into_iter().map(|(_, fk)| fk).collect())
}

fn unique_constraints(conn: &Connection, table: &str) -> Result<Vec<Vec<String>>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_index_list(?1) WHERE origin = 'u' ORDER BY seq DESC",
    )?;
    let indexes = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut constraints = Vec::with_capacity(indexes.len());
    for index in indexes {
        let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
        let columns = stmt
            .query_map([&index], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        constraints.push(columns);
    }
    Ok(constraints)
}

fn pragma_flag(conn: &Connection, pragma: &str) -> Result<bool> {
    let value: i64 = conn.query_row(&format!("PRAGMA {pragma}"), [], |row| row.get(0))?;
    Ok(value != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            CREATE TABLE "Orders" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT UNIQUE,
                status TEXT NOT NULL DEFAULT 'pending',
                shipping NUMERIC DEFAULT 0.00
            );
            CREATE TABLE "OrderItems" (
                id INTEGER PRIMARY KEY,
                order_id INTEGER NOT NULL REFERENCES "Orders"(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_orders_status ON "Orders"(status);
            CREATE TRIGGER orders_touch AFTER UPDATE ON "Orders" BEGIN SELECT 1; END;
            INSERT INTO "Orders" (code, status, shipping) VALUES ('a', 'paid', 5), ('b', 'pending', 7.5);
            INSERT INTO "OrderItems" (order_id) VALUES (1), (2), (2);
            "#,
        )
        .unwrap();
        conn
    }

    fn tighten(conn: &Connection) -> Result<()> {
        rebuild_table(
            conn,
            "Orders",
            ColumnRewrite {
                column: "shipping",
                nullable: false,
                default: Some("0.00"),
            },
        )
    }

    #[test]
    fn test_rebuild_changes_nullability_and_keeps_rows() {
        let conn = setup();
        tighten(&conn).unwrap();

        let inspector = SchemaInspector::new(&conn);
        let shipping = inspector.column("Orders", "shipping").unwrap().unwrap();
        assert!(!shipping.nullable);
        assert_eq!(shipping.default.as_deref(), Some("0.00"));

        let status = inspector.column("Orders", "status").unwrap().unwrap();
        assert!(!status.nullable);
        assert_eq!(status.default.as_deref(), Some("'pending'"));

        assert_eq!(inspector.row_count("Orders").unwrap(), 2);
        let total: f64 = conn
            .query_row("SELECT SUM(shipping) FROM \"Orders\"", [], |r| r.get(0))
            .unwrap();
        assert_eq!(total, 12.5);
    }

    #[test]
    fn test_rebuild_preserves_indexes_triggers_and_keys() {
        let conn = setup();
        tighten(&conn).unwrap();

        let inspector = SchemaInspector::new(&conn);
        assert!(inspector.index_exists("idx_orders_status").unwrap());
        let triggers: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name = 'orders_touch'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(triggers, 1);

        // UNIQUE survived.
        let dup = conn.execute("INSERT INTO \"Orders\" (code) VALUES ('a')", []);
        assert!(dup.is_err());

        // Child rows still reference the rebuilt parent.
        assert!(inspector
            .table_dependents("Orders")
            .unwrap()
            .contains(&"foreign key from OrderItems".to_string()));
        conn.execute("DELETE FROM \"Orders\" WHERE id = 2", []).unwrap();
        assert_eq!(inspector.row_count("OrderItems").unwrap(), 1);

        // AUTOINCREMENT survived.
        let sql = inspector.table_sql("Orders").unwrap().unwrap();
        assert!(sql.contains("AUTOINCREMENT"));
    }

    #[test]
    fn test_rebuild_with_nulls_rolls_back() {
        let conn = setup();
        conn.execute("UPDATE \"Orders\" SET shipping = NULL WHERE id = 1", [])
            .unwrap();

        assert!(tighten(&conn).is_err());

        let inspector = SchemaInspector::new(&conn);
        let shipping = inspector.column("Orders", "shipping").unwrap().unwrap();
        assert!(shipping.nullable);
        assert_eq!(inspector.row_count("Orders").unwrap(), 2);
        assert!(!inspector.table_exists("_stratum_rebuild_Orders").unwrap());

        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_rebuild_refuses_check_constraints() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER CHECK (v > 0))")
            .unwrap();
        let err = rebuild_table(
            &conn,
            "t",
            ColumnRewrite {
                column: "v",
                nullable: false,
                default: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MigrationError::UnsafeOperation { .. }));
    }

    #[test]
    fn test_rebuild_missing_table_or_column() {
        let conn = setup();
        let err = rebuild_table(
            &conn,
            "Nope",
            ColumnRewrite {
                column: "x",
                nullable: false,
                default: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MigrationError::Missing { .. }));

        let err = rebuild_table(
            &conn,
            "Orders",
            ColumnRewrite {
                column: "nope",
                nullable: false,
                default: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MigrationError::Missing { .. }));
    }

    #[test]
    fn test_default_clause() {
        assert_eq!(default_clause("0.00"), "0.00");
        assert_eq!(default_clause("-1"), "-1");
        assert_eq!(default_clause("'[]'"), "'[]'");
        assert_eq!(default_clause("CURRENT_TIMESTAMP"), "CURRENT_TIMESTAMP");
        assert_eq!(default_clause("datetime('now')"), "(datetime('now'))");
    }
}
