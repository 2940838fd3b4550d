//! Durable record of applied migrations.
//!
//! The ledger is the only source of truth for what has already taken effect.
//! Its backing table is created on first use.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::{MigrationError, Result};

/// Name of the ledger table.
pub const LEDGER_TABLE: &str = "_stratum_migrations";

/// A single applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    /// Migration name.
    pub name: String,
    /// When the migration was recorded.
    pub applied_at: DateTime<Utc>,
}

/// Persistent ledger of applied migrations.
pub struct MigrationLedger<'c> {
    conn: &'c Connection,
}

impl<'c> MigrationLedger<'c> {
    /// Open the ledger, creating its table if absent.
    pub fn open(conn: &'c Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (\n\
                 name TEXT PRIMARY KEY,\n\
                 applied_at TEXT NOT NULL\n\
             )"
        ))?;
        Ok(Self { conn })
    }

    /// Record a migration as applied. Fails if it is already recorded.
    pub fn record_applied(&self, name: &str, applied_at: DateTime<Utc>) -> Result<()> {
        let result = self.conn.execute(
            &format!("INSERT INTO {LEDGER_TABLE} (name, applied_at) VALUES (?1, ?2)"),
            params![name, encode_timestamp(applied_at)],
        );
        match result {
            Ok(_) => {
                tracing::debug!(migration = name, "recorded in ledger");
                Ok(())
            }
            Err(e) if MigrationError::is_constraint(&e) => Err(MigrationError::AlreadyRecorded {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a migration is recorded.
    pub fn is_applied(&self, name: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {LEDGER_TABLE} WHERE name = ?1"),
                [name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All records, oldest first.
    pub fn list_applied(&self) -> Result<Vec<MigrationRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT name, applied_at FROM {LEDGER_TABLE} ORDER BY applied_at, rowid"
        ))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(name, applied_at)| {
                Ok(MigrationRecord {
                    applied_at: decode_timestamp(&name, &applied_at)?,
                    name,
                })
            })
            .collect()
    }

    /// The most recently applied record.
    pub fn latest(&self) -> Result<Option<MigrationRecord>> {
        Ok(self.list_applied()?.pop())
    }

    /// Remove a record. Returns whether one existed.
    pub fn remove_record(&self, name: &str) -> Result<bool> {
        let removed = self.conn.execute(
            &format!("DELETE FROM {LEDGER_TABLE} WHERE name = ?1"),
            [name],
        )?;
        if removed > 0 {
            tracing::debug!(migration = name, "removed from ledger");
        }
        Ok(removed > 0)
    }
}

fn encode_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(name: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| MigrationError::InvalidData(format!("applied_at of {name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_bootstrap_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::open(&conn).unwrap();
        let ledger = MigrationLedger::open(&conn).unwrap();
        assert!(ledger.list_applied().unwrap().is_empty());
        assert!(ledger.latest().unwrap().is_none());
    }

    #[test]
    fn test_record_list_remove() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = MigrationLedger::open(&conn).unwrap();
        let t0 = Utc::now();

        ledger.record_applied("0001_create_orders", t0).unwrap();
        ledger
            .record_applied("0002_create_order_items", t0 + Duration::seconds(1))
            .unwrap();

        assert!(ledger.is_applied("0001_create_orders").unwrap());
        assert!(!ledger.is_applied("0003_missing").unwrap());

        let records = ledger.list_applied().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "0001_create_orders");
        assert_eq!(records[1].name, "0002_create_order_items");
        assert_eq!(
            records[0].applied_at.timestamp_micros(),
            t0.timestamp_micros()
        );

        assert!(ledger.remove_record("0002_create_order_items").unwrap());
        assert!(!ledger.remove_record("0002_create_order_items").unwrap());
        assert_eq!(
            ledger.latest().unwrap().map(|r| r.name),
            Some("0001_create_orders".to_string())
        );
    }

    #[test]
    fn test_duplicate_record_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = MigrationLedger::open(&conn).unwrap();
        ledger.record_applied("m", Utc::now()).unwrap();

        let err = ledger.record_applied("m", Utc::now()).unwrap_err();
        assert!(matches!(err, MigrationError::AlreadyRecorded { .. }));
        assert_eq!(ledger.list_applied().unwrap().len(), 1);
    }

    #[test]
    fn test_same_timestamp_keeps_insertion_order() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = MigrationLedger::open(&conn).unwrap();
        let at = Utc::now();
        ledger.record_applied("b_second_name", at).unwrap();
        ledger.record_applied("a_first_name", at).unwrap();

        let names: Vec<_> = ledger
            .list_applied()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["b_second_name", "a_first_name"]);
    }

    #[test]
    fn test_corrupt_timestamp_is_reported() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = MigrationLedger::open(&conn).unwrap();
        conn.execute(
            &format!("INSERT INTO {LEDGER_TABLE} (name, applied_at) VALUES ('x', 'yesterday')"),
            [],
        )
        .unwrap();
        assert!(matches!(
            ledger.list_applied().unwrap_err(),
            MigrationError::InvalidData(_)
        ));
    }
}
