//! Chunked backfill of existing rows.
//!
//! A backfill selects rows matching a predicate in ascending key order and
//! rewrites them in bounded chunks, one transaction per chunk. Because rows
//! that were already fixed no longer match the predicate, re-running a
//! backfill after an interruption resumes with exactly the remaining rows.

use std::fmt::Write as _;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

use super::state::CancellationToken;
use crate::config::BackfillConfig;
use crate::error::{MigrationError, Result};
use crate::lock::LockLease;
use crate::schema::{quote_ident, SchemaInspector};

/// Value written by an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignValue {
    /// A bound parameter.
    Literal(Value),
    /// A SQL expression evaluated per row, e.g. a correlated subquery.
    Expression(String),
}

/// `column = value` inside a backfill's UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Target column.
    pub column: String,
    /// New value.
    pub value: AssignValue,
}

/// What rows to fix and how.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillSpec {
    /// Target table.
    pub table: String,
    /// Column giving rows a stable ascending order.
    pub key_column: String,
    /// SQL boolean expression selecting rows that still need the transform.
    pub predicate: String,
    /// Values to write.
    pub assignments: Vec<Assignment>,
    /// Rows per chunk; `None` uses the configured default.
    pub batch_size: Option<usize>,
}

impl BackfillSpec {
    /// Backfill of `table` rows matching `predicate`, keyed by `id`.
    pub fn new(table: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_column: "id".to_string(),
            predicate: predicate.into(),
            assignments: Vec::new(),
            batch_size: None,
        }
    }

    /// Set `column` to a literal value.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push(Assignment {
            column: column.into(),
            value: AssignValue::Literal(value.into()),
        });
        self
    }

    /// Set `column` to a SQL expression.
    pub fn set_expr(mut self, column: impl Into<String>, expr: impl Into<String>) -> Self {
        self.assignments.push(Assignment {
            column: column.into(),
            value: AssignValue::Expression(expr.into()),
        });
        self
    }

    /// Order chunks by `column` instead of `id`.
    pub fn key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = column.into();
        self
    }

    /// Rows per chunk.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    /// Whether the backfill writes `column`.
    pub fn assigns(&self, column: &str) -> bool {
        self.assignments
            .iter()
            .any(|a| a.column.eq_ignore_ascii_case(column))
    }

    /// Human-readable summary.
    pub fn describe(&self) -> String {
        let columns = self
            .assignments
            .iter()
            .map(|a| a.column.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!("Backfill {}.{{{}}} where {}", self.table, columns, self.predicate)
    }

    fn update_sql(&self, bounded_below: bool) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("UPDATE {} SET ", quote_ident(&self.table));
        for (i, assignment) in self.assignments.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            match &assignment.value {
                AssignValue::Literal(value) => {
                    params.push(value.clone());
                    let _ = write!(sql, "{} = ?{}", quote_ident(&assignment.column), params.len());
                }
                AssignValue::Expression(expr) => {
                    let _ = write!(sql, "{} = ({})", quote_ident(&assignment.column), expr);
                }
            }
        }

        let key = quote_ident(&self.key_column);
        let _ = write!(sql, " WHERE ({}) AND {key} <= ?{}", self.predicate, params.len() + 1);
        if bounded_below {
            let _ = write!(sql, " AND {key} > ?{}", params.len() + 2);
        }
        (sql, params)
    }

    fn select_keys_sql(&self, bounded_below: bool) -> String {
        let key = quote_ident(&self.key_column);
        let lower = if bounded_below {
            format!(" AND {key} > ?1")
        } else {
            String::new()
        };
        let limit = if bounded_below { "?2" } else { "?1" };
        format!(
            "SELECT {key} FROM {} WHERE ({}){lower} ORDER BY {key} LIMIT {limit}",
            quote_ident(&self.table),
            self.predicate
        )
    }
}

/// Progress after a committed chunk.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillProgress {
    /// Migration being applied.
    pub migration: String,
    /// Table being backfilled.
    pub table: String,
    /// 1-based index of the chunk just committed.
    pub chunk: u64,
    /// Rows rewritten so far.
    pub processed: u64,
    /// Rows matching the predicate when the backfill started.
    pub total: u64,
    /// Completion percentage against `total`.
    pub percent: f64,
}

/// Callback receiving every progress report.
pub type ProgressFn = dyn Fn(&BackfillProgress) + Send + Sync;

/// Result of a finished backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillOutcome {
    /// Chunks committed.
    pub chunks: u64,
    /// Rows rewritten.
    pub rows: u64,
}

/// Runs backfills against a connection.
pub struct BackfillExecutor<'c> {
    conn: &'c Connection,
    config: BackfillConfig,
    lease: Option<LockLease>,
}

impl<'c> BackfillExecutor<'c> {
    /// Create a new backfill executor.
    pub fn new(conn: &'c Connection, config: BackfillConfig) -> Self {
        Self {
            conn,
            config,
            lease: None,
        }
    }

    /// Renew this run-lock after every committed chunk.
    pub fn with_lease(mut self, lease: LockLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Rewrite every row matching the predicate, chunk by chunk.
    ///
    /// Cancellation is checked before each chunk; a cancelled run returns
    /// [`MigrationError::Interrupted`] with all earlier chunks committed.
    pub fn run(
        &self,
        migration: &str,
        spec: &BackfillSpec,
        cancel: &CancellationToken,
        observer: Option<&ProgressFn>,
    ) -> Result<BackfillOutcome> {
        let inspector = SchemaInspector::new(self.conn);
        let total = inspector.count_matching(&spec.table, &spec.predicate)?;
        if total == 0 {
            tracing::debug!(migration, table = %spec.table, "no rows need backfill");
            return Ok(BackfillOutcome::default());
        }

        let batch_size = spec
            .batch_size
            .unwrap_or(self.config.default_batch_size)
            .max(1);
        tracing::info!(migration, table = %spec.table, rows = total, batch_size, "starting backfill");

        let mut outcome = BackfillOutcome::default();
        let mut cursor: Option<Value> = None;

        loop {
            if cancel.is_cancelled() {
                tracing::warn!(migration, chunk = outcome.chunks, rows = outcome.rows, "backfill interrupted");
                return Err(MigrationError::Interrupted {
                    migration: migration.to_string(),
                });
            }

            let keys = self.next_keys(spec, cursor.as_ref(), batch_size)?;
            let Some(last) = keys.last().cloned() else {
                break;
            };

            let updated = self.update_chunk(spec, cursor.as_ref(), &last)?;
            outcome.chunks += 1;
            outcome.rows += updated as u64;
            cursor = Some(last);
            if let Some(lease) = &self.lease {
                lease.renew(self.conn)?;
            }

            let progress = BackfillProgress {
                migration: migration.to_string(),
                table: spec.table.clone(),
                chunk: outcome.chunks,
                processed: outcome.rows,
                total,
                percent: (outcome.rows as f64 * 100.0 / total as f64).min(100.0),
            };
            tracing::debug!(
                migration,
                table = %spec.table,
                chunk = progress.chunk,
                rows = progress.processed,
                "backfill chunk committed"
            );
            if let Some(observer) = observer {
                observer(&progress);
            }

            if keys.len() < batch_size {
                break;
            }
            if !self.config.batch_delay.is_zero() {
                std::thread::sleep(self.config.batch_delay);
            }
        }

        tracing::info!(migration, table = %spec.table, chunks = outcome.chunks, rows = outcome.rows, "backfill finished");
        Ok(outcome)
    }

    fn next_keys(
        &self,
        spec: &BackfillSpec,
        cursor: Option<&Value>,
        batch_size: usize,
    ) -> Result<Vec<Value>> {
        let mut stmt = self.conn.prepare(&spec.select_keys_sql(cursor.is_some()))?;
        let limit = Value::Integer(batch_size as i64);
        let params: Vec<&Value> = match cursor {
            Some(cursor) => vec![cursor, &limit],
            None => vec![&limit],
        };
        let keys = stmt
            .query_map(params_from_iter(params), |row| row.get::<_, Value>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn update_chunk(&self, spec: &BackfillSpec, cursor: Option<&Value>, last: &Value) -> Result<usize> {
        let (sql, mut params) = spec.update_sql(cursor.is_some());
        params.push(last.clone());
        if let Some(cursor) = cursor {
            params.push(cursor.clone());
        }

        let tx = self.conn.unchecked_transaction()?;
        let updated = tx.execute(&sql, params_from_iter(params))?;
        tx.commit()?;
        Ok(updated)
    }
}
