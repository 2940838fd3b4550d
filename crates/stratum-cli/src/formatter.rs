//! Output formatters for runner reports.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{Cell, Table};
use stratum_core::migration::{RollbackReport, RunReport, StatusEntry};
use stratum_core::MigrationError;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format the state of every known migration.
    fn format_status(&self, entries: &[StatusEntry]) -> String;

    /// Format the outcome of `up`.
    fn format_run_report(&self, report: &RunReport) -> String;

    /// Format the outcome of `down`.
    fn format_rollback_report(&self, report: &RollbackReport) -> String;

    /// Format the outcome of `unlock`.
    fn format_unlock(&self, released: bool) -> String;

    /// Format an error.
    fn format_error(&self, error: &MigrationError) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_status(&self, entries: &[StatusEntry]) -> String {
        if entries.is_empty() {
            return "No migrations".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Version", "Name", "Grade", "State", "Applied At"]);
        for entry in entries {
            table.add_row(vec![
                Cell::new(entry.version.map(|v| v.to_string()).unwrap_or_default()),
                Cell::new(&entry.name),
                Cell::new(entry.grade.map(|g| g.to_string()).unwrap_or_default()),
                Cell::new(entry.status.to_string()),
                Cell::new(entry.applied_at.as_ref().map(format_time).unwrap_or_default()),
            ]);
        }
        table.to_string()
    }

    fn format_run_report(&self, report: &RunReport) -> String {
        let mut output = String::new();

        if report.planned.is_empty() {
            output.push_str("Schema is up to date");
        } else if report.dry_run {
            output.push_str(&format!(
                "Dry run: {} migration(s) would be applied\n",
                report.planned.len()
            ));
            output.push_str(&name_table(&report.planned));
        } else {
            let mut table = Table::new();
            table.set_header(vec![
                "Version",
                "Name",
                "Grade",
                "Changes",
                "Skipped",
                "Rows Backfilled",
                "Applied At",
            ]);
            for applied in &report.applied {
                table.add_row(vec![
                    Cell::new(applied.version),
                    Cell::new(&applied.name),
                    Cell::new(applied.grade),
                    Cell::new(applied.changes_applied),
                    Cell::new(applied.changes_skipped),
                    Cell::new(applied.rows_backfilled),
                    Cell::new(format_time(&applied.applied_at)),
                ]);
            }
            output.push_str(&format!("{} migration(s) applied\n", report.applied.len()));
            output.push_str(&table.to_string());
        }

        for warning in &report.warnings {
            output.push_str(&format!("\nwarning: {}", warning));
        }
        output
    }

    fn format_rollback_report(&self, report: &RollbackReport) -> String {
        if report.planned.is_empty() {
            return "Nothing to roll back".to_string();
        }
        if report.dry_run {
            return format!(
                "Dry run: {} migration(s) would be rolled back\n{}",
                report.planned.len(),
                name_table(&report.planned)
            );
        }

        let mut table = Table::new();
        table.set_header(vec!["Version", "Name", "Changes Reverted"]);
        for reverted in &report.reverted {
            table.add_row(vec![
                Cell::new(reverted.version),
                Cell::new(&reverted.name),
                Cell::new(reverted.changes_reverted),
            ]);
        }
        format!("{} migration(s) rolled back\n{}", report.reverted.len(), table)
    }

    fn format_unlock(&self, released: bool) -> String {
        if released {
            "Run-lock released".to_string()
        } else {
            "Run-lock was not held".to_string()
        }
    }

    fn format_error(&self, error: &MigrationError) -> String {
        format!("Error: {}", error)
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_status(&self, entries: &[StatusEntry]) -> String {
        to_json(entries)
    }

    fn format_run_report(&self, report: &RunReport) -> String {
        to_json(report)
    }

    fn format_rollback_report(&self, report: &RollbackReport) -> String {
        to_json(report)
    }

    fn format_unlock(&self, released: bool) -> String {
        serde_json::json!({ "released": released }).to_string()
    }

    fn format_error(&self, error: &MigrationError) -> String {
        let (migration, step) = match error {
            MigrationError::StepFailed {
                migration, step, ..
            } => (Some(migration.clone()), Some(step.to_string())),
            MigrationError::Interrupted { migration } => (Some(migration.clone()), None),
            _ => (None, None),
        };
        serde_json::json!({
            "error": error.to_string(),
            "cause": error.root_cause().to_string(),
            "migration": migration,
            "step": step,
            "exit_code": error.exit_code(),
        })
        .to_string()
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| {
        serde_json::json!({ "error": format!("failed to encode output: {}", e) }).to_string()
    })
}

fn name_table(names: &[String]) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Migration"]);
    for name in names {
        table.add_row(vec![name]);
    }
    table.to_string()
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string()
}
