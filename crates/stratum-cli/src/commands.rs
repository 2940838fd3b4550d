//! Command dispatch.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use stratum_core::config::{BackfillConfig, LockConfig, RunnerConfig};
use stratum_core::migration::{BackfillProgress, MigrationRegistry};
use stratum_core::{CancellationToken, MigrationError, MigrationRunner, Result, RollbackTarget};

use crate::formatter::{create_formatter, Formatter};
use crate::migrations;
use crate::{Args, Command, DownArgs, UpArgs};

impl UpArgs {
    /// Runner configuration for an `up` run.
    pub fn into_config(self) -> RunnerConfig {
        let mut backfill = BackfillConfig::default();
        if let Some(size) = self.batch_size {
            backfill = backfill.with_default_batch_size(size);
        }
        RunnerConfig::default()
            .with_backfill(backfill)
            .with_lock(LockConfig::default().with_timeout(Duration::from_secs(self.lock_timeout)))
            .allow_destructive(self.allow_destructive)
            .dry_run(self.dry_run)
    }
}

impl DownArgs {
    /// Runner configuration for a `down` run.
    pub fn into_config(self) -> RunnerConfig {
        RunnerConfig::default()
            .with_lock(LockConfig::default().with_timeout(Duration::from_secs(self.lock_timeout)))
            .accept_data_loss(self.accept_data_loss)
            .dry_run(self.dry_run)
    }

    /// What to roll back to.
    pub fn target(&self) -> RollbackTarget {
        match (&self.to, self.steps) {
            (Some(name), _) => RollbackTarget::To(name.clone()),
            (None, Some(steps)) => RollbackTarget::Steps(steps),
            (None, None) => RollbackTarget::default(),
        }
    }
}

/// Run one command against the database named in `args`.
///
/// Returns the formatted output on success.
pub fn execute(args: Args, cancel: CancellationToken) -> Result<String> {
    let conn = open(&args.database)?;
    let formatter = create_formatter(args.format);
    run(&conn, migrations::registry()?, args.command, cancel, &*formatter)
}

/// Open the database and make sure it is readable.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(MigrationError::Connectivity)?;
    conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
        .map_err(MigrationError::Connectivity)?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    Ok(conn)
}

/// Dispatch `command` to a runner over `conn`.
pub fn run(
    conn: &Connection,
    registry: MigrationRegistry,
    command: Command,
    cancel: CancellationToken,
    formatter: &dyn Formatter,
) -> Result<String> {
    match command {
        Command::Up(up) => {
            let target = up.to.clone();
            let mut runner = MigrationRunner::new(conn, registry, up.into_config())
                .with_cancellation(cancel)
                .with_progress(log_progress);
            let report = runner.up(target.as_deref())?;
            Ok(formatter.format_run_report(&report))
        }
        Command::Down(down) => {
            let target = down.target();
            let mut runner = MigrationRunner::new(conn, registry, down.into_config())
                .with_cancellation(cancel);
            let report = runner.down(target)?;
            Ok(formatter.format_rollback_report(&report))
        }
        Command::Status => {
            let runner = MigrationRunner::new(conn, registry, RunnerConfig::default());
            Ok(formatter.format_status(&runner.status()?))
        }
        Command::Unlock => {
            let runner = MigrationRunner::new(conn, registry, RunnerConfig::default());
            let released = runner.force_unlock()?;
            Ok(formatter.format_unlock(released))
        }
    }
}

fn log_progress(progress: &BackfillProgress) {
    tracing::info!(
        migration = %progress.migration,
        table = %progress.table,
        chunk = progress.chunk,
        rows = progress.processed,
        total = progress.total,
        "backfill {:.1}% complete",
        progress.percent
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::OutputFormat;
    use clap::Parser;
    use stratum_core::SchemaInspector;

    fn parse(argv: &[&str]) -> Command {
        let mut full = vec!["migrate", "--database", "unused.db"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap().command
    }

    fn run_json(conn: &Connection, argv: &[&str]) -> Result<serde_json::Value> {
        let formatter = create_formatter(OutputFormat::Json);
        let output = run(
            conn,
            migrations::registry()?,
            parse(argv),
            CancellationToken::new(),
            &*formatter,
        )?;
        Ok(serde_json::from_str(&output).unwrap())
    }

    #[test]
    fn test_up_args_into_config() {
        let Command::Up(up) = parse(&["up", "--batch-size", "25", "--lock-timeout", "5"]) else {
            panic!("expected up");
        };
        let config = up.into_config();
        assert_eq!(config.backfill.default_batch_size, 25);
        assert_eq!(config.lock.timeout, Duration::from_secs(5));
        assert!(!config.dry_run);
        assert!(!config.accept_data_loss);
    }

    #[test]
    fn test_down_target() {
        let Command::Down(down) = parse(&["down"]) else {
            panic!("expected down");
        };
        assert_eq!(down.target(), RollbackTarget::Steps(1));

        let Command::Down(down) = parse(&["down", "--steps", "3", "--accept-data-loss"]) else {
            panic!("expected down");
        };
        assert_eq!(down.target(), RollbackTarget::Steps(3));
        assert!(down.into_config().accept_data_loss);

        let Command::Down(down) = parse(&["down", "--to", "0002_create_order_items"]) else {
            panic!("expected down");
        };
        assert_eq!(
            down.target(),
            RollbackTarget::To("0002_create_order_items".to_string())
        );
    }

    #[test]
    fn test_open_rejects_non_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.db");
        std::fs::write(&path, "not a database\n".repeat(256)).unwrap();

        let err = open(&path).unwrap_err();
        assert!(matches!(err, MigrationError::Connectivity(_)));
    }

    #[test]
    fn test_up_status_down_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("shop.db")).unwrap();

        let status = run_json(&conn, &["status"]).unwrap();
        let entries = status.as_array().unwrap();
        assert_eq!(entries.len(), migrations::registry().unwrap().len());
        assert!(entries.iter().all(|e| e["status"] == "pending"));

        let report = run_json(&conn, &["up"]).unwrap();
        assert_eq!(
            report["applied"].as_array().unwrap().len(),
            migrations::registry().unwrap().len()
        );

        let status = run_json(&conn, &["status"]).unwrap();
        assert!(status
            .as_array()
            .unwrap()
            .iter()
            .all(|e| e["status"] == "applied" && !e["applied_at"].is_null()));

        // Products is empty, so dropping images loses nothing.
        let report = run_json(&conn, &["down"]).unwrap();
        let reverted = report["reverted"].as_array().unwrap();
        assert_eq!(reverted.len(), 1);
        assert_eq!(reverted[0]["name"], "0007_add_product_images");
        assert!(!SchemaInspector::new(&conn)
            .column_exists("Products", "images")
            .unwrap());

        let status = run_json(&conn, &["status"]).unwrap();
        let last = status.as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["name"], "0007_add_product_images");
        assert_eq!(last["status"], "pending");
    }

    #[test]
    fn test_down_refuses_lossy_rollback_without_acceptance() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("shop.db")).unwrap();
        run_json(&conn, &["up"]).unwrap();
        conn.execute(
            r#"INSERT INTO "Products" (id, name, price) VALUES (1, 'mug', 9.50)"#,
            [],
        )
        .unwrap();

        let err = run_json(&conn, &["down"]).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            MigrationError::UnsafeOperation { .. }
        ));
        assert_eq!(err.exit_code(), stratum_core::EXIT_FAILURE);
        assert!(SchemaInspector::new(&conn)
            .column_exists("Products", "images")
            .unwrap());

        run_json(&conn, &["down", "--accept-data-loss"]).unwrap();
        assert!(!SchemaInspector::new(&conn)
            .column_exists("Products", "images")
            .unwrap());
    }

    #[test]
    fn test_dry_run_leaves_database_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("shop.db")).unwrap();

        let report = run_json(&conn, &["up", "--dry-run"]).unwrap();
        assert_eq!(report["dry_run"], true);
        assert_eq!(report["planned"][0], "0001_create_orders");
        assert!(report["applied"].as_array().unwrap().is_empty());
        assert!(!SchemaInspector::new(&conn).table_exists("Orders").unwrap());
    }

    #[test]
    fn test_unlock_without_holder() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(&dir.path().join("shop.db")).unwrap();

        let output = run_json(&conn, &["unlock"]).unwrap();
        assert_eq!(output["released"], false);
    }
}
