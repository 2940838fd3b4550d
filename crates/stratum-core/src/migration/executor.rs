//! Migration runner - orchestrates batches of migrations.
//!
//! A batch diffs the registry against the ledger, takes the run-lock, and then
//! applies (or reverts) one definition at a time. Each definition is atomic
//! with respect to its own ledger entry; the batch as a whole is not.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::backfill::{BackfillExecutor, BackfillProgress, ProgressFn};
use super::definition::MigrationDefinition;
use super::grader::SafetyGrade;
use super::registry::MigrationRegistry;
use super::state::{
    CancellationToken, MigrationStatus, RunPhase, RunState, StatusEntry, Step,
};
use crate::config::RunnerConfig;
use crate::error::{MigrationError, Result};
use crate::ledger::MigrationLedger;
use crate::lock::RunLock;

/// How far `down` goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// The most recent `n` applied migrations.
    Steps(usize),
    /// Everything applied after the named migration, and the migration itself.
    To(String),
}

impl Default for RollbackTarget {
    fn default() -> Self {
        RollbackTarget::Steps(1)
    }
}

/// A migration applied by `up`.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    /// Version key.
    pub version: u64,
    /// Migration name.
    pub name: String,
    /// Overall safety grade.
    pub grade: SafetyGrade,
    /// Structural changes executed.
    pub changes_applied: usize,
    /// Structural changes skipped because they already held.
    pub changes_skipped: usize,
    /// Rows rewritten by the backfill.
    pub rows_backfilled: u64,
    /// Ledger timestamp.
    pub applied_at: DateTime<Utc>,
}

/// Result of `up`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Whether nothing was executed.
    pub dry_run: bool,
    /// Migrations selected for this batch.
    pub planned: Vec<String>,
    /// Migrations applied, in order.
    pub applied: Vec<AppliedMigration>,
    /// Grader warnings for the planned migrations.
    pub warnings: Vec<String>,
}

/// A migration reverted by `down`.
#[derive(Debug, Clone, Serialize)]
pub struct RevertedMigration {
    /// Version key.
    pub version: u64,
    /// Migration name.
    pub name: String,
    /// Structural changes undone.
    pub changes_reverted: usize,
}

/// Result of `down`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    /// Whether nothing was executed.
    pub dry_run: bool,
    /// Migrations selected for rollback, most recent first.
    pub planned: Vec<String>,
    /// Migrations reverted, in order.
    pub reverted: Vec<RevertedMigration>,
}

/// Applies and rolls back registered migrations against one connection.
pub struct MigrationRunner<'c> {
    conn: &'c Connection,
    registry: MigrationRegistry,
    config: RunnerConfig,
    state: RunState,
    cancel: CancellationToken,
    observer: Option<Box<ProgressFn>>,
}

impl<'c> MigrationRunner<'c> {
    /// Create a runner. The caller keeps ownership of the connection.
    pub fn new(conn: &'c Connection, registry: MigrationRegistry, config: RunnerConfig) -> Self {
        Self {
            conn,
            registry,
            config,
            state: RunState::new(),
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    /// Use `token` to stop a run at the next backfill chunk boundary.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Receive a report after every backfill chunk.
    pub fn with_progress(
        mut self,
        observer: impl Fn(&BackfillProgress) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// The registry this runner works from.
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Current phase.
    pub fn phase(&self) -> RunPhase {
        self.state.phase()
    }

    /// Phases visited by the latest batch.
    pub fn history(&self) -> &[RunPhase] {
        self.state.history()
    }

    /// Every registered migration plus any unregistered ledger entries.
    pub fn status(&self) -> Result<Vec<StatusEntry>> {
        let ledger = MigrationLedger::open(self.conn)?;
        let records = ledger.list_applied()?;
        let applied: HashMap<&str, DateTime<Utc>> = records
            .iter()
            .map(|r| (r.name.as_str(), r.applied_at))
            .collect();

        let mut entries: Vec<StatusEntry> = self
            .registry
            .all()
            .map(|definition| {
                let applied_at = applied.get(definition.name()).copied();
                StatusEntry {
                    version: Some(definition.version()),
                    name: definition.name().to_string(),
                    description: definition.description().map(str::to_string),
                    grade: Some(definition.grade().overall_grade),
                    status: if applied_at.is_some() {
                        MigrationStatus::Applied
                    } else {
                        MigrationStatus::Pending
                    },
                    applied_at,
                }
            })
            .collect();

        entries.extend(
            records
                .iter()
                .filter(|r| !self.registry.contains(&r.name))
                .map(|r| StatusEntry {
                    version: None,
                    name: r.name.clone(),
                    description: None,
                    grade: None,
                    status: MigrationStatus::Unregistered,
                    applied_at: Some(r.applied_at),
                }),
        );

        Ok(entries)
    }

    /// Registered migrations not yet in the ledger, ascending by version.
    ///
    /// Fails with [`MigrationError::OutOfOrder`] if a pending migration sorts
    /// before one that is already applied.
    pub fn pending(&self) -> Result<Vec<&MigrationDefinition>> {
        let ledger = MigrationLedger::open(self.conn)?;
        let applied: HashSet<String> = ledger
            .list_applied()?
            .into_iter()
            .map(|r| r.name)
            .collect();

        let newest_applied = self
            .registry
            .all()
            .filter(|d| applied.contains(d.name()))
            .last();
        let pending: Vec<_> = self
            .registry
            .all()
            .filter(|d| !applied.contains(d.name()))
            .collect();

        if let (Some(newest), Some(first)) = (newest_applied, pending.first()) {
            if first.version() < newest.version() {
                return Err(MigrationError::OutOfOrder {
                    name: first.name().to_string(),
                    latest_applied: newest.name().to_string(),
                });
            }
        }
        Ok(pending)
    }

    /// Migrations `up` would apply, optionally stopping at `target`.
    pub fn plan_up(&self, target: Option<&str>) -> Result<Vec<&MigrationDefinition>> {
        let limit = match target {
            Some(name) => Some(
                self.registry
                    .get(name)
                    .ok_or_else(|| MigrationError::UnknownMigration {
                        name: name.to_string(),
                    })?
                    .version(),
            ),
            None => None,
        };
        Ok(self
            .pending()?
            .into_iter()
            .filter(|d| limit.map_or(true, |limit| d.version() <= limit))
            .collect())
    }

    /// Migrations `down` would revert, most recent first.
    pub fn plan_down(&self, target: &RollbackTarget) -> Result<Vec<&MigrationDefinition>> {
        let ledger = MigrationLedger::open(self.conn)?;
        let applied = ledger.list_applied()?;

        let count = match target {
            RollbackTarget::Steps(n) => (*n).min(applied.len()),
            RollbackTarget::To(name) => match applied.iter().rposition(|r| &r.name == name) {
                Some(position) => applied.len() - position,
                None if self.registry.contains(name) => {
                    return Err(MigrationError::NotApplied { name: name.clone() })
                }
                None => return Err(MigrationError::UnknownMigration { name: name.clone() }),
            },
        };

        applied
            .iter()
            .rev()
            .take(count)
            .map(|record| {
                self.registry
                    .get(&record.name)
                    .ok_or_else(|| MigrationError::Unregistered {
                        name: record.name.clone(),
                    })
            })
            .collect()
    }

    /// Apply pending migrations, through `target` if given.
    pub fn up(&mut self, target: Option<&str>) -> Result<RunReport> {
        self.state.advance(RunPhase::Loading);
        let result = self.run_up(target);
        if let Err(e) = &result {
            tracing::error!(error = %e, "migration batch failed");
            self.state.advance(RunPhase::Failed);
        }
        result
    }

    /// Roll back applied migrations, most recent first.
    pub fn down(&mut self, target: RollbackTarget) -> Result<RollbackReport> {
        self.state.advance(RunPhase::Loading);
        let result = self.run_down(&target);
        if let Err(e) = &result {
            tracing::error!(error = %e, "rollback failed");
            self.state.advance(RunPhase::Failed);
        }
        result
    }

    /// Remove a run-lock left behind by a crashed process.
    pub fn force_unlock(&self) -> Result<bool> {
        RunLock::force_release(self.conn, &self.config.lock.name)
    }

    fn run_up(&mut self, target: Option<&str>) -> Result<RunReport> {
        let planned = self.planned_up(target)?;
        let mut report = RunReport {
            dry_run: self.config.dry_run,
            planned: planned.iter().map(|d| d.name().to_string()).collect(),
            applied: Vec::new(),
            warnings: planned.iter().flat_map(|d| d.grade().warnings).collect(),
        };

        if self.config.dry_run || planned.is_empty() {
            if planned.is_empty() {
                tracing::info!("schema is up to date");
            }
            self.state.advance(RunPhase::Done);
            return Ok(report);
        }
        self.check_destructive(&planned)?;

        let lock = RunLock::acquire(self.conn, &self.config.lock)?;
        self.state.advance(RunPhase::Locked);

        // Another runner may have applied some of these while we waited.
        let planned = self.planned_up(target)?;
        self.check_destructive(&planned)?;
        report.planned = planned.iter().map(|d| d.name().to_string()).collect();

        let ledger = MigrationLedger::open(self.conn)?;
        let backfill =
            BackfillExecutor::new(self.conn, self.config.backfill.clone()).with_lease(lock.lease());
        for (index, definition) in planned.iter().enumerate() {
            self.check_cancelled(definition)?;
            lock.renew()?;
            let applied = self.apply_one(index, definition, &ledger, &backfill)?;
            report.applied.push(applied);
        }

        self.state.advance(RunPhase::Unlocking);
        lock.release()?;
        self.state.advance(RunPhase::Done);
        tracing::info!(applied = report.applied.len(), "migration batch complete");
        Ok(report)
    }

    fn run_down(&mut self, target: &RollbackTarget) -> Result<RollbackReport> {
        let planned = self.planned_down(target)?;
        let mut report = RollbackReport {
            dry_run: self.config.dry_run,
            planned: planned.iter().map(|d| d.name().to_string()).collect(),
            reverted: Vec::new(),
        };

        if self.config.dry_run || planned.is_empty() {
            if planned.is_empty() {
                tracing::info!("nothing to roll back");
            }
            self.state.advance(RunPhase::Done);
            return Ok(report);
        }

        let lock = RunLock::acquire(self.conn, &self.config.lock)?;
        self.state.advance(RunPhase::Locked);

        let planned = self.planned_down(target)?;
        report.planned = planned.iter().map(|d| d.name().to_string()).collect();

        let ledger = MigrationLedger::open(self.conn)?;
        for (index, definition) in planned.iter().enumerate() {
            self.check_cancelled(definition)?;
            lock.renew()?;
            let reverted = self.revert_one(index, definition, &ledger)?;
            report.reverted.push(reverted);
        }

        self.state.advance(RunPhase::Unlocking);
        lock.release()?;
        self.state.advance(RunPhase::Done);
        tracing::info!(reverted = report.reverted.len(), "rollback complete");
        Ok(report)
    }

    fn apply_one(
        &mut self,
        index: usize,
        definition: &MigrationDefinition,
        ledger: &MigrationLedger<'_>,
        backfill: &BackfillExecutor<'_>,
    ) -> Result<AppliedMigration> {
        let name = definition.name();
        let grade = definition.grade();

        self.state.advance(RunPhase::Running(index, Step::Applying));
        tracing::info!(migration = name, version = definition.version(), grade = grade.overall_grade.letter(), "applying");
        let summary = definition
            .up(self.conn, backfill, &self.cancel, self.observer.as_deref())
            .map_err(|e| e.at_step(name, Step::Applying))?;

        self.state.advance(RunPhase::Running(index, Step::Verifying));
        definition
            .verify(self.conn)
            .map_err(|e| e.at_step(name, Step::Verifying))?;

        self.state.advance(RunPhase::Running(index, Step::Recording));
        let applied_at = record_time(ledger).map_err(|e| e.at_step(name, Step::Recording))?;
        ledger
            .record_applied(name, applied_at)
            .map_err(|e| e.at_step(name, Step::Recording))?;

        tracing::info!(
            migration = name,
            applied = summary.applied,
            skipped = summary.skipped,
            rows = summary.backfill.rows,
            "migration applied"
        );
        Ok(AppliedMigration {
            version: definition.version(),
            name: name.to_string(),
            grade: grade.overall_grade,
            changes_applied: summary.applied,
            changes_skipped: summary.skipped,
            rows_backfilled: summary.backfill.rows,
            applied_at,
        })
    }

    fn revert_one(
        &mut self,
        index: usize,
        definition: &MigrationDefinition,
        ledger: &MigrationLedger<'_>,
    ) -> Result<RevertedMigration> {
        let name = definition.name();

        self.state.advance(RunPhase::Running(index, Step::Reverting));
        tracing::info!(migration = name, version = definition.version(), "reverting");
        let changes_reverted = definition
            .down(self.conn, self.config.accept_data_loss)
            .map_err(|e| e.at_step(name, Step::Reverting))?;

        self.state.advance(RunPhase::Running(index, Step::VerifyingReversal));
        definition
            .verify_down(self.conn)
            .map_err(|e| e.at_step(name, Step::VerifyingReversal))?;

        self.state.advance(RunPhase::Running(index, Step::Unrecording));
        if !ledger
            .remove_record(name)
            .map_err(|e| e.at_step(name, Step::Unrecording))?
        {
            tracing::warn!(migration = name, "ledger entry was already gone");
        }

        tracing::info!(migration = name, changes = changes_reverted, "migration reverted");
        Ok(RevertedMigration {
            version: definition.version(),
            name: name.to_string(),
            changes_reverted,
        })
    }

    fn planned_up(&self, target: Option<&str>) -> Result<Vec<MigrationDefinition>> {
        Ok(self.plan_up(target)?.into_iter().cloned().collect())
    }

    fn planned_down(&self, target: &RollbackTarget) -> Result<Vec<MigrationDefinition>> {
        Ok(self.plan_down(target)?.into_iter().cloned().collect())
    }

    /// Stop between migrations once cancellation has been requested.
    fn check_cancelled(&self, next: &MigrationDefinition) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::warn!(migration = next.name(), "interrupted before starting");
            return Err(MigrationError::Interrupted {
                migration: next.name().to_string(),
            });
        }
        Ok(())
    }

    fn check_destructive(&self, planned: &[MigrationDefinition]) -> Result<()> {
        if self.config.allow_destructive {
            return Ok(());
        }
        match planned.iter().find(|d| d.grade().is_destructive()) {
            Some(definition) => Err(MigrationError::UnsafeOperation {
                operation: format!("{} (grade {})", definition.name(), SafetyGrade::D.letter()),
                requirement: "pass allow_destructive to apply it".to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Ledger timestamp for the next record; never earlier than the newest one.
fn record_time(ledger: &MigrationLedger<'_>) -> Result<DateTime<Utc>> {
    let now = Utc::now();
    Ok(match ledger.latest()? {
        Some(latest) if latest.applied_at > now => latest.applied_at,
        _ => now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::definition::{ColumnDef, SchemaChange};
    use crate::schema::SchemaInspector;

    fn registry() -> MigrationRegistry {
        MigrationRegistry::from_definitions([
            MigrationDefinition::new(1, "0001_create_orders").change(SchemaChange::create_table(
                "Orders",
                vec![
                    ColumnDef::new("id", "INTEGER").primary_key(),
                    ColumnDef::new("customer", "TEXT").not_null(),
                ],
            )),
            MigrationDefinition::new(2, "0002_add_order_note")
                .change(SchemaChange::add_column("Orders", ColumnDef::new("note", "TEXT"))),
        ])
        .unwrap()
    }

    #[test]
    fn test_up_walks_the_state_machine() {
        let conn = Connection::open_in_memory().unwrap();
        let mut runner = MigrationRunner::new(&conn, registry(), RunnerConfig::default());

        let report = runner.up(None).unwrap();
        assert_eq!(report.applied.len(), 2);
        assert_eq!(runner.phase(), RunPhase::Done);
        assert_eq!(
            runner.history(),
            &[
                RunPhase::Loading,
                RunPhase::Locked,
                RunPhase::Running(0, Step::Applying),
                RunPhase::Running(0, Step::Verifying),
                RunPhase::Running(0, Step::Recording),
                RunPhase::Running(1, Step::Applying),
                RunPhase::Running(1, Step::Verifying),
                RunPhase::Running(1, Step::Recording),
                RunPhase::Unlocking,
                RunPhase::Done,
            ]
        );
    }

    #[test]
    fn test_up_to_target() {
        let conn = Connection::open_in_memory().unwrap();
        let mut runner = MigrationRunner::new(&conn, registry(), RunnerConfig::default());

        let report = runner.up(Some("0001_create_orders")).unwrap();
        assert_eq!(report.planned, vec!["0001_create_orders"]);
        assert_eq!(runner.pending().unwrap().len(), 1);

        let err = runner.up(Some("0042_nope")).unwrap_err();
        assert!(matches!(err, MigrationError::UnknownMigration { .. }));
        assert_eq!(runner.phase(), RunPhase::Failed);
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        let mut runner =
            MigrationRunner::new(&conn, registry(), RunnerConfig::default().dry_run(true));

        let report = runner.up(None).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.planned.len(), 2);
        assert!(report.applied.is_empty());
        assert!(!SchemaInspector::new(&conn).table_exists("Orders").unwrap());
        assert_eq!(runner.history(), &[RunPhase::Loading, RunPhase::Done]);
    }

    #[test]
    fn test_nothing_pending_skips_the_lock() {
        let conn = Connection::open_in_memory().unwrap();
        let mut runner = MigrationRunner::new(&conn, registry(), RunnerConfig::default());
        runner.up(None).unwrap();

        let report = runner.up(None).unwrap();
        assert!(report.planned.is_empty());
        assert_eq!(runner.history(), &[RunPhase::Loading, RunPhase::Done]);
    }

    #[test]
    fn test_destructive_requires_permission() {
        let conn = Connection::open_in_memory().unwrap();
        let mut registry = registry();
        registry
            .register(MigrationDefinition::new(3, "0003_drop_order_note").change(
                SchemaChange::drop_column("Orders", ColumnDef::new("note", "TEXT")),
            ))
            .unwrap();

        let mut runner = MigrationRunner::new(&conn, registry.clone(), RunnerConfig::default());
        let err = runner.up(None).unwrap_err();
        assert!(matches!(err, MigrationError::UnsafeOperation { .. }));
        assert_eq!(runner.pending().unwrap().len(), 3);

        let mut runner = MigrationRunner::new(
            &conn,
            registry,
            RunnerConfig::default().allow_destructive(true),
        );
        assert_eq!(runner.up(None).unwrap().applied.len(), 3);
        assert!(!SchemaInspector::new(&conn).column_exists("Orders", "note").unwrap());
    }

    #[test]
    fn test_plan_down_targets() {
        let conn = Connection::open_in_memory().unwrap();
        let mut runner = MigrationRunner::new(&conn, registry(), RunnerConfig::default());
        runner.up(None).unwrap();

        let names = |plan: Vec<&MigrationDefinition>| {
            plan.into_iter().map(|d| d.name().to_string()).collect::<Vec<_>>()
        };
        assert_eq!(
            names(runner.plan_down(&RollbackTarget::default()).unwrap()),
            vec!["0002_add_order_note"]
        );
        assert_eq!(
            names(runner.plan_down(&RollbackTarget::Steps(10)).unwrap()),
            vec!["0002_add_order_note", "0001_create_orders"]
        );
        assert_eq!(
            names(
                runner
                    .plan_down(&RollbackTarget::To("0001_create_orders".to_string()))
                    .unwrap()
            ),
            vec!["0002_add_order_note", "0001_create_orders"]
        );
        assert!(matches!(
            runner.plan_down(&RollbackTarget::To("0009_nope".to_string())),
            Err(MigrationError::UnknownMigration { .. })
        ));
    }

    #[test]
    fn test_down_reverts_and_unrecords() {
        let conn = Connection::open_in_memory().unwrap();
        let mut runner = MigrationRunner::new(&conn, registry(), RunnerConfig::default());
        runner.up(None).unwrap();

        let report = runner.down(RollbackTarget::Steps(1)).unwrap();
        assert_eq!(report.reverted.len(), 1);
        assert_eq!(report.reverted[0].name, "0002_add_order_note");
        assert!(!SchemaInspector::new(&conn).column_exists("Orders", "note").unwrap());

        let status = runner.status().unwrap();
        assert_eq!(status[0].status, MigrationStatus::Applied);
        assert_eq!(status[1].status, MigrationStatus::Pending);
        assert!(runner.history().contains(&RunPhase::Running(0, Step::Unrecording)));
    }

    #[test]
    fn test_cancelled_before_start_applies_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut runner = MigrationRunner::new(&conn, registry(), RunnerConfig::default())
            .with_cancellation(token);

        let err = runner.up(None).unwrap_err();
        assert!(matches!(err, MigrationError::Interrupted { ref migration } if migration == "0001_create_orders"));
        assert_eq!(runner.phase(), RunPhase::Failed);
        assert!(!SchemaInspector::new(&conn).table_exists("Orders").unwrap());
        assert!(MigrationLedger::open(&conn).unwrap().list_applied().unwrap().is_empty());
        assert!(RunLock::current_holder(&conn, &RunnerConfig::default().lock.name)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cancelled_rollback_reverts_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        let mut runner = MigrationRunner::new(&conn, registry(), RunnerConfig::default());
        runner.up(None).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let mut runner = MigrationRunner::new(&conn, registry(), RunnerConfig::default())
            .with_cancellation(token);
        let err = runner.down(RollbackTarget::Steps(2)).unwrap_err();
        assert!(matches!(err, MigrationError::Interrupted { .. }));
        assert!(SchemaInspector::new(&conn).column_exists("Orders", "note").unwrap());
        assert_eq!(MigrationLedger::open(&conn).unwrap().list_applied().unwrap().len(), 2);
    }

    #[test]
    fn test_status_lists_unregistered_entries() {
        let conn = Connection::open_in_memory().unwrap();
        MigrationLedger::open(&conn)
            .unwrap()
            .record_applied("0000_legacy_bootstrap", Utc::now())
            .unwrap();
        let runner = MigrationRunner::new(&conn, registry(), RunnerConfig::default());

        let status = runner.status().unwrap();
        assert_eq!(status.len(), 3);
        assert_eq!(status[2].name, "0000_legacy_bootstrap");
        assert_eq!(status[2].status, MigrationStatus::Unregistered);
        assert!(status[2].version.is_none());
        assert_eq!(status[0].grade, Some(SafetyGrade::A));

        assert!(matches!(
            runner.plan_down(&RollbackTarget::Steps(1)),
            Err(MigrationError::Unregistered { .. })
        ));
    }
}
