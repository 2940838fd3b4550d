//! Migration engine.
//!
//! This module provides safe schema evolution with:
//! - Guarded, re-runnable schema changes
//! - Safety grading (A/B/C/D)
//! - Widen / backfill / tighten / contract ordering
//! - Chunked, resumable backfills
//! - A ledger-driven runner with a single run-lock
//!
//! # Safety Grades
//!
//! | Grade | Description | Examples | Behavior |
//! |-------|-------------|----------|----------|
//! | **A** | Additive, non-breaking | New tables, nullable columns, indexes | Applied directly |
//! | **B** | Rewrites existing rows | Backfills, NOT NULL columns with defaults | Chunked backfill |
//! | **C** | Tightens live data | NOT NULL on an existing column | Applied after backfill verification |
//! | **D** | Destructive | Column removal | Requires `allow_destructive` |
//!
//! # Example
//!
//! ```no_run
//! use rusqlite::Connection;
//! use stratum_core::config::RunnerConfig;
//! use stratum_core::migration::{
//!     BackfillSpec, ColumnDef, MigrationDefinition, MigrationRegistry, MigrationRunner,
//!     SchemaChange,
//! };
//!
//! # fn main() -> stratum_core::Result<()> {
//! let conn = Connection::open("shop.db")?;
//! let mut registry = MigrationRegistry::new();
//! registry.register(
//!     MigrationDefinition::new(5, "0005_add_order_shipping")
//!         .change(SchemaChange::add_column(
//!             "Orders",
//!             ColumnDef::new("shipping", "NUMERIC").default("0.00"),
//!         ))
//!         .backfill(
//!             BackfillSpec::new("Orders", "shipping IS NULL OR shipping = 0").set("shipping", 5.00),
//!         )
//!         .change(SchemaChange::set_not_null("Orders", "shipping", Some("0.00"))),
//! )?;
//!
//! let mut runner = MigrationRunner::new(&conn, registry, RunnerConfig::default());
//! let report = runner.up(None)?;
//! println!("applied {} migration(s)", report.applied.len());
//! # Ok(())
//! # }
//! ```

pub mod backfill;
pub mod definition;
pub mod executor;
pub mod grader;
pub mod registry;
pub mod state;

// Backfill types
pub use backfill::{
    AssignValue, Assignment, BackfillExecutor, BackfillOutcome, BackfillProgress, BackfillSpec,
    ProgressFn,
};

// Definition types
pub use definition::{
    ApplySummary, ChangeOutcome, ChangePhase, ColumnDef, MigrationDefinition, SchemaChange,
};

// Executor types
pub use executor::{
    AppliedMigration, MigrationRunner, RevertedMigration, RollbackReport, RollbackTarget,
    RunReport,
};

// Grader types
pub use grader::{ChangeGrade, MigrationGrade, SafetyGrade, SafetyGrader};

// Registry
pub use registry::MigrationRegistry;

// State types
pub use state::{CancellationToken, MigrationStatus, RunPhase, RunState, StatusEntry, Step};
