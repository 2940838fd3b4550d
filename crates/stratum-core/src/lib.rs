//! Stratum Core - schema evolution and backfill engine for SQLite.
//!
//! This crate advances a live schema through an ordered set of migrations,
//! each pairing structural changes with an optional chunked backfill, and
//! records what took effect in a durable ledger.

pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod migration;
pub mod schema;

pub use config::{BackfillConfig, LockConfig, RunnerConfig};
pub use error::{MigrationError, Result, EXIT_FAILURE, EXIT_LOCK_TIMEOUT, EXIT_SUCCESS};
pub use ledger::{MigrationLedger, MigrationRecord};
pub use lock::{LockHolder, LockLease, RunLock};
pub use migration::{
    BackfillSpec, CancellationToken, ColumnDef, MigrationDefinition, MigrationRegistry,
    MigrationRunner, MigrationStatus, RollbackTarget, SafetyGrade, SchemaChange, StatusEntry,
};
pub use schema::{ColumnInfo, SchemaInspector, SchemaSnapshot};
