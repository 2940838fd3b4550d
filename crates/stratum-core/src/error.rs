//! Engine error types.

use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::migration::state::Step;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// CLI exit code for a successful run.
pub const EXIT_SUCCESS: i32 = 0;

/// CLI exit code for any failure other than a lock timeout.
pub const EXIT_FAILURE: i32 = 1;

/// CLI exit code when the run-lock could not be acquired.
pub const EXIT_LOCK_TIMEOUT: i32 = 2;

/// Errors raised by the schema evolution engine.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Transport or authorization failure talking to the data store.
    #[error("connectivity error: {0}")]
    Connectivity(#[source] rusqlite::Error),

    /// Any other driver failure.
    #[error("database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// The run-lock was held by someone else for the whole wait window.
    #[error("could not acquire run-lock '{lock}' within {waited:?}")]
    LockTimeout {
        /// Name of the lock.
        lock: String,
        /// How long we waited.
        waited: Duration,
    },

    /// Our run-lock expired and another runner took it over.
    #[error("run-lock '{lock}' was lost: its lease expired and another runner took it over")]
    LockLost {
        /// Name of the lock.
        lock: String,
    },

    /// Rows still match a backfill predicate after the backfill ran.
    #[error("backfill incomplete on {table}: {remaining} row(s) still match `{predicate}`")]
    BackfillIncomplete {
        /// Table being backfilled.
        table: String,
        /// Predicate selecting rows that need transformation.
        predicate: String,
        /// Rows still matching.
        remaining: u64,
    },

    /// A reversal is blocked by an object that depends on its target.
    #[error("cannot remove {object}: {dependent} depends on it")]
    DependentObject {
        /// The object we tried to remove.
        object: String,
        /// The object that blocks removal.
        dependent: String,
    },

    /// Two definitions share a name.
    #[error("duplicate migration name: {name}")]
    DuplicateMigration {
        /// The colliding name.
        name: String,
    },

    /// Two definitions share a version key.
    #[error("duplicate migration version {version}: {existing} and {name}")]
    DuplicateVersion {
        /// The colliding version key.
        version: u64,
        /// Name already registered under this version.
        existing: String,
        /// Name being registered.
        name: String,
    },

    /// A definition failed validation at registration time.
    #[error("invalid migration {name}: {reason}")]
    InvalidDefinition {
        /// The definition name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A pending migration sorts before one that is already applied.
    #[error("migration {name} is pending but later migration {latest_applied} is already applied")]
    OutOfOrder {
        /// The pending migration.
        name: String,
        /// The newest applied migration.
        latest_applied: String,
    },

    /// The requested target name is not registered.
    #[error("unknown migration: {name}")]
    UnknownMigration {
        /// The requested name.
        name: String,
    },

    /// The requested rollback target has not been applied.
    #[error("migration {name} is not applied")]
    NotApplied {
        /// The requested name.
        name: String,
    },

    /// The ledger names a migration the registry does not know.
    #[error("applied migration {name} is not registered and cannot be reverted")]
    Unregistered {
        /// The ledger entry name.
        name: String,
    },

    /// A ledger entry already exists for this name.
    #[error("migration {name} is already recorded as applied")]
    AlreadyRecorded {
        /// The migration name.
        name: String,
    },

    /// A step would destroy data and the caller did not opt in.
    #[error("{operation} is destructive; {requirement}")]
    UnsafeOperation {
        /// The operation being attempted.
        operation: String,
        /// What the caller must do to proceed.
        requirement: String,
    },

    /// A schema object the step needs is missing.
    #[error("{object} does not exist")]
    Missing {
        /// Description of the missing object.
        object: String,
    },

    /// A post-condition check failed.
    #[error("verification failed: {message}")]
    VerificationFailed {
        /// What did not hold.
        message: String,
    },

    /// The run was cancelled at a chunk boundary.
    #[error("interrupted before {migration} completed")]
    Interrupted {
        /// The in-flight migration.
        migration: String,
    },

    /// A migration failed in one of its sub-steps.
    #[error("{migration} failed while {step}: {source}")]
    StepFailed {
        /// The failing migration.
        migration: String,
        /// The sub-step that failed.
        step: Step,
        /// Underlying cause.
        source: Box<MigrationError>,
    },

    /// Stored data could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl MigrationError {
    /// Wrap an error with the migration name and sub-step it happened in.
    ///
    /// Interruptions pass through unwrapped.
    pub fn at_step(self, migration: impl Into<String>, step: Step) -> Self {
        match self {
            MigrationError::Interrupted { .. } | MigrationError::StepFailed { .. } => self,
            other => MigrationError::StepFailed {
                migration: migration.into(),
                step,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through step wrappers.
    pub fn root_cause(&self) -> &MigrationError {
        match self {
            MigrationError::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            MigrationError::LockTimeout { .. } => EXIT_LOCK_TIMEOUT,
            _ => EXIT_FAILURE,
        }
    }

    /// Whether the driver reported the database as busy or locked.
    pub(crate) fn is_busy(error: &rusqlite::Error) -> bool {
        matches!(
            error.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
        )
    }

    /// Whether the driver reported a constraint violation.
    pub(crate) fn is_constraint(error: &rusqlite::Error) -> bool {
        matches!(error.sqlite_error_code(), Some(ErrorCode::ConstraintViolation))
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(error: rusqlite::Error) -> Self {
        match error.sqlite_error_code() {
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::AuthorizationForStatementDenied
                | ErrorCode::PermissionDenied
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt,
            ) => MigrationError::Connectivity(error),
            _ => MigrationError::Database(error),
        }
    }
}
