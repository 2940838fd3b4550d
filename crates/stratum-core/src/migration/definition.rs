//! Migration definitions and the schema changes they are built from.
//!
//! A definition applies in a fixed order regardless of how its changes were
//! declared: widening changes, then the backfill, then tightening changes,
//! then contracting changes. `down` walks the same list backwards.

use rusqlite::Connection;

use super::backfill::{BackfillExecutor, BackfillOutcome, BackfillSpec, ProgressFn};
use super::grader::{MigrationGrade, SafetyGrade, SafetyGrader};
use super::state::CancellationToken;
use crate::error::{MigrationError, Result};
use crate::schema::rebuild::{default_clause, rebuild_table, ColumnRewrite};
use crate::schema::{quote_ident, SchemaInspector};

/// Declared column for `CreateTable`, `AddColumn` and `DropColumn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared SQL type.
    pub data_type: String,
    /// Whether NULL is accepted.
    pub nullable: bool,
    /// Default expression.
    pub default: Option<String>,
    /// Whether the column is the table's primary key.
    pub primary_key: bool,
    /// Whether values must be unique.
    pub unique: bool,
    /// Referenced `(table, column)`.
    pub references: Option<(String, String)>,
}

impl ColumnDef {
    /// A nullable column with no default.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
            primary_key: false,
            unique: false,
            references: None,
        }
    }

    /// Reject NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Default expression, as SQL.
    pub fn default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Make this the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Require unique values.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Foreign key to `table(column)`.
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some((table.into(), column.into()));
        self
    }

    /// Column definition as it appears in CREATE TABLE or ADD COLUMN.
    pub fn sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.data_type);
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default_clause(default));
        }
        if let Some((table, column)) = &self.references {
            sql.push_str(&format!(" REFERENCES {}({})", quote_ident(table), quote_ident(column)));
        }
        sql
    }
}

/// When a change runs relative to the backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangePhase {
    /// Before the backfill.
    Widen,
    /// After the backfill has been verified.
    Tighten,
    /// Last; removes superseded structure.
    Contract,
}

/// Outcome of applying one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The change was executed.
    Applied,
    /// The live schema already satisfied the change; nothing ran.
    AlreadySatisfied,
}

/// One structural step of a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// Create a table.
    CreateTable {
        /// Table name.
        table: String,
        /// Columns in order.
        columns: Vec<ColumnDef>,
    },
    /// Add a column to an existing table.
    AddColumn {
        /// Table name.
        table: String,
        /// The new column.
        column: ColumnDef,
    },
    /// Create an index.
    CreateIndex {
        /// Index name.
        name: String,
        /// Indexed table.
        table: String,
        /// Indexed columns.
        columns: Vec<String>,
        /// Whether the index enforces uniqueness.
        unique: bool,
    },
    /// Make a column NOT NULL, optionally replacing its default.
    SetNotNull {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// New default expression.
        default: Option<String>,
    },
    /// Remove a superseded column.
    DropColumn {
        /// Table name.
        table: String,
        /// Definition used to re-add the column on `down`.
        column: ColumnDef,
    },
}

impl SchemaChange {
    /// Create `table` with `columns`.
    pub fn create_table(table: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        SchemaChange::CreateTable {
            table: table.into(),
            columns,
        }
    }

    /// Add `column` to `table`.
    pub fn add_column(table: impl Into<String>, column: ColumnDef) -> Self {
        SchemaChange::AddColumn {
            table: table.into(),
            column,
        }
    }

    /// Non-unique index.
    pub fn create_index(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: &[&str],
    ) -> Self {
        SchemaChange::CreateIndex {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    /// Unique index.
    pub fn create_unique_index(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: &[&str],
    ) -> Self {
        SchemaChange::CreateIndex {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: true,
        }
    }

    /// Tighten `table.column` to NOT NULL.
    pub fn set_not_null(
        table: impl Into<String>,
        column: impl Into<String>,
        default: Option<&str>,
    ) -> Self {
        SchemaChange::SetNotNull {
            table: table.into(),
            column: column.into(),
            default: default.map(str::to_string),
        }
    }

    /// Remove `column` from `table`.
    pub fn drop_column(table: impl Into<String>, column: ColumnDef) -> Self {
        SchemaChange::DropColumn {
            table: table.into(),
            column,
        }
    }

    /// Phase this change runs in.
    pub fn phase(&self) -> ChangePhase {
        match self {
            SchemaChange::CreateTable { .. }
            | SchemaChange::AddColumn { .. }
            | SchemaChange::CreateIndex { .. } => ChangePhase::Widen,
            SchemaChange::SetNotNull { .. } => ChangePhase::Tighten,
            SchemaChange::DropColumn { .. } => ChangePhase::Contract,
        }
    }

    /// Safety grade of this change.
    pub fn grade(&self) -> SafetyGrade {
        SafetyGrader::grade_change(self).grade
    }

    /// Human-readable summary.
    pub fn describe(&self) -> String {
        match self {
            SchemaChange::CreateTable { table, .. } => format!("Create table {table}"),
            SchemaChange::AddColumn { table, column } => {
                format!("Add column {table}.{} {}", column.name, column.data_type)
            }
            SchemaChange::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => format!(
                "Create {}index {name} on {table}({})",
                if *unique { "unique " } else { "" },
                columns.join(", ")
            ),
            SchemaChange::SetNotNull {
                table,
                column,
                default,
            } => match default {
                Some(default) => format!("Set {table}.{column} NOT NULL DEFAULT {default}"),
                None => format!("Set {table}.{column} NOT NULL"),
            },
            SchemaChange::DropColumn { table, column } => {
                format!("Drop column {table}.{}", column.name)
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            SchemaChange::CreateTable { table, columns } => {
                if columns.is_empty() {
                    return Err(format!("table {table} has no columns"));
                }
                for (i, column) in columns.iter().enumerate() {
                    if columns[..i]
                        .iter()
                        .any(|c| c.name.eq_ignore_ascii_case(&column.name))
                    {
                        return Err(format!("column {table}.{} declared twice", column.name));
                    }
                }
                if columns.iter().filter(|c| c.primary_key).count() > 1 {
                    return Err(format!("table {table} declares more than one primary key column"));
                }
                Ok(())
            }
            SchemaChange::AddColumn { table, column } => {
                if column.primary_key || column.unique {
                    return Err(format!(
                        "column {table}.{} cannot be added as PRIMARY KEY or UNIQUE; add a unique index instead",
                        column.name
                    ));
                }
                if !column.nullable && column.default.is_none() {
                    return Err(format!(
                        "column {table}.{} is NOT NULL without a default; add it nullable, backfill, then tighten",
                        column.name
                    ));
                }
                Ok(())
            }
            SchemaChange::CreateIndex { name, columns, .. } => {
                if columns.is_empty() {
                    return Err(format!("index {name} has no columns"));
                }
                Ok(())
            }
            SchemaChange::SetNotNull { .. } => Ok(()),
            SchemaChange::DropColumn { table, column } => {
                if column.primary_key || column.unique {
                    return Err(format!("column {table}.{} is a key and cannot be dropped", column.name));
                }
                if !column.nullable && column.default.is_none() {
                    return Err(format!(
                        "column {table}.{} needs a default to be re-added on rollback",
                        column.name
                    ));
                }
                Ok(())
            }
        }
    }

    /// Whether the live schema already reflects this change.
    pub fn is_satisfied(&self, inspector: &SchemaInspector<'_>) -> Result<bool> {
        match self {
            SchemaChange::CreateTable { table, .. } => inspector.table_exists(table),
            SchemaChange::AddColumn { table, column } => inspector.column_exists(table, &column.name),
            SchemaChange::CreateIndex { name, .. } => inspector.index_exists(name),
            SchemaChange::SetNotNull {
                table,
                column,
                default,
            } => Ok(inspector.column(table, column)?.is_some_and(|info| {
                !info.nullable && (default.is_none() || info.default_matches(default.as_deref()))
            })),
            SchemaChange::DropColumn { table, column } => {
                Ok(!inspector.column_exists(table, &column.name)?)
            }
        }
    }

    /// Apply the change unless the live schema already reflects it.
    pub fn apply(&self, conn: &Connection) -> Result<ChangeOutcome> {
        let inspector = SchemaInspector::new(conn);
        if self.is_satisfied(&inspector)? {
            return Ok(ChangeOutcome::AlreadySatisfied);
        }

        match self {
            SchemaChange::CreateTable { table, columns } => {
                let body = columns
                    .iter()
                    .map(ColumnDef::sql)
                    .collect::<Vec<_>>()
                    .join(",\n    ");
                conn.execute_batch(&format!("CREATE TABLE {} (\n    {body}\n)", quote_ident(table)))?;
            }
            SchemaChange::AddColumn { table, column } => {
                require_table(&inspector, table)?;
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote_ident(table),
                    column.sql()
                ))?;
            }
            SchemaChange::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => {
                require_table(&inspector, table)?;
                let columns = columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                conn.execute_batch(&format!(
                    "CREATE {}INDEX {} ON {} ({columns})",
                    if *unique { "UNIQUE " } else { "" },
                    quote_ident(name),
                    quote_ident(table)
                ))?;
            }
            SchemaChange::SetNotNull {
                table,
                column,
                default,
            } => {
                if inspector.column(table, column)?.is_none() {
                    return Err(MigrationError::Missing {
                        object: format!("column {table}.{column}"),
                    });
                }
                let predicate = format!("{} IS NULL", quote_ident(column));
                let remaining = inspector.count_matching(table, &predicate)?;
                if remaining > 0 {
                    return Err(MigrationError::BackfillIncomplete {
                        table: table.clone(),
                        predicate,
                        remaining,
                    });
                }
                rebuild_table(
                    conn,
                    table,
                    ColumnRewrite {
                        column,
                        nullable: false,
                        default: default.as_deref(),
                    },
                )?;
            }
            SchemaChange::DropColumn { table, column } => {
                let dependents = inspector.column_dependents(table, &column.name)?;
                if let Some(dependent) = dependents.into_iter().next() {
                    return Err(MigrationError::DependentObject {
                        object: format!("column {table}.{}", column.name),
                        dependent,
                    });
                }
                drop_column(conn, table, &column.name)?;
            }
        }
        Ok(ChangeOutcome::Applied)
    }

    /// Check the post-condition of `apply`.
    ///
    /// `tightened_later` skips the nullability check of an added column that a
    /// later change in the same definition tightens.
    pub fn verify(&self, inspector: &SchemaInspector<'_>, tightened_later: bool) -> Result<()> {
        match self {
            SchemaChange::CreateTable { table, columns } => {
                let shape = inspector.describe_table(table)?;
                if shape.is_empty() {
                    return verification_failed(format!("table {table} is missing"));
                }
                for column in columns {
                    if !shape.keys().any(|name| name.eq_ignore_ascii_case(&column.name)) {
                        return verification_failed(format!("column {table}.{} is missing", column.name));
                    }
                }
            }
            SchemaChange::AddColumn { table, column } => match inspector.column(table, &column.name)? {
                None => return verification_failed(format!("column {table}.{} is missing", column.name)),
                Some(info) if !tightened_later && info.nullable != column.nullable => {
                    return verification_failed(format!(
                        "column {table}.{} nullable = {}, expected {}",
                        column.name, info.nullable, column.nullable
                    ));
                }
                Some(_) => {}
            },
            SchemaChange::CreateIndex { name, .. } => {
                if !inspector.index_exists(name)? {
                    return verification_failed(format!("index {name} is missing"));
                }
            }
            SchemaChange::SetNotNull {
                table,
                column,
                default,
            } => match inspector.column(table, column)? {
                None => return verification_failed(format!("column {table}.{column} is missing")),
                Some(info) if info.nullable => {
                    return verification_failed(format!("column {table}.{column} is still nullable"));
                }
                Some(info) if default.is_some() && !info.default_matches(default.as_deref()) => {
                    return verification_failed(format!(
                        "column {table}.{column} default is {:?}, expected {:?}",
                        info.default, default
                    ));
                }
                Some(_) => {}
            },
            SchemaChange::DropColumn { table, column } => {
                if inspector.column_exists(table, &column.name)? {
                    return verification_failed(format!("column {table}.{} still exists", column.name));
                }
            }
        }
        Ok(())
    }

    /// Refuse a reversal that is blocked or would destroy data.
    ///
    /// `owned` lists dependents that the same rollback removes first.
    pub fn check_revert(
        &self,
        inspector: &SchemaInspector<'_>,
        accept_data_loss: bool,
        owned: &[String],
    ) -> Result<()> {
        match self {
            SchemaChange::CreateTable { table, .. } => {
                if !inspector.table_exists(table)? {
                    return Ok(());
                }
                let object = format!("table {table}");
                check_dependents(&object, inspector.table_dependents(table)?, owned)?;
                let rows = inspector.row_count(table)?;
                check_data_loss(&format!("dropping {object} ({rows} rows)"), rows, accept_data_loss)
            }
            SchemaChange::AddColumn { table, column } => {
                if !inspector.column_exists(table, &column.name)? {
                    return Ok(());
                }
                let object = format!("column {table}.{}", column.name);
                check_dependents(&object, inspector.column_dependents(table, &column.name)?, owned)?;
                let values = inspector.non_null_count(table, &column.name)?;
                check_data_loss(
                    &format!("dropping {object} ({values} non-NULL values)"),
                    values,
                    accept_data_loss,
                )
            }
            SchemaChange::CreateIndex { .. }
            | SchemaChange::SetNotNull { .. }
            | SchemaChange::DropColumn { .. } => Ok(()),
        }
    }

    /// Undo the change. A change that is already undone is left alone.
    pub fn revert(&self, conn: &Connection) -> Result<ChangeOutcome> {
        let inspector = SchemaInspector::new(conn);
        match self {
            SchemaChange::CreateTable { table, .. } => {
                if !inspector.table_exists(table)? {
                    return Ok(ChangeOutcome::AlreadySatisfied);
                }
                conn.execute_batch(&format!("DROP TABLE {}", quote_ident(table)))?;
            }
            SchemaChange::AddColumn { table, column } => {
                if !inspector.column_exists(table, &column.name)? {
                    return Ok(ChangeOutcome::AlreadySatisfied);
                }
                drop_column(conn, table, &column.name)?;
            }
            SchemaChange::CreateIndex { name, .. } => {
                if !inspector.index_exists(name)? {
                    return Ok(ChangeOutcome::AlreadySatisfied);
                }
                conn.execute_batch(&format!("DROP INDEX {}", quote_ident(name)))?;
            }
            SchemaChange::SetNotNull { table, column, .. } => {
                match inspector.column(table, column)? {
                    Some(info) if !info.nullable => {}
                    _ => return Ok(ChangeOutcome::AlreadySatisfied),
                }
                rebuild_table(
                    conn,
                    table,
                    ColumnRewrite {
                        column,
                        nullable: true,
                        default: None,
                    },
                )?;
            }
            SchemaChange::DropColumn { table, column } => {
                if inspector.column_exists(table, &column.name)? {
                    return Ok(ChangeOutcome::AlreadySatisfied);
                }
                tracing::warn!(table = %table, column = %column.name, "re-adding dropped column; its former values are not restored");
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote_ident(table),
                    column.sql()
                ))?;
            }
        }
        Ok(ChangeOutcome::Applied)
    }

    /// Check the post-condition of `revert`.
    pub fn verify_reverted(&self, inspector: &SchemaInspector<'_>) -> Result<()> {
        match self {
            SchemaChange::CreateTable { table, .. } => {
                if inspector.table_exists(table)? {
                    return verification_failed(format!("table {table} still exists"));
                }
            }
            SchemaChange::AddColumn { table, column } => {
                if inspector.column_exists(table, &column.name)? {
                    return verification_failed(format!("column {table}.{} still exists", column.name));
                }
            }
            SchemaChange::CreateIndex { name, .. } => {
                if inspector.index_exists(name)? {
                    return verification_failed(format!("index {name} still exists"));
                }
            }
            SchemaChange::SetNotNull { table, column, .. } => {
                if inspector.column(table, column)?.is_some_and(|info| !info.nullable) {
                    return verification_failed(format!("column {table}.{column} is still NOT NULL"));
                }
            }
            SchemaChange::DropColumn { table, column } => {
                if !inspector.column_exists(table, &column.name)? {
                    return verification_failed(format!("column {table}.{} is missing", column.name));
                }
            }
        }
        Ok(())
    }

    /// Labels of objects removed when this change is reverted, as reported
    /// by the inspector's dependent queries.
    fn removed_labels(&self) -> Vec<String> {
        match self {
            SchemaChange::CreateIndex { name, .. } => vec![format!("index {name}")],
            SchemaChange::CreateTable { table, .. } => vec![format!("foreign key from {table}")],
            _ => Vec::new(),
        }
    }
}

/// Counts from applying a definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Changes executed.
    pub applied: usize,
    /// Changes skipped because the schema already satisfied them.
    pub skipped: usize,
    /// Backfill totals.
    pub backfill: BackfillOutcome,
}

/// A single named, versioned migration.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationDefinition {
    version: u64,
    name: String,
    description: Option<String>,
    changes: Vec<SchemaChange>,
    backfill: Option<BackfillSpec>,
}

impl MigrationDefinition {
    /// A definition with no changes yet.
    pub fn new(version: u64, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            description: None,
            changes: Vec::new(),
            backfill: None,
        }
    }

    /// Free-form description shown by `status`.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a schema change.
    pub fn change(mut self, change: SchemaChange) -> Self {
        self.changes.push(change);
        self
    }

    /// Set the backfill.
    pub fn backfill(mut self, spec: BackfillSpec) -> Self {
        self.backfill = Some(spec);
        self
    }

    /// Ordering key.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Changes in declaration order.
    pub fn changes(&self) -> &[SchemaChange] {
        &self.changes
    }

    /// The backfill, if any.
    pub fn backfill_spec(&self) -> Option<&BackfillSpec> {
        self.backfill.as_ref()
    }

    /// Changes applied before the backfill.
    pub fn widening(&self) -> impl Iterator<Item = &SchemaChange> {
        self.in_phase(ChangePhase::Widen)
    }

    /// Changes applied after the backfill.
    pub fn tightening(&self) -> impl Iterator<Item = &SchemaChange> {
        self.in_phase(ChangePhase::Tighten)
    }

    /// Changes applied last.
    pub fn contracting(&self) -> impl Iterator<Item = &SchemaChange> {
        self.in_phase(ChangePhase::Contract)
    }

    /// Safety grade.
    pub fn grade(&self) -> MigrationGrade {
        SafetyGrader::grade(self)
    }

    /// Reject definitions that could never apply cleanly.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| MigrationError::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".to_string()));
        }
        if self.changes.is_empty() && self.backfill.is_none() {
            return Err(invalid("no schema changes and no backfill".to_string()));
        }
        for change in &self.changes {
            change.validate().map_err(invalid)?;
        }
        if let Some(spec) = &self.backfill {
            if spec.predicate.trim().is_empty() {
                return Err(invalid("backfill predicate is empty".to_string()));
            }
            if spec.assignments.is_empty() {
                return Err(invalid("backfill assigns no columns".to_string()));
            }
        }
        Ok(())
    }

    /// Run the up path: widen, backfill, verify the backfill, tighten, contract.
    ///
    /// Every change is guarded, so re-running after a partial attempt picks up
    /// where the previous one stopped.
    pub fn up(
        &self,
        conn: &Connection,
        backfill: &BackfillExecutor<'_>,
        cancel: &CancellationToken,
        observer: Option<&ProgressFn>,
    ) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();

        for change in self.widening() {
            self.apply_change(conn, change, &mut summary)?;
        }

        if let Some(spec) = &self.backfill {
            summary.backfill = backfill.run(&self.name, spec, cancel, observer)?;
            check_backfill(&SchemaInspector::new(conn), spec)?;
        }

        for change in self.tightening().chain(self.contracting()) {
            self.apply_change(conn, change, &mut summary)?;
        }

        Ok(summary)
    }

    /// Confirm every post-condition of `up`.
    pub fn verify(&self, conn: &Connection) -> Result<()> {
        let inspector = SchemaInspector::new(conn);
        for change in self.ordered() {
            change.verify(&inspector, self.tightens(change))?;
        }
        if let Some(spec) = &self.backfill {
            check_backfill(&inspector, spec)?;
        }
        Ok(())
    }

    /// Check that `down` can run to completion without touching anything.
    pub fn check_down(&self, conn: &Connection, accept_data_loss: bool) -> Result<()> {
        let inspector = SchemaInspector::new(conn);
        let ordered = self.ordered();
        for (i, change) in ordered.iter().enumerate().rev() {
            // Objects created later in `up` are reverted first.
            let owned: Vec<String> = ordered[i + 1..]
                .iter()
                .flat_map(|c| c.removed_labels())
                .collect();
            change.check_revert(&inspector, accept_data_loss, &owned)?;
        }
        Ok(())
    }

    /// Run the down path in reverse order. Backfilled values are not restored.
    pub fn down(&self, conn: &Connection, accept_data_loss: bool) -> Result<usize> {
        self.check_down(conn, accept_data_loss)?;

        let mut reverted = 0;
        for change in self.ordered().into_iter().rev() {
            match change.revert(conn)? {
                ChangeOutcome::Applied => {
                    tracing::info!(migration = %self.name, change = %change.describe(), "reverted");
                    reverted += 1;
                }
                ChangeOutcome::AlreadySatisfied => {
                    tracing::debug!(migration = %self.name, change = %change.describe(), "already reverted");
                }
            }
        }
        Ok(reverted)
    }

    /// Confirm every change was reversed.
    pub fn verify_down(&self, conn: &Connection) -> Result<()> {
        let inspector = SchemaInspector::new(conn);
        for change in self.ordered() {
            change.verify_reverted(&inspector)?;
        }
        Ok(())
    }

    fn apply_change(
        &self,
        conn: &Connection,
        change: &SchemaChange,
        summary: &mut ApplySummary,
    ) -> Result<()> {
        match change.apply(conn)? {
            ChangeOutcome::Applied => {
                tracing::info!(migration = %self.name, change = %change.describe(), "applied");
                summary.applied += 1;
            }
            ChangeOutcome::AlreadySatisfied => {
                tracing::info!(
                    migration = %self.name,
                    change = %change.describe(),
                    "precondition already satisfied, skipping"
                );
                summary.skipped += 1;
            }
        }
        Ok(())
    }

    fn in_phase(&self, phase: ChangePhase) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(move |c| c.phase() == phase)
    }

    fn ordered(&self) -> Vec<&SchemaChange> {
        self.widening()
            .chain(self.tightening())
            .chain(self.contracting())
            .collect()
    }

    fn tightens(&self, change: &SchemaChange) -> bool {
        let SchemaChange::AddColumn { table, column } = change else {
            return false;
        };
        self.tightening().any(|c| {
            matches!(c, SchemaChange::SetNotNull { table: t, column: col, .. }
                if t.eq_ignore_ascii_case(table) && col.eq_ignore_ascii_case(&column.name))
        })
    }
}

fn check_backfill(inspector: &SchemaInspector<'_>, spec: &BackfillSpec) -> Result<()> {
    let remaining = inspector.count_matching(&spec.table, &spec.predicate)?;
    if remaining > 0 {
        return Err(MigrationError::BackfillIncomplete {
            table: spec.table.clone(),
            predicate: spec.predicate.clone(),
            remaining,
        });
    }
    Ok(())
}

fn check_dependents(object: &str, dependents: Vec<String>, owned: &[String]) -> Result<()> {
    match dependents.into_iter().find(|d| !owned.contains(d)) {
        Some(dependent) => Err(MigrationError::DependentObject {
            object: object.to_string(),
            dependent,
        }),
        None => Ok(()),
    }
}

fn check_data_loss(operation: &str, affected: u64, accept_data_loss: bool) -> Result<()> {
    if affected == 0 {
        return Ok(());
    }
    if !accept_data_loss {
        return Err(MigrationError::UnsafeOperation {
            operation: operation.to_string(),
            requirement: "pass accept_data_loss to discard it".to_string(),
        });
    }
    tracing::warn!(operation, "discarding data on rollback");
    Ok(())
}

fn drop_column(conn: &Connection, table: &str, column: &str) -> Result<()> {
    let sql = format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_ident(table),
        quote_ident(column)
    );
    match conn.execute_batch(&sql) {
        Ok(()) => Ok(()),
        Err(e) => {
            let message = e.to_string();
            if message.contains("cannot drop") || message.contains("error in") {
                Err(MigrationError::DependentObject {
                    object: format!("column {table}.{column}"),
                    dependent: message,
                })
            } else {
                Err(e.into())
            }
        }
    }
}

fn require_table(inspector: &SchemaInspector<'_>, table: &str) -> Result<()> {
    if inspector.table_exists(table)? {
        Ok(())
    } else {
        Err(MigrationError::Missing {
            object: format!("table {table}"),
        })
    }
}

fn verification_failed(message: String) -> Result<()> {
    Err(MigrationError::VerificationFailed { message })
}
