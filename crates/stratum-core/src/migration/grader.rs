//! Safety grading for migration definitions.
//!
//! Each schema change and backfill gets a grade; a definition's grade is the
//! worst of its parts.

use serde::Serialize;

use super::backfill::BackfillSpec;
use super::definition::{MigrationDefinition, SchemaChange};

/// Safety grade of a change, from harmless to destructive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SafetyGrade {
    /// Additive and non-breaking.
    /// Examples: new tables, new nullable columns, new indexes.
    A,
    /// Needs existing rows rewritten by a backfill.
    B,
    /// Tightens a constraint on live data.
    /// Examples: NOT NULL on an existing column.
    C,
    /// Destroys data; requires explicit permission.
    /// Examples: column removal.
    D,
}

impl SafetyGrade {
    /// Single-letter form.
    pub fn letter(self) -> &'static str {
        match self {
            SafetyGrade::A => "A",
            SafetyGrade::B => "B",
            SafetyGrade::C => "C",
            SafetyGrade::D => "D",
        }
    }
}

impl std::fmt::Display for SafetyGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyGrade::A => write!(f, "A (additive)"),
            SafetyGrade::B => write!(f, "B (backfill)"),
            SafetyGrade::C => write!(f, "C (tightening)"),
            SafetyGrade::D => write!(f, "D (destructive)"),
        }
    }
}

/// Grade of a single change.
#[derive(Debug, Clone)]
pub struct ChangeGrade {
    /// The safety grade for this change.
    pub grade: SafetyGrade,
    /// Description of the change.
    pub change_description: String,
    /// Reasoning for the grade.
    pub reasoning: String,
}

impl ChangeGrade {
    fn new(
        grade: SafetyGrade,
        description: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            grade,
            change_description: description.into(),
            reasoning: reasoning.into(),
        }
    }
}

/// Complete grading result for a definition.
#[derive(Debug, Clone)]
pub struct MigrationGrade {
    /// The overall safety grade (worst among all changes).
    pub overall_grade: SafetyGrade,
    /// Individual grades in apply order.
    pub change_grades: Vec<ChangeGrade>,
    /// Warnings about the definition.
    pub warnings: Vec<String>,
}

impl MigrationGrade {
    /// Whether `up` needs `allow_destructive`.
    pub fn is_destructive(&self) -> bool {
        self.overall_grade == SafetyGrade::D
    }

    /// Check if the migration leaves existing rows untouched.
    pub fn can_run_online(&self) -> bool {
        self.overall_grade <= SafetyGrade::B
    }
}

/// Grades migration definitions for safety.
pub struct SafetyGrader;

impl SafetyGrader {
    /// Grade a definition.
    pub fn grade(definition: &MigrationDefinition) -> MigrationGrade {
        let mut change_grades = Vec::new();
        let mut overall_grade = SafetyGrade::A;

        let mut push = |grade: ChangeGrade| {
            overall_grade = overall_grade.max(grade.grade);
            change_grades.push(grade);
        };

        for change in definition.widening() {
            push(Self::grade_change(change));
        }
        if let Some(spec) = definition.backfill_spec() {
            push(Self::grade_backfill(spec));
        }
        for change in definition.tightening().chain(definition.contracting()) {
            push(Self::grade_change(change));
        }

        let warnings = Self::generate_warnings(definition);

        MigrationGrade {
            overall_grade,
            change_grades,
            warnings,
        }
    }

    /// Grade a single schema change.
    pub fn grade_change(change: &SchemaChange) -> ChangeGrade {
        match change {
            SchemaChange::CreateTable { table, .. } => ChangeGrade::new(
                SafetyGrade::A,
                change.describe(),
                format!("{table} is new; nothing reads it yet"),
            ),

            SchemaChange::AddColumn { column, .. } => {
                if column.nullable {
                    ChangeGrade::new(
                        SafetyGrade::A,
                        change.describe(),
                        "Nullable columns don't affect existing rows",
                    )
                } else {
                    // NOT NULL with default: every existing row is rewritten.
                    ChangeGrade::new(
                        SafetyGrade::B,
                        change.describe(),
                        "Existing rows take the default value",
                    )
                }
            }

            SchemaChange::CreateIndex { .. } => ChangeGrade::new(
                SafetyGrade::A,
                change.describe(),
                "Indexes don't change stored data",
            ),

            SchemaChange::SetNotNull { .. } => ChangeGrade::new(
                SafetyGrade::C,
                change.describe(),
                "Rejects writes that were previously valid; the table is rebuilt",
            ),

            SchemaChange::DropColumn { .. } => ChangeGrade::new(
                SafetyGrade::D,
                change.describe(),
                "Removing columns destroys data",
            ),
        }
    }

    /// Grade a backfill step.
    pub fn grade_backfill(spec: &BackfillSpec) -> ChangeGrade {
        ChangeGrade::new(
            SafetyGrade::B,
            spec.describe(),
            "Rewrites existing rows in committed chunks",
        )
    }

    fn generate_warnings(definition: &MigrationDefinition) -> Vec<String> {
        let mut warnings = Vec::new();

        for change in definition.tightening() {
            if let SchemaChange::SetNotNull { table, column, .. } = change {
                let backfilled = definition
                    .backfill_spec()
                    .map(|spec| spec.table.eq_ignore_ascii_case(table) && spec.assigns(column))
                    .unwrap_or(false);
                if !backfilled {
                    warnings.push(format!(
                        "{table}.{column} is tightened without a backfill; existing NULLs will fail the migration"
                    ));
                }
            }
        }

        for change in definition.contracting() {
            warnings.push(format!(
                "{} requires allow_destructive and cannot be undone without data loss",
                change.describe()
            ));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::backfill::BackfillSpec;
    use crate::migration::definition::ColumnDef;

    #[test]
    fn test_grade_a_create_table() {
        let def = MigrationDefinition::new(1, "0001_create_orders").change(
            SchemaChange::create_table(
                "Orders",
                vec![ColumnDef::new("id", "INTEGER").primary_key()],
            ),
        );
        let grade = SafetyGrader::grade(&def);
        assert_eq!(grade.overall_grade, SafetyGrade::A);
        assert!(grade.can_run_online());
        assert!(!grade.is_destructive());
        assert!(grade.warnings.is_empty());
    }

    #[test]
    fn test_grade_c_backfill_then_tighten() {
        let def = MigrationDefinition::new(5, "0005_add_order_shipping")
            .change(SchemaChange::add_column(
                "Orders",
                ColumnDef::new("shipping", "NUMERIC").default("0.00"),
            ))
            .backfill(BackfillSpec::new("Orders", "shipping IS NULL OR shipping = 0").set("shipping", 5.00))
            .change(SchemaChange::set_not_null("Orders", "shipping", Some("0.00")));

        let grade = SafetyGrader::grade(&def);
        assert_eq!(grade.overall_grade, SafetyGrade::C);
        assert!(!grade.can_run_online());
        let grades: Vec<_> = grade.change_grades.iter().map(|g| g.grade).collect();
        assert_eq!(grades, vec![SafetyGrade::A, SafetyGrade::B, SafetyGrade::C]);
        assert!(grade.warnings.is_empty());
    }

    #[test]
    fn test_grade_b_not_null_column_with_default() {
        let def = MigrationDefinition::new(2, "0002_add_flag").change(SchemaChange::add_column(
            "Orders",
            ColumnDef::new("flag", "INTEGER").not_null().default("0"),
        ));
        assert_eq!(SafetyGrader::grade(&def).overall_grade, SafetyGrade::B);
    }

    #[test]
    fn test_grade_d_drop_column() {
        let def = MigrationDefinition::new(9, "0009_drop_legacy").change(SchemaChange::drop_column(
            "Orders",
            ColumnDef::new("legacy", "TEXT"),
        ));
        let grade = SafetyGrader::grade(&def);
        assert_eq!(grade.overall_grade, SafetyGrade::D);
        assert!(grade.is_destructive());
        assert_eq!(grade.warnings.len(), 1);
    }

    #[test]
    fn test_tighten_without_backfill_warns() {
        let def = MigrationDefinition::new(3, "0003_tighten")
            .change(SchemaChange::set_not_null("Orders", "note", Some("''")));
        let grade = SafetyGrader::grade(&def);
        assert_eq!(grade.warnings.len(), 1);
        assert!(grade.warnings[0].contains("Orders.note"));
    }

    #[test]
    fn test_grade_ordering_and_display() {
        assert!(SafetyGrade::A < SafetyGrade::B);
        assert!(SafetyGrade::C < SafetyGrade::D);
        assert_eq!(SafetyGrade::D.to_string(), "D (destructive)");
        assert_eq!(SafetyGrade::B.letter(), "B");
    }
}
