//! Migration-specific error types.

use super::plan::OperationKind;
use crate::backend::BackendError;
use crate::catalog::CatalogError;
use crate::versioning::VersionError;
use thiserror::Error;

/// Errors detected while building or validating a plan.
///
/// Raised before any statement reaches the database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// An operation names a table missing from the catalog.
    #[error("plan references unknown table: {0}")]
    UnknownTable(String),

    /// A ghost table is not listed for creation.
    #[error("ghost table {0} has no create step")]
    MissingCreate(String),

    /// A copied foreign key targets a table that is neither copied nor
    /// protected by a placeholder at that point.
    #[error("step {step_index} copies {table}.{column} before {referred_table} is copied or has a placeholder")]
    MissingDependency {
        /// Offending step.
        step_index: usize,
        /// Table being copied.
        table: String,
        /// Foreign key column.
        column: String,
        /// Table the column refers to.
        referred_table: String,
    },

    /// A placeholder is added while one is already live.
    #[error("step {step_index} adds a second placeholder for {table}")]
    DuplicatePlaceholder {
        /// Offending step.
        step_index: usize,
        /// Table concerned.
        table: String,
    },

    /// A placeholder is dropped that was never added.
    #[error("step {step_index} drops a missing placeholder for {table}")]
    MissingPlaceholder {
        /// Offending step.
        step_index: usize,
        /// Table concerned.
        table: String,
    },

    /// A placeholder is still live at the end of the plan.
    #[error("placeholder for {0} is never dropped")]
    DanglingPlaceholder(String),

    /// The foreign keys between ghost tables cannot be ordered.
    #[error("no valid copy order for tables: {}", .0.join(", "))]
    Unsatisfiable(Vec<String>),

    /// A step was marked executed twice.
    #[error("step {0} was already executed")]
    StepAlreadyExecuted(usize),

    /// A step index past the end of the plan.
    #[error("plan has no step {0}")]
    UnknownStep(usize),
}

/// Errors from the placeholder-row manager.
#[derive(Debug, Error)]
pub enum PlaceholderError {
    /// Placeholders were requested for a table that already has one.
    #[error("placeholder already present for table {0}")]
    AlreadyPresent(String),

    /// Placeholders were removed from a table that has none.
    #[error("no placeholder present for table {0}")]
    NotPresent(String),

    /// Generating an identity revisited a table still being generated.
    #[error("foreign key cycle through primary key of table {0}")]
    ForeignKeyCycle(String),

    /// Placeholders need a primary key to be addressed.
    #[error("table {0} has no primary key")]
    NoPrimaryKey(String),

    /// An auto-increment column has no sequence, or it yielded no value.
    #[error("no sequence value for auto-increment column {table}.{column}")]
    MissingSequence {
        /// Table id.
        table: String,
        /// Column name.
        column: String,
    },

    /// A sequence value does not fit its column type.
    #[error("sequence value {value} does not fit column {table}.{column}")]
    SequenceOutOfRange {
        /// Table id.
        table: String,
        /// Column name.
        column: String,
        /// Value drawn.
        value: i64,
    },

    /// A column named by a key or foreign key does not exist.
    #[error("unknown column {table}.{column}")]
    UnknownColumn {
        /// Table id.
        table: String,
        /// Column name.
        column: String,
    },

    /// Catalog lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The database rejected a statement.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// The single error type surfaced by a migration run.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Planning or validation failed.
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),

    /// Placeholder bookkeeping failed.
    #[error("placeholder error: {0}")]
    Placeholder(#[from] PlaceholderError),

    /// A statement failed outside a step.
    #[error("database error: {0}")]
    Backend(#[from] BackendError),

    /// Version graph error.
    #[error("version error: {0}")]
    Version(#[from] VersionError),

    /// Catalog lookup failed.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A step failed; earlier steps remain applied.
    #[error("step {step_index} ({operation}) failed: {source}")]
    StepFailed {
        /// Index of the failed step.
        step_index: usize,
        /// Rendered operation.
        operation: String,
        /// Underlying failure.
        #[source]
        source: Box<MigrationError>,
    },

    /// The run was cancelled before the given step.
    #[error("migration cancelled before step {step_index}")]
    Cancelled {
        /// First step not executed.
        step_index: usize,
    },

    /// The executor tried to skip or repeat a phase.
    #[error("invalid phase transition from {from} to {to}")]
    PhaseOrder {
        /// Current phase.
        from: super::executor::MigrationPhase,
        /// Requested phase.
        to: super::executor::MigrationPhase,
    },

    /// Copy needs a primary key to address rows.
    #[error("table {0} has no primary key")]
    MissingKey(String),

    /// A table operation has no target table.
    #[error("{kind} operation has no table")]
    EmptyOperation {
        /// Operation kind.
        kind: OperationKind,
    },

    /// A ghost table has no source table to copy from.
    #[error("no source table maps to ghost table {0}")]
    UnknownTable(String),
}

impl MigrationError {
    /// The innermost error, looking through step failures.
    pub fn root_cause(&self) -> &MigrationError {
        match self {
            MigrationError::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
