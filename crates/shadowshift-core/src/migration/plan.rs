//! Plans, steps, and operations.
//!
//! A [`Plan`] is the ordered, replayable representation of one migration.
//! Each [`Step`] wraps an immutable [`Operation`] and records whether it
//! has run. [`PlanProgress`] carries what a stopped run left behind, so a
//! re-run of the same plan resumes instead of starting over.

use super::error::PlanError;
use super::executor::MigrationPhase;
use super::null_records::NullRecords;
use crate::versioning::VersionId;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Kind of work an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Insert placeholder rows.
    AddNull,
    /// Delete placeholder rows.
    DropNull,
    /// Install forward sync and copy existing rows for some columns.
    Copy,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::AddNull => write!(f, "ADD_NULL"),
            OperationKind::DropNull => write!(f, "DROP_NULL"),
            OperationKind::Copy => write!(f, "COPY"),
        }
    }
}

/// An immutable instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    kind: OperationKind,
    tables: BTreeSet<String>,
    columns: BTreeSet<String>,
}

impl Operation {
    /// Insert placeholder rows into `tables`.
    pub fn add_null<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: OperationKind::AddNull,
            tables: tables.into_iter().map(Into::into).collect(),
            columns: BTreeSet::new(),
        }
    }

    /// Delete the placeholder rows of `tables`.
    pub fn drop_null<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: OperationKind::DropNull,
            tables: tables.into_iter().map(Into::into).collect(),
            columns: BTreeSet::new(),
        }
    }

    /// Copy `columns` into the ghost table `table`.
    pub fn copy<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: OperationKind::Copy,
            tables: BTreeSet::from([table.into()]),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Tables touched.
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    /// Columns migrated (COPY only).
    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    /// The single target of a COPY.
    pub fn target(&self) -> Option<&str> {
        self.tables.iter().next().map(String::as_str)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables: Vec<&str> = self.tables.iter().map(String::as_str).collect();
        match self.kind {
            OperationKind::Copy => {
                let columns: Vec<&str> = self.columns.iter().map(String::as_str).collect();
                write!(f, "COPY {} [{}]", tables.join(", "), columns.join(", "))
            }
            kind => write!(f, "{kind} {{{}}}", tables.join(", ")),
        }
    }
}

/// An operation plus its execution flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    operation: Operation,
    executed: bool,
}

impl Step {
    /// Wrap an operation as a pending step.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            executed: false,
        }
    }

    /// The wrapped operation.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Check if the step has run.
    pub fn is_executed(&self) -> bool {
        self.executed
    }

    fn mark_executed(&mut self, index: usize) -> Result<(), PlanError> {
        if self.executed {
            return Err(PlanError::StepAlreadyExecuted(index));
        }
        self.executed = true;
        Ok(())
    }
}

/// State left by earlier runs of a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanProgress {
    phase: Option<MigrationPhase>,
    placeholders: NullRecords,
}

impl PlanProgress {
    /// Furthest phase a run has completed.
    pub fn phase(&self) -> Option<MigrationPhase> {
        self.phase
    }

    /// Check if a run has completed `phase`.
    pub fn reached(&self, phase: MigrationPhase) -> bool {
        self.phase.is_some_and(|p| p >= phase)
    }

    /// Record that `phase` completed.
    pub fn reach(&mut self, phase: MigrationPhase) {
        if !self.reached(phase) {
            self.phase = Some(phase);
        }
    }

    /// Placeholder rows still live.
    pub fn placeholders(&self) -> &NullRecords {
        &self.placeholders
    }

    /// Replace the live placeholder rows.
    pub fn set_placeholders(&mut self, placeholders: NullRecords) {
        self.placeholders = placeholders;
    }
}

/// Ordered steps migrating `from` to `to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    from: VersionId,
    to: VersionId,
    steps: Vec<Step>,
    ghost_tables: BTreeSet<String>,
    progress: PlanProgress,
}

impl Plan {
    /// Create an empty plan.
    pub fn new(from: VersionId, to: VersionId) -> Self {
        Self {
            from,
            to,
            steps: Vec::new(),
            ghost_tables: BTreeSet::new(),
            progress: PlanProgress::default(),
        }
    }

    /// Source version.
    pub fn from_version(&self) -> &VersionId {
        &self.from
    }

    /// Target version.
    pub fn to_version(&self) -> &VersionId {
        &self.to
    }

    /// Append a pending step.
    pub fn push(&mut self, operation: Operation) {
        self.steps.push(Step::new(operation));
    }

    /// Append a pending step (builder form).
    pub fn with_step(mut self, operation: Operation) -> Self {
        self.push(operation);
        self
    }

    /// Schedule a ghost table for creation.
    pub fn add_ghost_table(&mut self, table_id: impl Into<String>) {
        self.ghost_tables.insert(table_id.into());
    }

    /// Schedule a ghost table for creation (builder form).
    pub fn with_ghost_table(mut self, table_id: impl Into<String>) -> Self {
        self.add_ghost_table(table_id);
        self
    }

    /// Ghost tables created before the steps run.
    pub fn ghost_tables(&self) -> &BTreeSet<String> {
        &self.ghost_tables
    }

    /// All steps in order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the first step that has not run.
    ///
    /// Steps run strictly in order, so every step before it has run.
    pub fn next_pending(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.executed)
    }

    /// Check if every step has run.
    pub fn is_complete(&self) -> bool {
        self.next_pending().is_none()
    }

    /// Mark a step as executed.
    pub fn mark_executed(&mut self, index: usize) -> Result<(), PlanError> {
        match self.steps.get_mut(index) {
            Some(step) => step.mark_executed(index),
            None => Err(PlanError::UnknownStep(index)),
        }
    }

    /// What earlier runs left behind.
    pub fn progress(&self) -> &PlanProgress {
        &self.progress
    }

    /// Mutable access for the executor.
    pub fn progress_mut(&mut self) -> &mut PlanProgress {
        &mut self.progress
    }

    /// First step index at which each table is a COPY target.
    pub fn copy_positions(&self) -> HashMap<&str, usize> {
        let mut positions = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.operation.kind == OperationKind::Copy {
                if let Some(target) = step.operation.target() {
                    positions.entry(target).or_insert(index);
                }
            }
        }
        positions
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "plan {} -> {}", self.from, self.to)?;
        for (index, step) in self.steps.iter().enumerate() {
            let mark = if step.executed { "x" } else { " " };
            writeln!(f, "  [{mark}] {index}: {}", step.operation)?;
        }
        Ok(())
    }
}
