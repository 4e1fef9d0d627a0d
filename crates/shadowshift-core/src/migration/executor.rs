//! Migration execution.
//!
//! The executor is a strictly sequential state machine:
//!
//! ```text
//! Init -> GhostTablesCreated -> StepsDrained -> IndexesCreated -> BackwardSynced -> Persisted
//! ```
//!
//! A failure stops the run where it is. Nothing is rolled back: steps that
//! completed stay applied. The plan records the phases completed and the
//! live placeholder rows, so re-running it skips finished phases and
//! resumes at the first step not marked executed.

use super::data_migrator::{BackfillConfig, CopyProgress, TableDataMigrator};
use super::error::MigrationError;
use super::mapping::DataMapping;
use super::null_records::NullRecords;
use super::plan::{Operation, OperationKind, Plan};
use super::sync_function::SyncFunction;
use super::table_creator::TableCreator;
use crate::backend::{Backend, Connection, LoggedConnection};
use crate::versioning::{State, VersionId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Configuration for migration execution.
#[derive(Debug, Clone, Default)]
pub struct MigrationConfig {
    /// Backfill configuration.
    pub backfill: BackfillConfig,
    /// Log every statement at `info` instead of `debug`.
    pub log_statements: bool,
}

impl MigrationConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary-key range copied per batch.
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.backfill.batch_size = batch_size;
        self
    }

    /// Set the pause between copy batches.
    pub fn with_batch_delay_ms(mut self, batch_delay_ms: u64) -> Self {
        self.backfill.batch_delay_ms = batch_delay_ms;
        self
    }

    /// Log every statement at `info`.
    pub fn with_statement_logging(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }
}

/// Phase of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationPhase {
    /// Nothing done yet.
    Init,
    /// Ghost tables and their foreign keys exist.
    GhostTablesCreated,
    /// Every plan step has run.
    StepsDrained,
    /// Ghost table indexes exist.
    IndexesCreated,
    /// Ghost tables sync back to their sources.
    BackwardSynced,
    /// The migration state was persisted.
    Persisted,
}

impl MigrationPhase {
    /// The phase following this one.
    pub fn next(self) -> Option<Self> {
        match self {
            MigrationPhase::Init => Some(MigrationPhase::GhostTablesCreated),
            MigrationPhase::GhostTablesCreated => Some(MigrationPhase::StepsDrained),
            MigrationPhase::StepsDrained => Some(MigrationPhase::IndexesCreated),
            MigrationPhase::IndexesCreated => Some(MigrationPhase::BackwardSynced),
            MigrationPhase::BackwardSynced => Some(MigrationPhase::Persisted),
            MigrationPhase::Persisted => None,
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationPhase::Init => write!(f, "INIT"),
            MigrationPhase::GhostTablesCreated => write!(f, "GHOST_TABLES_CREATED"),
            MigrationPhase::StepsDrained => write!(f, "STEPS_DRAINED"),
            MigrationPhase::IndexesCreated => write!(f, "INDEXES_CREATED"),
            MigrationPhase::BackwardSynced => write!(f, "BACKWARD_SYNCED"),
            MigrationPhase::Persisted => write!(f, "PERSISTED"),
        }
    }
}

/// Tracks the current phase; only moves to the immediate successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTracker {
    current: MigrationPhase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            current: MigrationPhase::Init,
        }
    }
}

impl PhaseTracker {
    /// Start at [`MigrationPhase::Init`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn current(&self) -> MigrationPhase {
        self.current
    }

    /// Move to `to`, which must directly follow the current phase.
    pub fn advance(&mut self, to: MigrationPhase) -> Result<(), MigrationError> {
        if self.current.next() != Some(to) {
            return Err(MigrationError::PhaseOrder {
                from: self.current,
                to,
            });
        }
        debug!(from = %self.current, to = %to, "Migration phase");
        self.current = to;
        Ok(())
    }
}

/// Shared cancellation flag.
///
/// Once set, the flag stays set; the run stops before the next step or
/// copy batch.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of a migration run.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    /// Phase reached.
    pub phase: MigrationPhase,
    /// Steps executed in this run.
    pub steps_executed: usize,
    /// One entry per COPY step.
    pub copy_progress: Vec<CopyProgress>,
    /// Planner-created versions removed after persisting.
    pub intermediate_versions: Vec<VersionId>,
}

/// Runs one plan. Owns the placeholder rows, sync functions, and
/// migrated-column bookkeeping of that run.
pub struct MigrationExecutor<'a, B: Backend> {
    backend: &'a B,
    config: &'a MigrationConfig,
    cancel: CancelHandle,
    phase: PhaseTracker,
    placeholders: NullRecords,
    sync_functions: BTreeMap<(String, String), SyncFunction>,
    migrated: BTreeMap<String, BTreeSet<String>>,
    sources: BTreeMap<String, String>,
    copy_progress: Vec<CopyProgress>,
    steps_executed: usize,
}

impl<'a, B: Backend> MigrationExecutor<'a, B> {
    /// Create an executor for one run.
    pub fn new(backend: &'a B, config: &'a MigrationConfig, cancel: CancelHandle) -> Self {
        Self {
            backend,
            config,
            cancel,
            phase: PhaseTracker::new(),
            placeholders: NullRecords::new(),
            sync_functions: BTreeMap::new(),
            migrated: BTreeMap::new(),
            sources: BTreeMap::new(),
            copy_progress: Vec::new(),
            steps_executed: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> MigrationPhase {
        self.phase.current()
    }

    /// Live placeholder rows.
    pub fn placeholders(&self) -> &NullRecords {
        &self.placeholders
    }

    /// Columns migrated so far, per ghost table.
    pub fn migrated_columns(&self, table_id: &str) -> Option<&BTreeSet<String>> {
        self.migrated.get(table_id)
    }

    /// The sync function installed for a table pair.
    pub fn sync_function(&self, source: &str, target: &str) -> Option<&SyncFunction> {
        self.sync_functions
            .get(&(source.to_string(), target.to_string()))
    }

    /// Run every phase and persist the resulting state.
    pub fn execute(mut self, state: &mut State, plan: &mut Plan) -> Result<MigrationReport, MigrationError> {
        let mut raw = self.backend.connect()?;
        let mut conn = LoggedConnection::new(&mut raw, self.config.log_statements);
        if let Some(phase) = plan.progress().phase() {
            info!(phase = %phase, next_step = ?plan.next_pending(), "Resuming plan");
        }

        if !plan.progress().reached(MigrationPhase::GhostTablesCreated) {
            TableCreator::new(&state.catalog).create_tables(&mut conn, plan.ghost_tables())?;
        }
        self.advance(plan, MigrationPhase::GhostTablesCreated)?;

        self.drain(&mut conn, state, plan)?;
        self.advance(plan, MigrationPhase::StepsDrained)?;

        if !plan.progress().reached(MigrationPhase::IndexesCreated) {
            let indexes = TableCreator::new(&state.catalog).create_indexes(&mut conn, plan.ghost_tables())?;
            info!(indexes, "Created ghost table indexes");
        }
        self.advance(plan, MigrationPhase::IndexesCreated)?;

        self.synchronize_backward(&mut conn, state, plan)?;
        self.advance(plan, MigrationPhase::BackwardSynced)?;

        self.backend.persist_state(state)?;
        self.advance(plan, MigrationPhase::Persisted)?;

        info!(
            from = %plan.from_version(),
            to = %plan.to_version(),
            steps = self.steps_executed,
            "Migration complete"
        );
        Ok(MigrationReport {
            phase: self.phase.current(),
            steps_executed: self.steps_executed,
            copy_progress: self.copy_progress,
            intermediate_versions: Vec::new(),
        })
    }

    fn advance(&mut self, plan: &mut Plan, to: MigrationPhase) -> Result<(), MigrationError> {
        self.phase.advance(to)?;
        plan.progress_mut().reach(to);
        Ok(())
    }

    /// Run every pending step in plan order. Returns the number run.
    ///
    /// A fully executed plan yields no work.
    pub fn drain<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        state: &mut State,
        plan: &mut Plan,
    ) -> Result<usize, MigrationError> {
        self.sources = state
            .ref_log
            .ghost_table_mapping(plan.from_version(), plan.to_version())
            .into_iter()
            .map(|(source, ghost)| (ghost, source))
            .collect();
        self.resume_bookkeeping(plan);

        let mut executed = 0;
        while let Some(step_index) = plan.next_pending() {
            if self.cancel.is_cancelled() {
                warn!(step_index, "Migration cancelled");
                return Err(MigrationError::Cancelled { step_index });
            }

            let operation = plan.steps()[step_index].operation().clone();
            debug!(step_index, operation = %operation, "Executing step");
            let outcome = self.execute_step(conn, state, &operation, step_index);
            plan.progress_mut().set_placeholders(self.placeholders.clone());
            match outcome {
                Ok(()) => {
                    plan.mark_executed(step_index)?;
                    executed += 1;
                    self.steps_executed += 1;
                }
                Err(e @ MigrationError::Cancelled { .. }) => {
                    warn!(step_index, operation = %operation, "Migration cancelled during step");
                    return Err(e);
                }
                Err(e) => {
                    error!(step_index, operation = %operation, error = %e, "Migration step failed");
                    return Err(MigrationError::StepFailed {
                        step_index,
                        operation: operation.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(executed)
    }

    /// Rebuild placeholders and migrated-column sets from steps run by an
    /// earlier attempt.
    fn resume_bookkeeping(&mut self, plan: &Plan) {
        self.placeholders = plan.progress().placeholders().clone();
        for step in plan.steps().iter().filter(|s| s.is_executed()) {
            let operation = step.operation();
            if operation.kind() != OperationKind::Copy {
                continue;
            }
            let Some(target) = operation.target() else {
                continue;
            };
            self.migrated
                .entry(target.to_string())
                .or_default()
                .extend(operation.columns().iter().cloned());
            if let Some(source) = self.sources.get(target) {
                self.sync_functions
                    .entry((source.clone(), target.to_string()))
                    .or_insert_with(|| SyncFunction::new(source.clone(), target))
                    .add_columns(operation.columns().iter().cloned());
            }
        }
    }

    fn execute_step<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        state: &mut State,
        operation: &Operation,
        step_index: usize,
    ) -> Result<(), MigrationError> {
        match operation.kind() {
            OperationKind::AddNull => {
                self.placeholders.insert(conn, &state.catalog, operation.tables())?;
            }
            OperationKind::DropNull => {
                if operation.tables().iter().any(|t| self.placeholders.has_placeholder(t)) {
                    self.placeholders.delete(conn, &state.catalog, operation.tables())?;
                } else {
                    debug!(operation = %operation, "Placeholders already removed");
                }
                self.refresh_sync_functions(conn, state)?;
            }
            OperationKind::Copy => self.copy(conn, state, operation, step_index)?,
        }
        Ok(())
    }

    /// Install or grow the forward sync function, then copy the newly
    /// requested columns.
    fn copy<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        state: &mut State,
        operation: &Operation,
        step_index: usize,
    ) -> Result<(), MigrationError> {
        let target = operation.target().ok_or(MigrationError::EmptyOperation {
            kind: operation.kind(),
        })?;
        let source = self
            .sources
            .get(target)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownTable(target.to_string()))?;
        let mapping = DataMapping::new(&state.catalog, &source, target)?;

        let requested: BTreeSet<String> = operation
            .columns()
            .iter()
            .filter(|c| {
                let mapped = mapping.maps(c);
                if !mapped {
                    warn!(table = %target, column = %c, "Column has no source, skipping");
                }
                mapped
            })
            .cloned()
            .collect();
        let previously = self.migrated.get(target).cloned();
        let first_pass = previously.is_none();
        let new_columns: BTreeSet<String> = match &previously {
            Some(previous) => requested.difference(previous).cloned().collect(),
            None => requested.clone(),
        };

        self.install_sync_function(conn, state, &source, target, requested.iter().cloned())?;

        let progress = TableDataMigrator::new(
            &state.catalog,
            &self.placeholders,
            &self.config.backfill,
            &self.cancel,
        )
        .copy(conn, &mapping, &new_columns, first_pass, step_index)?;
        self.copy_progress.push(progress);

        self.migrated
            .entry(target.to_string())
            .or_default()
            .extend(requested);
        Ok(())
    }

    /// Create or replace the function for a pair; create its trigger once.
    fn install_sync_function<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        state: &mut State,
        source: &str,
        target: &str,
        columns: impl IntoIterator<Item = String>,
    ) -> Result<(), MigrationError> {
        let function = self
            .sync_functions
            .entry((source.to_string(), target.to_string()))
            .or_insert_with(|| SyncFunction::new(source, target));
        function.add_columns(columns);

        conn.execute(&function.create_function_sql(&state.catalog, &self.placeholders)?)?;
        state
            .functions
            .put_function(source, target, function.function_name());

        if state.functions.trigger(source, target).is_none() {
            conn.execute(&function.create_trigger_sql())?;
            state
                .functions
                .put_trigger(source, target, function.trigger_name());
            info!(source, target, trigger = %function.trigger_name(), "Installed sync trigger");
        }
        Ok(())
    }

    /// Regenerate every installed function after placeholders change.
    fn refresh_sync_functions<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        state: &State,
    ) -> Result<(), MigrationError> {
        for function in self.sync_functions.values() {
            if state.functions.trigger(function.source(), function.target()).is_some() {
                conn.execute(&function.create_function_sql(&state.catalog, &self.placeholders)?)?;
            }
        }
        Ok(())
    }

    /// Install a ghost-to-source sync function for every mapped pair.
    ///
    /// Pairs are ordered by the first COPY of their ghost table; pairs
    /// whose ghost is never copied keep their relative order at the end.
    fn synchronize_backward<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        state: &mut State,
        plan: &Plan,
    ) -> Result<(), MigrationError> {
        let positions: HashMap<&str, usize> = plan.copy_positions();
        let mut mappings = state
            .ref_log
            .ghost_table_mapping(plan.from_version(), plan.to_version())
            .into_iter()
            .map(|(source, ghost)| DataMapping::new(&state.catalog, &source, &ghost))
            .collect::<Result<Vec<_>, _>>()?;
        mappings.sort_by_key(|m| positions.get(m.target()).copied().unwrap_or(usize::MAX));

        for mapping in mappings {
            let backward = mapping.reversed();
            let columns = backward.columns().to_vec();
            self.install_sync_function(conn, state, backward.source(), backward.target(), columns)?;
        }
        Ok(())
    }
}
