//! Entry points: migrate between versions and drop a version.

use super::error::MigrationError;
use super::executor::{CancelHandle, MigrationConfig, MigrationExecutor, MigrationReport};
use super::plan::Plan;
use super::planner::{GreedyPlanner, MigrationPlanner};
use super::sync_function::{drop_function_sql, drop_trigger_sql};
use super::validator::PlanValidator;
use crate::backend::{Backend, Connection, LoggedConnection};
use crate::sql::quoted;
use crate::versioning::{State, VersionId};
use std::collections::BTreeSet;
use tracing::{info, instrument};

/// Plans, validates, and executes migrations against one backend.
pub struct Migrator<B, P = GreedyPlanner> {
    backend: B,
    planner: P,
    config: MigrationConfig,
    cancel: CancelHandle,
}

impl<B: Backend> Migrator<B> {
    /// Create a migrator using the greedy planner.
    pub fn new(backend: B, config: MigrationConfig) -> Self {
        Self {
            backend,
            planner: GreedyPlanner::new(),
            config,
            cancel: CancelHandle::new(),
        }
    }
}

impl<B: Backend, P: MigrationPlanner> Migrator<B, P> {
    /// Replace the planner.
    pub fn with_planner<Q: MigrationPlanner>(self, planner: Q) -> Migrator<B, Q> {
        Migrator {
            backend: self.backend,
            planner,
            config: self.config,
            cancel: self.cancel,
        }
    }

    /// Handle that cancels runs of this migrator.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Build and validate the plan without executing it.
    pub fn plan(&self, state: &mut State, from: &VersionId, to: &VersionId) -> Result<Plan, MigrationError> {
        let plan = self.planner.create_plan(state, from, to)?;
        PlanValidator::validate(&plan, state)?;
        Ok(plan)
    }

    /// Migrate the data of `from` into the ghost tables of `to`.
    ///
    /// Versions the planner added along the way are removed from the ref
    /// log once the final state is persisted.
    #[instrument(skip_all, fields(from = %from, to = %to))]
    pub fn migrate(
        &self,
        state: &mut State,
        from: &VersionId,
        to: &VersionId,
    ) -> Result<MigrationReport, MigrationError> {
        let before = state.ref_log.versions();
        let mut plan = self.plan(state, from, to)?;
        info!(steps = plan.len(), ghost_tables = plan.ghost_tables().len(), "Planned migration");

        let intermediate: Vec<VersionId> = state
            .ref_log
            .versions()
            .difference(&before)
            .filter(|v| *v != to && *v != from)
            .cloned()
            .collect();

        let mut report = self.execute(state, &mut plan)?;

        if !intermediate.is_empty() {
            for version in &intermediate {
                state.ref_log.remove_version(version);
            }
            self.backend.persist_state(state)?;
            info!(versions = intermediate.len(), "Removed intermediate versions");
        }
        report.intermediate_versions = intermediate;
        Ok(report)
    }

    /// Execute a plan, resuming after its last executed step.
    pub fn execute(&self, state: &mut State, plan: &mut Plan) -> Result<MigrationReport, MigrationError> {
        MigrationExecutor::new(&self.backend, &self.config, self.cancel.clone()).execute(state, plan)
    }

    /// Drop a version and every table it owns exclusively.
    ///
    /// For each such table, sync triggers touching it are dropped first,
    /// then their functions, then the table. Tables shared with another
    /// version are kept. Returns the dropped table ids.
    #[instrument(skip_all, fields(version = %version))]
    pub fn drop_version(&self, state: &mut State, version: &VersionId) -> Result<Vec<String>, MigrationError> {
        if state.ref_log.version(version).is_none() {
            return Err(crate::versioning::VersionError::UnknownVersion(version.clone()).into());
        }

        let owned: BTreeSet<String> = state
            .ref_log
            .table_refs()
            .iter()
            .filter(|r| r.is_exclusive_to(version))
            .map(|r| r.table_id.clone())
            .collect();

        let mut raw = self.backend.connect()?;
        let mut conn = LoggedConnection::new(&mut raw, self.config.log_statements);
        for table_id in &owned {
            for trigger in state.functions.triggers_touching(table_id) {
                conn.execute(&drop_trigger_sql(&trigger.name, &trigger.source_table))?;
                state
                    .functions
                    .remove_trigger(&trigger.source_table, &trigger.target_table);
            }
            for function in state.functions.functions_touching(table_id) {
                conn.execute(&drop_function_sql(&function.name))?;
                state
                    .functions
                    .remove_function(&function.source_table, &function.target_table);
            }
            conn.execute(&format!("DROP TABLE {} CASCADE;", quoted(table_id)))?;
            state.ref_log.drop_table(table_id);
            state.catalog.remove_table(table_id);
            info!(table = %table_id, "Dropped table");
        }

        state.ref_log.remove_version(version);
        self.backend.persist_state(state)?;
        Ok(owned.into_iter().collect())
    }
}
