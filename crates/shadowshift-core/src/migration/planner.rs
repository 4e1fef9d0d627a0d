//! Plan construction.
//!
//! The greedy planner orders ghost tables so that a table is copied after
//! the tables its foreign keys point at. Foreign key cycles are broken by
//! copying a table without its unmet foreign key columns, protecting
//! required ones with placeholder rows, and copying the held-back columns
//! once their targets have been copied.

use super::error::{MigrationError, PlanError};
use super::mapping::DataMapping;
use super::plan::{Operation, Plan};
use crate::catalog::Catalog;
use crate::versioning::{State, VersionId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Derives a [`Plan`] from the difference between two versions.
pub trait MigrationPlanner {
    /// Build the plan migrating `from` to `to`.
    ///
    /// A planner may add intermediate versions to the ref log; the
    /// executor removes them once the migration has been persisted.
    fn create_plan(
        &self,
        state: &mut State,
        from: &VersionId,
        to: &VersionId,
    ) -> Result<Plan, MigrationError>;
}

/// Dependency-ordered planner with placeholder-based cycle breaking.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyPlanner;

impl GreedyPlanner {
    /// Create a greedy planner.
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
struct Dependency {
    column: String,
    target: String,
    key: bool,
    required: bool,
}

#[derive(Debug)]
struct PendingTable {
    ghost: String,
    columns: Vec<String>,
    dependencies: Vec<Dependency>,
}

impl PendingTable {
    fn new(
        catalog: &Catalog,
        source: &str,
        ghost: &str,
        migratable: &BTreeSet<&str>,
    ) -> Result<Self, MigrationError> {
        let mapping = DataMapping::new(catalog, source, ghost)?;
        let table = catalog.require_table(ghost)?;
        let mut dependencies = Vec::new();
        for fk in &table.foreign_keys {
            if fk.referred_table == ghost || !migratable.contains(fk.referred_table.as_str()) {
                continue;
            }
            for column in &fk.referencing_columns {
                let Some(definition) = table.column(column) else {
                    continue;
                };
                if mapping.maps(column) {
                    dependencies.push(Dependency {
                        column: column.clone(),
                        target: fk.referred_table.clone(),
                        key: definition.primary_key,
                        required: definition.is_required(),
                    });
                }
            }
        }
        Ok(Self {
            ghost: ghost.to_string(),
            columns: mapping.columns().to_vec(),
            dependencies,
        })
    }

    fn unmet<'a>(&'a self, copied: &'a BTreeSet<String>) -> impl Iterator<Item = &'a Dependency> + 'a {
        self.dependencies.iter().filter(move |d| !copied.contains(&d.target))
    }
}

impl MigrationPlanner for GreedyPlanner {
    fn create_plan(
        &self,
        state: &mut State,
        from: &VersionId,
        to: &VersionId,
    ) -> Result<Plan, MigrationError> {
        let mut plan = Plan::new(from.clone(), to.clone());
        for ghost in state.ref_log.ghost_table_ids(from, to) {
            plan.add_ghost_table(ghost);
        }

        let pairs = state.ref_log.ghost_table_mapping(from, to);
        let migratable: BTreeSet<&str> = pairs.iter().map(|(_, ghost)| ghost.as_str()).collect();
        let mut pending = pairs
            .iter()
            .map(|(source, ghost)| PendingTable::new(&state.catalog, source, ghost, &migratable))
            .collect::<Result<Vec<_>, _>>()?;

        let mut copied: BTreeSet<String> = BTreeSet::new();
        let mut live: BTreeSet<String> = BTreeSet::new();
        let mut waiting: Vec<(String, String, String)> = Vec::new();

        while !pending.is_empty() {
            let index = pending
                .iter()
                .position(|t| t.unmet(&copied).next().is_none())
                .or_else(|| {
                    pending
                        .iter()
                        .position(|t| t.unmet(&copied).all(|d| !d.key))
                })
                .ok_or_else(|| {
                    PlanError::Unsatisfiable(pending.iter().map(|t| t.ghost.clone()).collect())
                })?;
            let table = pending.remove(index);

            let deferred: Vec<&Dependency> = table.unmet(&copied).collect();
            let required: BTreeSet<String> = deferred
                .iter()
                .filter(|d| d.required)
                .map(|d| d.target.clone())
                .collect();
            if !required.is_empty() {
                let needed: BTreeSet<String> = state
                    .catalog
                    .placeholder_closure(&required)?
                    .difference(&live)
                    .cloned()
                    .collect();
                if !needed.is_empty() {
                    debug!(table = %table.ghost, placeholders = ?needed, "Breaking foreign key cycle");
                    live.extend(needed.iter().cloned());
                    plan.push(Operation::add_null(needed));
                }
            }

            let held_back: BTreeSet<&str> = deferred.iter().map(|d| d.column.as_str()).collect();
            plan.push(Operation::copy(
                table.ghost.clone(),
                table.columns.iter().filter(|c| !held_back.contains(c.as_str())).cloned(),
            ));
            for dependency in &deferred {
                waiting.push((table.ghost.clone(), dependency.column.clone(), dependency.target.clone()));
            }
            copied.insert(table.ghost.clone());

            let mut ready: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            waiting.retain(|(ghost, column, target)| {
                if copied.contains(target) {
                    ready.entry(ghost.clone()).or_default().insert(column.clone());
                    false
                } else {
                    true
                }
            });
            for (ghost, columns) in ready {
                plan.push(Operation::copy(ghost, columns));
            }
        }

        if !live.is_empty() {
            plan.push(Operation::drop_null(live));
        }
        debug!(steps = plan.len(), "Created plan");
        Ok(plan)
    }
}
