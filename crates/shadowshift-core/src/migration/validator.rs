//! Static checks run on a plan before it touches the database.

use super::error::PlanError;
use super::plan::{OperationKind, Plan};
use crate::catalog::CatalogError;
use crate::versioning::State;
use std::collections::BTreeSet;

/// Rejects plans that would break referential integrity while running.
pub struct PlanValidator;

impl PlanValidator {
    /// Validate `plan` against `state`.
    ///
    /// Checks that every ghost table is created, that placeholders are
    /// added and dropped in pairs, and that every copied foreign key column
    /// points at a ghost table that is already copied or protected by a
    /// placeholder.
    pub fn validate(plan: &Plan, state: &State) -> Result<(), PlanError> {
        let catalog = &state.catalog;
        for step in plan.steps() {
            if let Some(table) = step.operation().tables().iter().find(|t| !catalog.contains(t)) {
                return Err(PlanError::UnknownTable(table.clone()));
            }
        }

        let mut ghosts = state
            .ref_log
            .ghost_table_ids(plan.from_version(), plan.to_version());
        for step in plan.steps() {
            if step.operation().kind() == OperationKind::Copy {
                ghosts.extend(step.operation().tables().iter().cloned());
            }
        }
        if let Some(missing) = ghosts.iter().find(|g| !plan.ghost_tables().contains(*g)) {
            return Err(PlanError::MissingCreate(missing.clone()));
        }

        let mut live: BTreeSet<String> = BTreeSet::new();
        let mut copied: BTreeSet<String> = BTreeSet::new();
        for (step_index, step) in plan.steps().iter().enumerate() {
            let operation = step.operation();
            match operation.kind() {
                OperationKind::AddNull => {
                    if let Some(table) = operation.tables().iter().find(|t| live.contains(*t)) {
                        return Err(PlanError::DuplicatePlaceholder {
                            step_index,
                            table: table.clone(),
                        });
                    }
                    let closure = catalog
                        .placeholder_closure(operation.tables())
                        .map_err(|CatalogError::UnknownTable(t)| PlanError::UnknownTable(t))?;
                    live.extend(closure);
                }
                OperationKind::DropNull => {
                    for table in operation.tables() {
                        if !live.remove(table) {
                            return Err(PlanError::MissingPlaceholder {
                                step_index,
                                table: table.clone(),
                            });
                        }
                    }
                }
                OperationKind::Copy => {
                    let Some(target) = operation.target() else {
                        continue;
                    };
                    let table = catalog
                        .table(target)
                        .ok_or_else(|| PlanError::UnknownTable(target.to_string()))?;
                    let first_pass = !copied.contains(target);

                    for fk in &table.foreign_keys {
                        let referred = fk.referred_table.as_str();
                        if referred == target || !ghosts.contains(referred) {
                            continue;
                        }
                        for column in &fk.referencing_columns {
                            let Some(definition) = table.column(column) else {
                                continue;
                            };
                            let written =
                                definition.primary_key || operation.columns().contains(column);
                            // Unwritten required columns take the placeholder key on insert.
                            let violated = if written {
                                !copied.contains(referred) && !live.contains(referred)
                            } else {
                                first_pass && definition.not_null && !live.contains(referred)
                            };
                            if violated {
                                return Err(PlanError::MissingDependency {
                                    step_index,
                                    table: target.to_string(),
                                    column: column.clone(),
                                    referred_table: referred.to_string(),
                                });
                            }
                        }
                    }
                    copied.insert(target.to_string());
                }
            }
        }

        match live.into_iter().next() {
            Some(table) => Err(PlanError::DanglingPlaceholder(table)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Column, ColumnType, ForeignKey, Table};
    use crate::migration::plan::Operation;
    use crate::versioning::{RefLog, VersionId};

    fn v(id: &str) -> VersionId {
        VersionId::new(id)
    }

    /// `a_v2.b_id -> b_v2.id`, both ghosts of v2.
    fn state() -> State {
        let b = Table::new("b").with_column(Column::new("id", ColumnType::BigInt).primary_key());
        let a = Table::new("a")
            .with_column(Column::new("id", ColumnType::BigInt).primary_key())
            .with_column(Column::new("x", ColumnType::Text))
            .with_column(Column::new("b_id", ColumnType::BigInt).not_null())
            .with_foreign_key(ForeignKey::new("a_b", &["b_id"], "b", &["id"]));
        let mut ref_log = RefLog::new();
        ref_log.add_root_version(v("v1")).unwrap();
        ref_log.add_table(&v("v1"), "a", "a").unwrap();
        ref_log.add_table(&v("v1"), "b", "b").unwrap();
        ref_log.fork_version(&v("v1"), v("v2")).unwrap();
        let mut state = State::new(Catalog::new().with_table(a).with_table(b), ref_log);
        state.fork_table_as(&v("v2"), "b", "b_v2").unwrap();
        state
    }

    fn a_ghost(state: &State) -> String {
        state.ref_log.table_ref(&v("v2"), "a").unwrap().table_id.clone()
    }

    fn base(state: &State) -> Plan {
        Plan::new(v("v1"), v("v2"))
            .with_ghost_table(a_ghost(state))
            .with_ghost_table("b_v2")
    }

    #[test]
    fn test_placeholder_protected_copy_is_valid() {
        let state = state();
        let plan = base(&state)
            .with_step(Operation::add_null(["b_v2"]))
            .with_step(Operation::copy(a_ghost(&state), ["x"]))
            .with_step(Operation::drop_null(["b_v2"]));
        assert_eq!(PlanValidator::validate(&plan, &state), Ok(()));
    }

    #[test]
    fn test_required_column_without_placeholder() {
        let state = state();
        let plan = base(&state).with_step(Operation::copy(a_ghost(&state), ["x"]));
        assert!(matches!(
            PlanValidator::validate(&plan, &state),
            Err(PlanError::MissingDependency { step_index: 0, .. })
        ));
    }

    #[test]
    fn test_copied_target_satisfies_foreign_key() {
        let state = state();
        let plan = base(&state)
            .with_step(Operation::copy("b_v2", ["id"]))
            .with_step(Operation::copy(a_ghost(&state), ["id", "x", "b_id"]));
        assert_eq!(PlanValidator::validate(&plan, &state), Ok(()));
    }

    #[test]
    fn test_missing_create() {
        let state = state();
        let plan = Plan::new(v("v1"), v("v2"))
            .with_ghost_table("b_v2")
            .with_step(Operation::copy("b_v2", ["id"]));
        assert_eq!(
            PlanValidator::validate(&plan, &state),
            Err(PlanError::MissingCreate(a_ghost(&state)))
        );
    }

    #[test]
    fn test_placeholder_pairing() {
        let state = state();
        let twice = base(&state)
            .with_step(Operation::add_null(["b_v2"]))
            .with_step(Operation::add_null(["b_v2"]));
        assert!(matches!(
            PlanValidator::validate(&twice, &state),
            Err(PlanError::DuplicatePlaceholder { step_index: 1, .. })
        ));

        let dangling = base(&state).with_step(Operation::add_null(["b_v2"]));
        assert_eq!(
            PlanValidator::validate(&dangling, &state),
            Err(PlanError::DanglingPlaceholder("b_v2".to_string()))
        );

        let missing = base(&state).with_step(Operation::drop_null(["b_v2"]));
        assert!(matches!(
            PlanValidator::validate(&missing, &state),
            Err(PlanError::MissingPlaceholder { step_index: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_table() {
        let state = state();
        let plan = base(&state).with_step(Operation::add_null(["nope"]));
        assert_eq!(
            PlanValidator::validate(&plan, &state),
            Err(PlanError::UnknownTable("nope".to_string()))
        );
    }
}
