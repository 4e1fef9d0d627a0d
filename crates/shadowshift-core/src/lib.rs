//! ShadowShift Core - zero-downtime schema migrations for PostgreSQL.
//!
//! Tables are migrated through ghost copies kept in sync with their
//! originals by triggers in both directions.

pub mod backend;
pub mod catalog;
pub mod error;
pub mod migration;
pub mod sql;
pub mod versioning;

pub use backend::{Backend, BackendError, Connection, DryRunBackend};
pub use catalog::{Catalog, Column, ColumnType, ForeignKey, Table, Value};
pub use error::Error;
pub use migration::{
    BackfillConfig, CancelHandle, GreedyPlanner, MigrationConfig, MigrationError, MigrationPhase,
    MigrationPlanner, MigrationReport, Migrator, Operation, Plan, PlanValidator,
};
pub use versioning::{MigrationFunctions, RefLog, State, StateStore, VersionId};
