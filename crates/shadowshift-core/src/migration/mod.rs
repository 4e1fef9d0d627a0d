//! Online migration engine.
//!
//! Data moves from the tables of one version into the ghost tables of
//! another while both stay writable:
//! - A [`Plan`] of ADD_NULL, COPY, and DROP_NULL steps, ordered so that
//!   foreign keys are always satisfied
//! - Forward sync triggers installed before each copy, so concurrent
//!   writes are never lost
//! - Placeholder rows standing in for referenced rows not copied yet
//! - Backward sync triggers, so writes to the new version reach the old one
//!
//! # Example
//!
//! ```ignore
//! use shadowshift_core::{DryRunBackend, MigrationConfig, Migrator, VersionId};
//!
//! let migrator = Migrator::new(DryRunBackend::new(), MigrationConfig::default());
//! let report = migrator.migrate(&mut state, &VersionId::new("v1"), &VersionId::new("v2"))?;
//! println!("ran {} steps", report.steps_executed);
//! ```

pub mod data_migrator;
pub mod error;
pub mod executor;
pub mod mapping;
pub mod migrator;
pub mod null_records;
pub mod plan;
pub mod planner;
pub mod sync_function;
pub mod table_creator;
pub mod validator;

pub use data_migrator::{BackfillConfig, CopyProgress, TableDataMigrator};
pub use error::{MigrationError, PlaceholderError, PlanError};
pub use executor::{
    CancelHandle, MigrationConfig, MigrationExecutor, MigrationPhase, MigrationReport, PhaseTracker,
};
pub use mapping::DataMapping;
pub use migrator::Migrator;
pub use null_records::{Identity, NullRecords};
pub use plan::{Operation, OperationKind, Plan, Step};
pub use planner::{GreedyPlanner, MigrationPlanner};
pub use sync_function::SyncFunction;
pub use table_creator::TableCreator;
pub use validator::PlanValidator;
