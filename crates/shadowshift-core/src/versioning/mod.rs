//! Schema versions, table bindings, and persisted migration state.

mod functions;
mod ref_log;
mod state;
mod store;

pub use functions::{MigrationFunctions, SyncObject};
pub use ref_log::{RefLog, TableRef, Version, VersionId};
pub use state::State;
pub use store::StateStore;

use crate::catalog::CatalogError;
use thiserror::Error;

/// Version graph errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// The version is not part of the graph.
    #[error("unknown version: {0}")]
    UnknownVersion(VersionId),

    /// A version with this id already exists.
    #[error("version already exists: {0}")]
    DuplicateVersion(VersionId),

    /// The version has no parent to fork from.
    #[error("version {0} has no parent")]
    NoParent(VersionId),

    /// The logical table is not bound in the version.
    #[error("table {name} does not exist in version {version}")]
    UnknownTable {
        /// Version searched.
        version: VersionId,
        /// Logical table name.
        name: String,
    },

    /// The logical table is already bound in the version.
    #[error("table {name} already exists in version {version}")]
    DuplicateTable {
        /// Version searched.
        version: VersionId,
        /// Logical table name.
        name: String,
    },

    /// The table was already forked in this version.
    #[error("table {name} is already forked in version {version}")]
    AlreadyForked {
        /// Version being edited.
        version: VersionId,
        /// Logical table name.
        name: String,
    },

    /// The physical table id is taken.
    #[error("table id already in use: {0}")]
    DuplicateTableId(String),

    /// Catalog lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}
