//! Physical schema model.
//!
//! The catalog holds every physical table known to the migration engine,
//! ghost tables included, along with column, key, and index metadata.

#[allow(clippy::module_inception)]
mod catalog;
mod table;
mod types;

pub use catalog::Catalog;
pub use table::{Column, ForeignKey, Index, ReferentialAction, Sequence, Table};
pub use types::{ColumnType, Value};

use thiserror::Error;

/// Catalog lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// A table id is not present in the catalog.
    #[error("unknown table: {0}")]
    UnknownTable(String),
}
