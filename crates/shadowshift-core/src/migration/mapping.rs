//! Column mapping between a source table and its counterpart.
//!
//! Columns map by name. The projection renders the value expression for
//! each written column, substituting a placeholder key for foreign keys
//! whose referenced row has not been copied yet.

use super::null_records::NullRecords;
use crate::catalog::{Catalog, CatalogError, Table};
use crate::sql::{qualified, quoted};
use std::collections::BTreeSet;

/// Source table, target table, and the columns they share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMapping {
    source: String,
    target: String,
    columns: Vec<String>,
}

impl DataMapping {
    /// Map every column of `target` that also exists in `source`.
    pub fn new(catalog: &Catalog, source: &str, target: &str) -> Result<Self, CatalogError> {
        let source_table = catalog.require_table(source)?;
        let target_table = catalog.require_table(target)?;
        let columns = target_table
            .columns
            .iter()
            .filter(|c| source_table.has_column(&c.name))
            .map(|c| c.name.clone())
            .collect();
        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            columns,
        })
    }

    /// The same mapping in the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.target.clone(),
            target: self.source.clone(),
            columns: self.columns.clone(),
        }
    }

    /// Source table id.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Target table id.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Shared columns in target declaration order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Check if a column is shared.
    pub fn maps(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Renders the written columns of a target row from a source row alias.
pub(crate) struct RowProjection<'a> {
    catalog: &'a Catalog,
    target: &'a Table,
    placeholders: &'a NullRecords,
}

impl<'a> RowProjection<'a> {
    pub(crate) fn new(
        catalog: &'a Catalog,
        target: &str,
        placeholders: &'a NullRecords,
    ) -> Result<Self, CatalogError> {
        Ok(Self {
            catalog,
            target: catalog.require_table(target)?,
            placeholders,
        })
    }

    pub(crate) fn target(&self) -> &'a Table {
        self.target
    }

    /// Value of `column` for a row aliased `row`.
    ///
    /// ```text
    /// CASE WHEN row."c" IS NULL THEN NULL
    ///      ELSE COALESCE((SELECT r."rc" FROM "R" r WHERE r."rc" = row."c"), <placeholder>) END
    /// ```
    pub(crate) fn expression(&self, column: &str, row: &str) -> String {
        let plain = qualified(row, column);
        let Some(fk) = self.target.outgoing_foreign_key(column) else {
            return plain;
        };
        let Some(referred_column) = fk.referred_column(column) else {
            return plain;
        };
        let Some(placeholder) = self.placeholders.value(&fk.referred_table, referred_column) else {
            return plain;
        };
        if !self.catalog.contains(&fk.referred_table) {
            return plain;
        }

        let conditions: Vec<String> = fk
            .column_pairs()
            .map(|(local, remote)| format!("{} = {}", qualified("r", remote), qualified(row, local)))
            .collect();
        format!(
            "CASE WHEN {plain} IS NULL THEN NULL ELSE COALESCE((SELECT {} FROM {} r WHERE {}), {}) END",
            qualified("r", referred_column),
            quoted(&fk.referred_table),
            conditions.join(" AND "),
            placeholder.to_sql_literal()
        )
    }

    /// Placeholder literal for a required column that is not migrated yet.
    pub(crate) fn placeholder_literal(&self, column: &str) -> Option<String> {
        let definition = self.target.column(column)?;
        if !definition.is_required() {
            return None;
        }
        let fk = self.target.outgoing_foreign_key(column)?;
        let referred_column = fk.referred_column(column)?;
        self.placeholders
            .value(&fk.referred_table, referred_column)
            .map(|v| v.to_sql_literal())
    }

    /// `(column, expression)` for every column written on insert.
    ///
    /// Key columns and `migrated` columns take the source value; required
    /// foreign keys that are not migrated yet take the placeholder literal.
    pub(crate) fn insert_columns(
        &self,
        migrated: &BTreeSet<String>,
        row: &str,
    ) -> Vec<(String, String)> {
        self.target
            .columns
            .iter()
            .filter_map(|c| {
                if c.primary_key || migrated.contains(&c.name) {
                    Some((c.name.clone(), self.expression(&c.name, row)))
                } else {
                    self.placeholder_literal(&c.name)
                        .map(|literal| (c.name.clone(), literal))
                }
            })
            .collect()
    }

    /// `(column, expression)` for every migrated non-key column.
    pub(crate) fn update_columns(
        &self,
        migrated: &BTreeSet<String>,
        row: &str,
    ) -> Vec<(String, String)> {
        self.target
            .columns
            .iter()
            .filter(|c| !c.primary_key && migrated.contains(&c.name))
            .map(|c| (c.name.clone(), self.expression(&c.name, row)))
            .collect()
    }

    /// `t."pk" = row."pk" AND ...` joining the target to a row.
    pub(crate) fn key_match(&self, target_alias: Option<&str>, row: &str) -> String {
        self.target
            .primary_key_names()
            .into_iter()
            .map(|pk| {
                let left = match target_alias {
                    Some(alias) => qualified(alias, pk),
                    None => quoted(pk),
                };
                format!("{left} = {}", qualified(row, pk))
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}
