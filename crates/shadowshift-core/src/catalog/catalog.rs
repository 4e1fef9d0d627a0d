//! The schema catalog: every physical table across all versions.

use super::table::Table;
use super::CatalogError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Queryable set of physical tables, keyed by table id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    tables: BTreeMap<String, Table>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table, replacing any table with the same id.
    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Add a table (builder form).
    pub fn with_table(mut self, table: Table) -> Self {
        self.add_table(table);
        self
    }

    /// Remove a table.
    pub fn remove_table(&mut self, table_id: &str) -> Option<Table> {
        self.tables.remove(table_id)
    }

    /// Get a table by id.
    pub fn table(&self, table_id: &str) -> Option<&Table> {
        self.tables.get(table_id)
    }

    /// Get a table by id, failing if it is unknown.
    pub fn require_table(&self, table_id: &str) -> Result<&Table, CatalogError> {
        self.table(table_id)
            .ok_or_else(|| CatalogError::UnknownTable(table_id.to_string()))
    }

    /// Get a mutable table by id.
    pub fn table_mut(&mut self, table_id: &str) -> Option<&mut Table> {
        self.tables.get_mut(table_id)
    }

    /// Check if a table exists.
    pub fn contains(&self, table_id: &str) -> bool {
        self.tables.contains_key(table_id)
    }

    /// Iterate over all tables in id order.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Tables reachable from `seeds` through required foreign keys.
    ///
    /// A placeholder row for a table must satisfy its primary-key and
    /// NOT NULL foreign keys, so the referenced tables need placeholders as
    /// well. The result includes the seeds themselves. Cycles are fine here:
    /// each table is visited once.
    pub fn placeholder_closure<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a String>,
    ) -> Result<BTreeSet<String>, CatalogError> {
        let mut closure = BTreeSet::new();
        let mut pending: Vec<String> = seeds.into_iter().cloned().collect();

        while let Some(table_id) = pending.pop() {
            if !closure.insert(table_id.clone()) {
                continue;
            }

            let table = self.require_table(&table_id)?;
            for fk in &table.foreign_keys {
                let required = fk
                    .referencing_columns
                    .iter()
                    .filter_map(|c| table.column(c))
                    .any(|c| c.is_required());
                if required && !closure.contains(&fk.referred_table) {
                    pending.push(fk.referred_table.clone());
                }
            }
        }

        Ok(closure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType, ForeignKey};

    fn catalog() -> Catalog {
        let customers = Table::new("customers")
            .with_column(Column::new("id", ColumnType::BigInt).primary_key());
        let orders = Table::new("orders")
            .with_column(Column::new("id", ColumnType::BigInt).primary_key())
            .with_column(Column::new("customer_id", ColumnType::BigInt).not_null())
            .with_foreign_key(ForeignKey::new("fk_customer", &["customer_id"], "customers", &["id"]));
        let notes = Table::new("notes")
            .with_column(Column::new("id", ColumnType::BigInt).primary_key())
            .with_column(Column::new("order_id", ColumnType::BigInt))
            .with_foreign_key(ForeignKey::new("fk_order", &["order_id"], "orders", &["id"]));

        Catalog::new().with_table(customers).with_table(orders).with_table(notes)
    }

    #[test]
    fn test_closure_follows_required_keys() {
        let catalog = catalog();
        let closure = catalog.placeholder_closure(&["orders".to_string()]).unwrap();
        assert_eq!(
            closure,
            BTreeSet::from(["customers".to_string(), "orders".to_string()])
        );
    }

    #[test]
    fn test_closure_skips_nullable_keys() {
        let catalog = catalog();
        let closure = catalog.placeholder_closure(&["notes".to_string()]).unwrap();
        assert_eq!(closure, BTreeSet::from(["notes".to_string()]));
    }

    #[test]
    fn test_closure_unknown_table() {
        let catalog = catalog();
        let result = catalog.placeholder_closure(&["missing".to_string()]);
        assert!(matches!(result, Err(CatalogError::UnknownTable(_))));
    }
}
