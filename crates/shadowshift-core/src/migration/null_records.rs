//! Placeholder ("null record") rows.
//!
//! A placeholder row satisfies the NOT NULL and foreign key constraints of
//! rows whose real referenced row has not been copied yet. Placeholders are
//! generated transitively across required foreign keys and tracked by
//! their primary-key [`Identity`] until they are deleted again.

use super::error::PlaceholderError;
use crate::backend::{in_transaction, Connection};
use crate::catalog::{Catalog, ColumnType, Table, Value};
use crate::sql::{parameter, quoted, quoted_literal};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Primary-key values of one placeholder row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Identity {
    values: BTreeMap<String, Value>,
}

impl Identity {
    /// Value of a key column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Iterate over `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// Number of key columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the identity has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PlaceholderRow {
    identity: Identity,
    values: BTreeMap<String, Value>,
}

/// Tracks the live placeholder rows of one migration run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NullRecords {
    rows: BTreeMap<String, PlaceholderRow>,
}

impl NullRecords {
    /// Create a manager with no live placeholders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a table has a live placeholder.
    pub fn has_placeholder(&self, table_id: &str) -> bool {
        self.rows.contains_key(table_id)
    }

    /// Identity of a table's live placeholder.
    pub fn identity(&self, table_id: &str) -> Option<&Identity> {
        self.rows.get(table_id).map(|r| &r.identity)
    }

    /// Value written to a column of a table's live placeholder.
    pub fn value(&self, table_id: &str, column: &str) -> Option<&Value> {
        self.rows.get(table_id)?.values.get(column)
    }

    /// Tables with a live placeholder.
    pub fn live_tables(&self) -> BTreeSet<String> {
        self.rows.keys().cloned().collect()
    }

    /// Insert placeholder rows for `tables`.
    ///
    /// Tables referenced through required foreign keys get a placeholder
    /// too, unless they already have one, in which case it is reused. All
    /// rows are inserted in one transaction with constraints deferred.
    pub fn insert<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        catalog: &Catalog,
        tables: &BTreeSet<String>,
    ) -> Result<(), PlaceholderError> {
        if let Some(table) = tables.iter().find(|t| self.has_placeholder(t)) {
            return Err(PlaceholderError::AlreadyPresent(table.clone()));
        }

        let batch: Vec<String> = catalog
            .placeholder_closure(tables)?
            .into_iter()
            .filter(|t| !self.has_placeholder(t))
            .collect();
        for table_id in &batch {
            if catalog.require_table(table_id)?.primary_key_names().is_empty() {
                return Err(PlaceholderError::NoPrimaryKey(table_id.clone()));
            }
        }

        let generated = in_transaction(conn, |conn| {
            conn.execute("SET CONSTRAINTS ALL DEFERRED;")?;
            let mut generator = Generator {
                catalog,
                live: &self.rows,
                values: BTreeMap::new(),
                in_progress: BTreeSet::new(),
            };
            let mut rows = BTreeMap::new();
            for table_id in &batch {
                let row = generator.row(conn, table_id)?;
                insert_row(conn, catalog.require_table(table_id)?, &row)?;
                rows.insert(table_id.clone(), row);
            }
            Ok::<_, PlaceholderError>(rows)
        })?;

        for (table_id, values) in generated {
            let table = catalog.require_table(&table_id)?;
            let identity = Identity {
                values: table
                    .primary_key_names()
                    .into_iter()
                    .filter_map(|c| values.get(c).map(|v| (c.to_string(), v.clone())))
                    .collect(),
            };
            debug!(table = %table_id, identity = ?identity, "Placeholder inserted");
            self.rows.insert(table_id, PlaceholderRow { identity, values });
        }
        info!(tables = batch.len(), "Inserted placeholder rows");
        Ok(())
    }

    /// Delete the placeholder rows of `tables` and forget their identities.
    pub fn delete<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        catalog: &Catalog,
        tables: &BTreeSet<String>,
    ) -> Result<(), PlaceholderError> {
        if let Some(table) = tables.iter().find(|t| !self.has_placeholder(t)) {
            return Err(PlaceholderError::NotPresent(table.clone()));
        }

        in_transaction(conn, |conn| {
            conn.execute("SET CONSTRAINTS ALL DEFERRED;")?;
            for table_id in tables {
                let table = catalog.require_table(table_id)?;
                if let Some(row) = self.rows.get(table_id) {
                    delete_row(conn, table, &row.identity)?;
                }
            }
            Ok::<_, PlaceholderError>(())
        })?;

        for table_id in tables {
            self.rows.remove(table_id);
        }
        info!(tables = tables.len(), "Deleted placeholder rows");
        Ok(())
    }
}

/// Resolves placeholder column values, one column at a time.
///
/// A foreign key column takes the value of the referenced column of the
/// referenced table's placeholder, which may itself need resolving.
struct Generator<'a> {
    catalog: &'a Catalog,
    live: &'a BTreeMap<String, PlaceholderRow>,
    values: BTreeMap<(String, String), Value>,
    in_progress: BTreeSet<(String, String)>,
}

impl Generator<'_> {
    /// Values of every column written for a new placeholder row.
    fn row<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        table_id: &str,
    ) -> Result<BTreeMap<String, Value>, PlaceholderError> {
        let catalog = self.catalog;
        let table = catalog.require_table(table_id)?;
        let mut row = BTreeMap::new();
        for column in &table.columns {
            let written = column.primary_key
                || (column.not_null
                    && (column.default_expression.is_none()
                        || table.outgoing_foreign_key(&column.name).is_some()));
            if written {
                let value = self.resolve(conn, table_id, &column.name)?;
                row.insert(column.name.clone(), value);
            }
        }
        Ok(row)
    }

    fn resolve<C: Connection + ?Sized>(
        &mut self,
        conn: &mut C,
        table_id: &str,
        column_name: &str,
    ) -> Result<Value, PlaceholderError> {
        let key = (table_id.to_string(), column_name.to_string());
        if let Some(value) = self.values.get(&key) {
            return Ok(value.clone());
        }
        if !self.in_progress.insert(key.clone()) {
            return Err(PlaceholderError::ForeignKeyCycle(table_id.to_string()));
        }

        let (catalog, live) = (self.catalog, self.live);
        let table = catalog.require_table(table_id)?;
        let value = match referenced_column(table, column_name) {
            Some((referred_table, referred_column)) => match live.get(referred_table) {
                Some(row) => row.values.get(referred_column).cloned().unwrap_or(Value::Null),
                None => self.resolve(conn, referred_table, referred_column)?,
            },
            None => generate(conn, table, column_name)?,
        };

        self.in_progress.remove(&key);
        self.values.insert(key, value.clone());
        Ok(value)
    }
}

fn referenced_column<'t>(table: &'t Table, column: &str) -> Option<(&'t str, &'t str)> {
    let fk = table.outgoing_foreign_key(column)?;
    let referred = fk.referred_column(column)?;
    Some((fk.referred_table.as_str(), referred))
}

fn generate<C: Connection + ?Sized>(
    conn: &mut C,
    table: &Table,
    column_name: &str,
) -> Result<Value, PlaceholderError> {
    let column = table
        .column(column_name)
        .ok_or_else(|| PlaceholderError::UnknownColumn {
            table: table.name.clone(),
            column: column_name.to_string(),
        })?;

    if column.auto_increment {
        let sequence = column
            .sequence
            .as_ref()
            .ok_or_else(|| PlaceholderError::MissingSequence {
                table: table.name.clone(),
                column: column.name.clone(),
            })?;
        let sql = format!(
            "SELECT NEXTVAL({}) AS val",
            quoted_literal(&quoted(&sequence.name))
        );
        let next = conn
            .query_i64(&sql)?
            .ok_or_else(|| PlaceholderError::MissingSequence {
                table: table.name.clone(),
                column: column.name.clone(),
            })?;
        let out_of_range = || PlaceholderError::SequenceOutOfRange {
            table: table.name.clone(),
            column: column.name.clone(),
            value: next,
        };
        return match column.column_type {
            ColumnType::SmallInt => i16::try_from(next).map(Value::Int16).map_err(|_| out_of_range()),
            ColumnType::Integer => i32::try_from(next).map(Value::Int32).map_err(|_| out_of_range()),
            _ => Ok(Value::Int64(next)),
        };
    }

    let unique = column.primary_key
        || table
            .indexes
            .iter()
            .any(|i| i.unique && i.columns.iter().any(|c| c == column_name));
    Ok(column.column_type.generate_value(unique))
}

fn insert_row<C: Connection + ?Sized>(
    conn: &mut C,
    table: &Table,
    row: &BTreeMap<String, Value>,
) -> Result<(), PlaceholderError> {
    let mut columns = Vec::new();
    let mut placeholders = Vec::new();
    let mut params = Vec::new();
    for column in &table.columns {
        if let Some(value) = row.get(&column.name) {
            params.push(value.clone());
            columns.push(quoted(&column.name));
            placeholders.push(parameter(params.len(), &column.column_type.sql_type()));
        }
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({});",
        quoted(&table.name),
        columns.join(", "),
        placeholders.join(", ")
    );
    conn.execute_with(&sql, &params)?;
    Ok(())
}

fn delete_row<C: Connection + ?Sized>(
    conn: &mut C,
    table: &Table,
    identity: &Identity,
) -> Result<(), PlaceholderError> {
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    for column in table.primary_key_columns() {
        if let Some(value) = identity.get(&column.name) {
            params.push(value.clone());
            conditions.push(format!(
                "{} = {}",
                quoted(&column.name),
                parameter(params.len(), &column.column_type.sql_type())
            ));
        }
    }

    let sql = format!(
        "DELETE FROM {} WHERE {};",
        quoted(&table.name),
        conditions.join(" AND ")
    );
    conn.execute_with(&sql, &params)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, DryRunBackend};
    use crate::catalog::{Column, ForeignKey};

    fn catalog() -> Catalog {
        let b = Table::new("b")
            .with_column(Column::new("id", ColumnType::BigInt).primary_key().auto_increment("b_id_seq"))
            .with_column(Column::new("name", ColumnType::Text).not_null());
        let a = Table::new("a")
            .with_column(Column::new("id", ColumnType::Uuid).primary_key())
            .with_column(Column::new("b_id", ColumnType::BigInt).not_null())
            .with_column(Column::new("note", ColumnType::Text))
            .with_foreign_key(ForeignKey::new("a_b_fk", &["b_id"], "b", &["id"]));
        Catalog::new().with_table(a).with_table(b)
    }

    fn set(tables: &[&str]) -> BTreeSet<String> {
        tables.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_insert_follows_required_foreign_keys() {
        let backend = DryRunBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut records = NullRecords::new();
        records.insert(&mut conn, &catalog(), &set(&["a"])).unwrap();

        assert!(records.has_placeholder("a"));
        assert!(records.has_placeholder("b"));
        assert_eq!(records.identity("b").unwrap().get("id"), Some(&Value::Int64(1)));
        assert_eq!(records.value("a", "b_id"), Some(&Value::Int64(1)));
        assert_eq!(records.value("a", "note"), None);

        let statements = backend.statements();
        assert_eq!(statements[0], "BEGIN");
        assert_eq!(statements[1], "SET CONSTRAINTS ALL DEFERRED;");
        assert_eq!(statements.last().unwrap(), "COMMIT");
        assert_eq!(
            backend.statements_matching("NEXTVAL")[0].sql,
            "SELECT NEXTVAL('\"b_id_seq\"') AS val"
        );
        assert_eq!(
            backend.statements_matching("INSERT INTO \"a\"")[0].sql,
            "INSERT INTO \"a\" (\"id\", \"b_id\") VALUES ($1::uuid, $2::bigint);"
        );
    }

    #[test]
    fn test_double_insert_is_rejected() {
        let backend = DryRunBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut records = NullRecords::new();
        records.insert(&mut conn, &catalog(), &set(&["b"])).unwrap();

        let result = records.insert(&mut conn, &catalog(), &set(&["b"]));
        assert!(matches!(result, Err(PlaceholderError::AlreadyPresent(t)) if t == "b"));
    }

    #[test]
    fn test_live_placeholder_is_reused() {
        let backend = DryRunBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut records = NullRecords::new();
        records.insert(&mut conn, &catalog(), &set(&["b"])).unwrap();
        records.insert(&mut conn, &catalog(), &set(&["a"])).unwrap();

        assert_eq!(backend.statements_matching("INSERT INTO \"b\"").len(), 1);
        assert_eq!(records.value("a", "b_id"), records.value("b", "id"));
    }

    #[test]
    fn test_delete_without_insert_is_rejected() {
        let backend = DryRunBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut records = NullRecords::new();
        let result = records.delete(&mut conn, &catalog(), &set(&["a"]));
        assert!(matches!(result, Err(PlaceholderError::NotPresent(_))));
        assert!(backend.statements().is_empty());
    }

    #[test]
    fn test_delete_by_identity() {
        let backend = DryRunBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut records = NullRecords::new();
        records.insert(&mut conn, &catalog(), &set(&["b"])).unwrap();
        backend.clear();

        records.delete(&mut conn, &catalog(), &set(&["b"])).unwrap();
        assert!(!records.has_placeholder("b"));

        let recorded = backend.recorded();
        assert_eq!(recorded[1].sql, "SET CONSTRAINTS ALL DEFERRED;");
        assert_eq!(recorded[2].sql, "DELETE FROM \"b\" WHERE \"id\" = $1::bigint;");
        assert_eq!(recorded[2].params, vec![Value::Int64(1)]);
    }

    #[test]
    fn test_primary_key_cycle_fails_fast() {
        let x = Table::new("x")
            .with_column(Column::new("y_id", ColumnType::BigInt).primary_key())
            .with_foreign_key(ForeignKey::new("x_y_fk", &["y_id"], "y", &["x_id"]));
        let y = Table::new("y")
            .with_column(Column::new("x_id", ColumnType::BigInt).primary_key())
            .with_foreign_key(ForeignKey::new("y_x_fk", &["x_id"], "x", &["y_id"]));
        let catalog = Catalog::new().with_table(x).with_table(y);

        let backend = DryRunBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut records = NullRecords::new();
        let result = records.insert(&mut conn, &catalog, &set(&["x"]));

        assert!(matches!(result, Err(PlaceholderError::ForeignKeyCycle(_))));
        assert!(records.live_tables().is_empty());
        assert_eq!(backend.statements().last().unwrap(), "ROLLBACK");
    }

    #[test]
    fn test_sequence_without_value_is_an_error() {
        let backend = DryRunBackend::new();
        backend.respond("NEXTVAL(", None);
        let mut conn = backend.connect().unwrap();
        let mut records = NullRecords::new();

        let result = records.insert(&mut conn, &catalog(), &set(&["b"]));
        assert!(matches!(
            result,
            Err(PlaceholderError::MissingSequence { table, column }) if table == "b" && column == "id"
        ));
        assert!(backend.statements_matching("INSERT").is_empty());
        assert_eq!(backend.statements().last().unwrap(), "ROLLBACK");
    }

    #[test]
    fn test_sequence_value_must_fit_column() {
        let counters = Table::new("counters").with_column(
            Column::new("id", ColumnType::SmallInt)
                .primary_key()
                .auto_increment("counters_id_seq"),
        );
        let catalog = Catalog::new().with_table(counters);
        let backend = DryRunBackend::new();
        backend.respond("NEXTVAL(", Some(i64::from(i16::MAX) + 1));
        let mut conn = backend.connect().unwrap();
        let mut records = NullRecords::new();

        let result = records.insert(&mut conn, &catalog, &set(&["counters"]));
        assert!(matches!(
            result,
            Err(PlaceholderError::SequenceOutOfRange { value: 32768, .. })
        ));
        assert!(!records.has_placeholder("counters"));
    }

    #[test]
    fn test_failed_insert_leaves_nothing_live() {
        let backend = DryRunBackend::new();
        backend.fail_on("INSERT INTO \"b\"");
        let mut conn = backend.connect().unwrap();
        let mut records = NullRecords::new();

        let result = records.insert(&mut conn, &catalog(), &set(&["a"]));
        assert!(matches!(result, Err(PlaceholderError::Backend(_))));
        assert!(records.live_tables().is_empty());
    }
}
