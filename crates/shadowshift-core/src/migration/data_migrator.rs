//! Bulk copy of existing rows into ghost tables.

use super::error::MigrationError;
use super::executor::CancelHandle;
use super::mapping::{DataMapping, RowProjection};
use super::null_records::NullRecords;
use crate::backend::Connection;
use crate::catalog::{Catalog, Value};
use crate::sql::{parameter, qualified, quoted, quoted_list};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for bulk copies.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Primary-key range covered by one batch.
    pub batch_size: u64,
    /// Delay between batches in milliseconds (for yielding to writes).
    pub batch_delay_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_delay_ms: 10,
        }
    }
}

/// Outcome of one table copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyProgress {
    /// Ghost table copied into.
    pub table: String,
    /// Columns copied.
    pub columns: BTreeSet<String>,
    /// Rows reported as written.
    pub rows: u64,
    /// Statements issued.
    pub batches: u64,
}

/// Copies rows from a source table into its ghost table.
///
/// The first copy for a table inserts rows (upserting, so a copy can be
/// repeated); later copies update the rows already present.
pub struct TableDataMigrator<'a> {
    catalog: &'a Catalog,
    placeholders: &'a NullRecords,
    config: &'a BackfillConfig,
    cancel: &'a CancelHandle,
}

impl<'a> TableDataMigrator<'a> {
    /// Create a migrator.
    pub fn new(
        catalog: &'a Catalog,
        placeholders: &'a NullRecords,
        config: &'a BackfillConfig,
        cancel: &'a CancelHandle,
    ) -> Self {
        Self {
            catalog,
            placeholders,
            config,
            cancel,
        }
    }

    /// Copy `columns` of every source row.
    ///
    /// `first_pass` selects insert over update. `step_index` is reported
    /// if the copy is cancelled between batches.
    pub fn copy<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        mapping: &DataMapping,
        columns: &BTreeSet<String>,
        first_pass: bool,
        step_index: usize,
    ) -> Result<CopyProgress, MigrationError> {
        let projection = RowProjection::new(self.catalog, mapping.target(), self.placeholders)?;
        if projection.target().primary_key_names().is_empty() {
            return Err(MigrationError::MissingKey(mapping.target().to_string()));
        }

        let statement = if first_pass {
            Some(CopyStatement::insert(&projection, mapping, columns))
        } else {
            CopyStatement::update(&projection, mapping, columns)
        };
        let mut progress = CopyProgress {
            table: mapping.target().to_string(),
            columns: columns.clone(),
            rows: 0,
            batches: 0,
        };
        let Some(statement) = statement else {
            return Ok(progress);
        };

        match self.range_key(mapping)? {
            Some(key) => {
                let Some((min, max)) = self.bounds(conn, mapping.source(), &key)? else {
                    debug!(table = %mapping.source(), "Source table is empty");
                    return Ok(progress);
                };
                let range = format!(
                    "{} BETWEEN {} AND {}",
                    qualified("s", &key),
                    parameter(1, "bigint"),
                    parameter(2, "bigint")
                );
                let sql = statement.render(Some(&range));
                let size = i64::try_from(self.config.batch_size.max(1)).unwrap_or(i64::MAX);
                let mut low = min;
                loop {
                    if progress.batches > 0 {
                        if self.cancel.is_cancelled() {
                            return Err(MigrationError::Cancelled { step_index });
                        }
                        if self.config.batch_delay_ms > 0 {
                            std::thread::sleep(Duration::from_millis(self.config.batch_delay_ms));
                        }
                    }
                    let high = low.saturating_add(size - 1).min(max);
                    progress.rows += conn.execute_with(&sql, &[Value::Int64(low), Value::Int64(high)])?;
                    progress.batches += 1;
                    if high >= max {
                        break;
                    }
                    low = high + 1;
                }
            }
            None => {
                progress.rows = conn.execute(&statement.render(None))?;
                progress.batches = 1;
            }
        }

        info!(
            table = %progress.table,
            rows = progress.rows,
            batches = progress.batches,
            first_pass,
            "Copied rows"
        );
        Ok(progress)
    }

    /// The single integer key column to batch on, if the table allows it.
    ///
    /// Self-referencing tables are copied in one statement so that rows
    /// referencing later rows satisfy their foreign key.
    fn range_key(&self, mapping: &DataMapping) -> Result<Option<String>, MigrationError> {
        let source = self.catalog.require_table(mapping.source())?;
        let target = self.catalog.require_table(mapping.target())?;
        if source.is_self_referencing() || target.is_self_referencing() {
            return Ok(None);
        }
        let keys: Vec<_> = target.primary_key_columns().collect();
        match keys.as_slice() {
            [key] if key.column_type.is_integer() => Ok(Some(key.name.clone())),
            _ => Ok(None),
        }
    }

    fn bounds<C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        source: &str,
        key: &str,
    ) -> Result<Option<(i64, i64)>, MigrationError> {
        let min = conn.query_i64(&format!(
            "SELECT MIN({})::bigint AS val FROM {};",
            quoted(key),
            quoted(source)
        ))?;
        let max = conn.query_i64(&format!(
            "SELECT MAX({})::bigint AS val FROM {};",
            quoted(key),
            quoted(source)
        ))?;
        Ok(min.zip(max).filter(|(min, max)| min <= max))
    }
}

enum CopyStatement {
    /// `INSERT ... SELECT ... ON CONFLICT`, split around the source rows.
    Insert {
        head: String,
        source: String,
        conflict: String,
    },
    /// `UPDATE ... FROM <source rows> WHERE <key match>`.
    Update {
        head: String,
        source: String,
        key_match: String,
    },
}

impl CopyStatement {
    fn insert(
        projection: &RowProjection<'_>,
        mapping: &DataMapping,
        columns: &BTreeSet<String>,
    ) -> Self {
        let (names, values): (Vec<String>, Vec<String>) =
            projection.insert_columns(columns, "s").into_iter().unzip();
        let updated = projection.update_columns(columns, "s");
        let action = if updated.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let assignments: Vec<String> = updated
                .iter()
                .map(|(c, _)| format!("{} = EXCLUDED.{}", quoted(c), quoted(c)))
                .collect();
            format!("DO UPDATE SET {}", assignments.join(", "))
        };

        CopyStatement::Insert {
            head: format!(
                "INSERT INTO {} ({}) SELECT {}",
                quoted(mapping.target()),
                quoted_list(names.iter().map(String::as_str)),
                values.join(", "),
            ),
            source: quoted(mapping.source()),
            conflict: format!(
                "ON CONFLICT ({}) {action}",
                quoted_list(projection.target().primary_key_names())
            ),
        }
    }

    fn update(
        projection: &RowProjection<'_>,
        mapping: &DataMapping,
        columns: &BTreeSet<String>,
    ) -> Option<Self> {
        let updated = projection.update_columns(columns, "s");
        if updated.is_empty() {
            return None;
        }
        let assignments: Vec<String> = updated
            .into_iter()
            .map(|(c, e)| format!("{} = {e}", quoted(&c)))
            .collect();
        Some(CopyStatement::Update {
            head: format!(
                "UPDATE {} t SET {}",
                quoted(mapping.target()),
                assignments.join(", ")
            ),
            source: quoted(mapping.source()),
            key_match: projection.key_match(Some("t"), "s"),
        })
    }

    /// The statement, restricted to `range` when given.
    ///
    /// Source rows are read `FOR SHARE`, so a row written concurrently is
    /// copied with its committed value, never an older one.
    /// An `INSERT ... SELECT` always carries a WHERE clause so that
    /// `ON CONFLICT` cannot be parsed as part of the FROM clause.
    fn render(&self, range: Option<&str>) -> String {
        match self {
            CopyStatement::Insert {
                head,
                source,
                conflict,
            } => format!("{head} FROM {} WHERE TRUE {conflict};", locked_rows(source, range)),
            CopyStatement::Update {
                head,
                source,
                key_match,
            } => format!("{head} FROM {} WHERE {key_match};", locked_rows(source, range)),
        }
    }
}

/// Source rows in `range`, locked against concurrent writes, aliased `s`.
fn locked_rows(source: &str, range: Option<&str>) -> String {
    match range {
        Some(range) => format!("(SELECT * FROM {source} s WHERE {range} FOR SHARE) s"),
        None => format!("(SELECT * FROM {source} s FOR SHARE) s"),
    }
}
