//! DDL for ghost tables.
//!
//! Every statement is idempotent, so a resumed run may repeat it.

use super::error::MigrationError;
use crate::backend::Connection;
use crate::catalog::{Catalog, Column, ForeignKey, Index, Table};
use crate::sql::{quoted, quoted_list, quoted_literal};
use tracing::info;

/// Creates ghost tables, their foreign keys, and later their indexes.
pub struct TableCreator<'a> {
    catalog: &'a Catalog,
}

impl<'a> TableCreator<'a> {
    /// Create a table creator over a catalog.
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Create the tables, then add their foreign keys.
    ///
    /// Foreign keys are added once every table exists, so tables may
    /// reference each other in any order.
    pub fn create_tables<'t, C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        table_ids: impl IntoIterator<Item = &'t String> + Clone,
    ) -> Result<(), MigrationError> {
        for table_id in table_ids.clone() {
            let table = self.catalog.require_table(table_id)?;
            conn.execute(&create_table_sql(table))?;
            info!(table = %table_id, "Created ghost table");
        }
        for table_id in table_ids {
            let table = self.catalog.require_table(table_id)?;
            for fk in &table.foreign_keys {
                conn.execute(&add_foreign_key_sql(table, fk))?;
            }
        }
        Ok(())
    }

    /// Create the secondary indexes of the tables.
    pub fn create_indexes<'t, C: Connection + ?Sized>(
        &self,
        conn: &mut C,
        table_ids: impl IntoIterator<Item = &'t String>,
    ) -> Result<usize, MigrationError> {
        let mut created = 0;
        for table_id in table_ids {
            let table = self.catalog.require_table(table_id)?;
            for index in &table.indexes {
                conn.execute(&create_index_sql(table, index))?;
                created += 1;
            }
        }
        Ok(created)
    }
}

fn column_sql(column: &Column) -> String {
    let mut sql = format!("{} {}", quoted(&column.name), column.column_type.sql_type());
    if column.not_null {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default_expression {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    sql
}

/// `CREATE TABLE` with columns and primary key, without foreign keys or
/// indexes.
pub fn create_table_sql(table: &Table) -> String {
    let mut parts: Vec<String> = table.columns.iter().map(column_sql).collect();
    let keys = table.primary_key_names();
    if !keys.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", quoted_list(keys)));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({});",
        quoted(&table.name),
        parts.join(", ")
    )
}

/// `ALTER TABLE ... ADD CONSTRAINT ... FOREIGN KEY`, deferrable so that
/// placeholder transactions can defer it. Skipped when the table already
/// has a constraint of that name.
pub fn add_foreign_key_sql(table: &Table, fk: &ForeignKey) -> String {
    format!(
        "DO $$ BEGIN IF NOT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = {} AND conrelid = {}::regclass) THEN \
         ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON UPDATE {} ON DELETE {} DEFERRABLE INITIALLY IMMEDIATE; \
         END IF; END $$;",
        quoted_literal(&fk.name),
        quoted_literal(&quoted(&table.name)),
        quoted(&table.name),
        quoted(&fk.name),
        quoted_list(fk.referencing_columns.iter().map(String::as_str)),
        quoted(&fk.referred_table),
        quoted_list(fk.referred_columns.iter().map(String::as_str)),
        fk.on_update.as_sql(),
        fk.on_delete.as_sql()
    )
}

/// `CREATE [UNIQUE] INDEX IF NOT EXISTS`.
pub fn create_index_sql(table: &Table, index: &Index) -> String {
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});",
        if index.unique { "UNIQUE " } else { "" },
        quoted(&index.name),
        quoted(&table.name),
        quoted_list(index.columns.iter().map(String::as_str))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, DryRunBackend};
    use crate::catalog::{ColumnType, ReferentialAction};

    fn orders() -> Table {
        Table::new("orders_v2")
            .with_column(Column::new("id", ColumnType::BigInt).primary_key().auto_increment("orders_id_seq"))
            .with_column(Column::new("customer_id", ColumnType::BigInt).not_null())
            .with_column(Column::new("status", ColumnType::Varchar(16)).with_default("'new'"))
            .with_foreign_key(
                ForeignKey::new("orders_customer_fk", &["customer_id"], "customers", &["id"])
                    .on_delete(ReferentialAction::Cascade),
            )
            .with_index("orders_status_idx", &["status"], false)
    }

    #[test]
    fn test_create_table_sql() {
        assert_eq!(
            create_table_sql(&orders()),
            "CREATE TABLE IF NOT EXISTS \"orders_v2\" (\"id\" bigint NOT NULL DEFAULT nextval('orders_id_seq'::regclass), \
             \"customer_id\" bigint NOT NULL, \"status\" varchar(16) DEFAULT 'new', PRIMARY KEY (\"id\"));"
        );
    }

    #[test]
    fn test_foreign_key_is_deferrable() {
        let table = orders();
        assert_eq!(
            add_foreign_key_sql(&table, &table.foreign_keys[0]),
            "DO $$ BEGIN IF NOT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = 'orders_customer_fk' \
             AND conrelid = '\"orders_v2\"'::regclass) THEN \
             ALTER TABLE \"orders_v2\" ADD CONSTRAINT \"orders_customer_fk\" FOREIGN KEY (\"customer_id\") \
             REFERENCES \"customers\" (\"id\") ON UPDATE NO ACTION ON DELETE CASCADE DEFERRABLE INITIALLY IMMEDIATE; \
             END IF; END $$;"
        );
    }

    #[test]
    fn test_tables_before_foreign_keys_before_indexes() {
        let customers = Table::new("customers")
            .with_column(Column::new("id", ColumnType::BigInt).primary_key());
        let catalog = Catalog::new().with_table(orders()).with_table(customers);
        let backend = DryRunBackend::new();
        let mut conn = backend.connect().unwrap();
        let creator = TableCreator::new(&catalog);

        let ids = vec!["customers".to_string(), "orders_v2".to_string()];
        creator.create_tables(&mut conn, &ids).unwrap();
        assert_eq!(creator.create_indexes(&mut conn, &ids).unwrap(), 1);

        let statements = backend.statements();
        assert_eq!(statements.len(), 4);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS \"customers\""));
        assert!(statements[1].starts_with("CREATE TABLE IF NOT EXISTS \"orders_v2\""));
        assert!(statements[2].contains("ALTER TABLE \"orders_v2\" ADD CONSTRAINT"));
        assert_eq!(
            statements[3],
            "CREATE INDEX IF NOT EXISTS \"orders_status_idx\" ON \"orders_v2\" (\"status\");"
        );
    }
}
