//! Row-level sync triggers between a table and its counterpart.
//!
//! Each ordered pair `(source, target)` gets one PL/pgSQL function and one
//! trigger on the source table. The function upserts the target row on
//! INSERT, updates it by the old key on UPDATE (falling back to the
//! upsert), and deletes it on DELETE. While a sync function writes, it sets
//! the transaction-local `shadowshift.sync` setting; sync functions entered
//! with that setting do nothing, so forward and backward sync never loop.
//! Writes from application triggers or cascades are still propagated.

use super::mapping::RowProjection;
use super::null_records::NullRecords;
use crate::catalog::{Catalog, CatalogError};
use crate::sql::{quoted, quoted_list, quoted_literal};
use std::collections::BTreeSet;

/// Session setting marking writes made by a sync function.
pub const SYNC_SETTING: &str = "shadowshift.sync";

/// Sync function for one source/target pair and its migrated columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFunction {
    source: String,
    target: String,
    columns: BTreeSet<String>,
    function_name: String,
    trigger_name: String,
}

impl SyncFunction {
    /// Create a sync function migrating no columns yet.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        let digest = blake3::hash(format!("{source}:{target}").as_bytes());
        let suffix = hex::encode(&digest.as_bytes()[..8]);
        Self {
            function_name: format!("sync_fn_{suffix}"),
            trigger_name: format!("sync_tr_{suffix}"),
            source,
            target,
            columns: BTreeSet::new(),
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

    /// Migrated columns.
    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    /// Function name.
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Trigger name.
    pub fn trigger_name(&self) -> &str {
        &self.trigger_name
    }

    /// Grow the migrated column set. Returns whether it changed.
    pub fn add_columns(&mut self, columns: impl IntoIterator<Item = String>) -> bool {
        let before = self.columns.len();
        self.columns.extend(columns);
        self.columns.len() != before
    }

    /// `CREATE OR REPLACE FUNCTION` for the current column set.
    pub fn create_function_sql(
        &self,
        catalog: &Catalog,
        placeholders: &NullRecords,
    ) -> Result<String, CatalogError> {
        let projection = RowProjection::new(catalog, &self.target, placeholders)?;
        let target = quoted(&self.target);
        let keys = projection.target().primary_key_names();

        let inserted = projection.insert_columns(&self.columns, "NEW");
        let (insert_names, insert_values): (Vec<String>, Vec<String>) = inserted.into_iter().unzip();
        let updated = projection.update_columns(&self.columns, "NEW");

        let conflict = if updated.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let assignments: Vec<String> = updated
                .iter()
                .map(|(c, _)| format!("{} = EXCLUDED.{}", quoted(c), quoted(c)))
                .collect();
            format!("DO UPDATE SET {}", assignments.join(", "))
        };
        let upsert = format!(
            "INSERT INTO {target} ({}) VALUES ({}) ON CONFLICT ({}) {conflict};",
            insert_names.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", "),
            insert_values.join(", "),
            quoted_list(keys.iter().copied()),
        );

        let assignments: Vec<String> = keys
            .iter()
            .map(|k| (k.to_string(), projection.expression(k, "NEW")))
            .chain(updated)
            .map(|(c, e)| format!("{} = {e}", quoted(&c)))
            .collect();
        let update = format!(
            "UPDATE {target} SET {} WHERE {};",
            assignments.join(", "),
            projection.key_match(None, "OLD")
        );
        let delete = format!(
            "DELETE FROM {target} WHERE {};",
            projection.key_match(None, "OLD")
        );

        Ok(format!(
            "CREATE OR REPLACE FUNCTION {name}() RETURNS TRIGGER AS $$
BEGIN
  IF COALESCE(current_setting({setting}, true), '') <> '' THEN
    RETURN NULL;
  END IF;
  PERFORM set_config({setting}, {marker}, true);
  IF TG_OP = 'INSERT' THEN
    {upsert}
  ELSIF TG_OP = 'UPDATE' THEN
    {update}
    IF NOT FOUND THEN
      {upsert}
    END IF;
  ELSIF TG_OP = 'DELETE' THEN
    {delete}
  END IF;
  PERFORM set_config({setting}, '', true);
  RETURN NULL;
END;
$$ LANGUAGE plpgsql;",
            name = quoted(&self.function_name),
            setting = quoted_literal(SYNC_SETTING),
            marker = quoted_literal(&self.function_name),
        ))
    }

    /// `CREATE TRIGGER` binding the function to the source table.
    pub fn create_trigger_sql(&self) -> String {
        format!(
            "CREATE TRIGGER {} AFTER INSERT OR UPDATE OR DELETE ON {} FOR EACH ROW EXECUTE PROCEDURE {}();",
            quoted(&self.trigger_name),
            quoted(&self.source),
            quoted(&self.function_name)
        )
    }
}

/// `DROP TRIGGER` statement.
pub fn drop_trigger_sql(trigger: &str, table: &str) -> String {
    format!("DROP TRIGGER {} ON {};", quoted(trigger), quoted(table))
}

/// `DROP FUNCTION` statement.
pub fn drop_function_sql(function: &str) -> String {
    format!("DROP FUNCTION {}();", quoted(function))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType, Table};

    fn catalog() -> Catalog {
        let users = Table::new("users")
            .with_column(Column::new("id", ColumnType::BigInt).primary_key())
            .with_column(Column::new("email", ColumnType::Text).not_null())
            .with_column(Column::new("name", ColumnType::Text));
        Catalog::new()
            .with_table(users.clone())
            .with_table(users.forked("users_v2"))
    }

    #[test]
    fn test_names_are_deterministic_per_direction() {
        let forward = SyncFunction::new("users", "users_v2");
        let again = SyncFunction::new("users", "users_v2");
        let backward = SyncFunction::new("users_v2", "users");

        assert_eq!(forward.function_name(), again.function_name());
        assert_ne!(forward.function_name(), backward.function_name());
        assert!(forward.function_name().starts_with("sync_fn_"));
        assert_eq!(forward.function_name().len(), "sync_fn_".len() + 16);
        assert_eq!(&forward.trigger_name()[8..], &forward.function_name()[8..]);
    }

    #[test]
    fn test_function_body_for_column_set() {
        let mut function = SyncFunction::new("users", "users_v2");
        assert!(function.add_columns(["email".to_string()]));
        assert!(!function.add_columns(["email".to_string()]));

        let sql = function.create_function_sql(&catalog(), &NullRecords::new()).unwrap();
        assert!(sql.starts_with(&format!("CREATE OR REPLACE FUNCTION \"{}\"()", function.function_name())));
        assert!(!sql.contains("pg_trigger_depth"));
        assert!(sql.contains("IF COALESCE(current_setting('shadowshift.sync', true), '') <> '' THEN"));
        assert!(sql.contains(
            "INSERT INTO \"users_v2\" (\"id\", \"email\") VALUES (NEW.\"id\", NEW.\"email\") ON CONFLICT (\"id\") DO UPDATE SET \"email\" = EXCLUDED.\"email\";"
        ));
        assert!(sql.contains(
            "UPDATE \"users_v2\" SET \"id\" = NEW.\"id\", \"email\" = NEW.\"email\" WHERE \"id\" = OLD.\"id\";"
        ));
        assert!(sql.contains("DELETE FROM \"users_v2\" WHERE \"id\" = OLD.\"id\";"));
        assert!(!sql.contains("\"name\""));
    }

    #[test]
    fn test_only_sync_writes_are_suppressed() {
        let function = SyncFunction::new("users", "users_v2");
        let sql = function.create_function_sql(&catalog(), &NullRecords::new()).unwrap();

        let marked = format!("PERFORM set_config('shadowshift.sync', '{}', true);", function.function_name());
        let cleared = "PERFORM set_config('shadowshift.sync', '', true);";
        let guard = sql.find("current_setting('shadowshift.sync', true)").unwrap();
        let mark = sql.find(&marked).unwrap();
        let write = sql.find("IF TG_OP = 'INSERT'").unwrap();
        let clear = sql.find(cleared).unwrap();
        let delete = sql.find("DELETE FROM").unwrap();

        assert!(guard < mark);
        assert!(mark < write);
        assert!(delete < clear);
        assert!(sql[clear..].starts_with(&format!("{cleared}\n  RETURN NULL;")));
    }

    #[test]
    fn test_key_only_upsert_does_nothing_on_conflict() {
        let function = SyncFunction::new("users", "users_v2");
        let sql = function.create_function_sql(&catalog(), &NullRecords::new()).unwrap();
        assert!(sql.contains("ON CONFLICT (\"id\") DO NOTHING;"));
    }

    #[test]
    fn test_trigger_and_drop_statements() {
        let function = SyncFunction::new("users", "users_v2");
        assert_eq!(
            function.create_trigger_sql(),
            format!(
                "CREATE TRIGGER \"{}\" AFTER INSERT OR UPDATE OR DELETE ON \"users\" FOR EACH ROW EXECUTE PROCEDURE \"{}\"();",
                function.trigger_name(),
                function.function_name()
            )
        );
        assert_eq!(drop_trigger_sql("sync_tr_1", "users"), "DROP TRIGGER \"sync_tr_1\" ON \"users\";");
        assert_eq!(drop_function_sql("sync_fn_1"), "DROP FUNCTION \"sync_fn_1\"();");
    }
}
