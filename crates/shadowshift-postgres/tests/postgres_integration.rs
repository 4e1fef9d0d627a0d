//! Tests against a live PostgreSQL database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

use shadowshift_core::backend::{Backend, Connection};
use shadowshift_core::catalog::{Catalog, Column, ColumnType, ForeignKey, Table};
use shadowshift_core::migration::{
    MigrationConfig, MigrationPhase, Migrator, NullRecords, Operation, Plan,
};
use shadowshift_core::versioning::{RefLog, State, VersionId};
use shadowshift_postgres::{PgBackend, PgConfig};
use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shadowshift_core=debug,shadowshift_postgres=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn backend(state_dir: &tempfile::TempDir) -> PgBackend {
    init_tracing();
    let config = PgConfig::from_env()
        .expect("DATABASE_URL must be set")
        .with_max_connections(2)
        .with_state_path(state_dir.path());
    PgBackend::open(&config).expect("failed to connect")
}

/// A short suffix keeping concurrent test runs apart.
fn suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn count(conn: &mut impl Connection, table: &str) -> i64 {
    conn.query_i64(&format!("SELECT COUNT(*)::bigint AS val FROM \"{table}\";"))
        .unwrap()
        .unwrap()
}

/// Rows present in one table but not the other, over `columns`.
fn differing(conn: &mut impl Connection, left: &str, right: &str, columns: &str) -> i64 {
    conn.query_i64(&format!(
        "SELECT COUNT(*)::bigint AS val FROM ( \
         (SELECT {columns} FROM \"{left}\" EXCEPT SELECT {columns} FROM \"{right}\") \
         UNION ALL \
         (SELECT {columns} FROM \"{right}\" EXCEPT SELECT {columns} FROM \"{left}\")) d;"
    ))
    .unwrap()
    .unwrap()
}

/// `v1` holding `items` (id, a, b) and `v2` with its ghost `items_v2`.
fn items_state(items: &str, items_v2: &str) -> State {
    let catalog = Catalog::new().with_table(
        Table::new(items)
            .with_column(Column::new("id", ColumnType::BigInt).primary_key())
            .with_column(Column::new("a", ColumnType::Text))
            .with_column(Column::new("b", ColumnType::Text)),
    );
    let v1 = VersionId::new("v1");
    let mut ref_log = RefLog::new();
    ref_log.add_root_version(v1.clone()).unwrap();
    ref_log.add_table(&v1, "items", items).unwrap();
    ref_log.fork_version(&v1, VersionId::new("v2")).unwrap();
    let mut state = State::new(catalog, ref_log);
    state
        .fork_table_as(&VersionId::new("v2"), "items", items_v2)
        .unwrap();
    state
}

fn create_items(conn: &mut impl Connection, items: &str, rows: i64) {
    conn.execute(&format!(
        "CREATE TABLE \"{items}\" (\"id\" BIGINT PRIMARY KEY, \"a\" TEXT, \"b\" TEXT);"
    ))
    .unwrap();
    conn.execute(&format!(
        "INSERT INTO \"{items}\" SELECT g, 'old', 'old' FROM generate_series(1, {rows}) g;"
    ))
    .unwrap();
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn test_migrate_and_drop_version() {
    let state_dir = tempfile::tempdir().unwrap();
    let backend = backend(&state_dir);
    let s = suffix();
    let customers = format!("customers_{s}");
    let orders = format!("orders_{s}");
    let customers_v2 = format!("customers_{s}_v2");

    let mut conn = backend.connect().unwrap();
    conn.execute(&format!(
        "CREATE TABLE \"{customers}\" (\"id\" BIGINT PRIMARY KEY, \"email\" TEXT NOT NULL);"
    ))
    .unwrap();
    conn.execute(&format!(
        "CREATE TABLE \"{orders}\" (\"id\" BIGINT PRIMARY KEY, \"customer_id\" BIGINT NOT NULL \
         REFERENCES \"{customers}\" (\"id\") DEFERRABLE INITIALLY IMMEDIATE);"
    ))
    .unwrap();
    conn.execute(&format!(
        "INSERT INTO \"{customers}\" SELECT g, 'c' || g || '@example.com' FROM generate_series(1, 250) g;"
    ))
    .unwrap();
    conn.execute(&format!(
        "INSERT INTO \"{orders}\" SELECT g, 1 + g % 250 FROM generate_series(1, 500) g;"
    ))
    .unwrap();

    let catalog = Catalog::new()
        .with_table(
            Table::new(customers.as_str())
                .with_column(Column::new("id", ColumnType::BigInt).primary_key())
                .with_column(Column::new("email", ColumnType::Text).not_null())
                .with_index(format!("{customers}_email_idx"), &["email"], false),
        )
        .with_table(
            Table::new(orders.as_str())
                .with_column(Column::new("id", ColumnType::BigInt).primary_key())
                .with_column(Column::new("customer_id", ColumnType::BigInt).not_null())
                .with_foreign_key(ForeignKey::new(
                    format!("{orders}_customer_fk"),
                    &["customer_id"],
                    customers.as_str(),
                    &["id"],
                )),
        );
    let v1 = VersionId::new("v1");
    let v2 = VersionId::new("v2");
    let mut ref_log = RefLog::new();
    ref_log.add_root_version(v1.clone()).unwrap();
    ref_log.add_table(&v1, "customers", customers.as_str()).unwrap();
    ref_log.add_table(&v1, "orders", orders.as_str()).unwrap();
    ref_log.fork_version(&v1, v2.clone()).unwrap();
    let mut state = State::new(catalog, ref_log);
    state.fork_table_as(&v2, "customers", &customers_v2).unwrap();
    let orders_v2 = state.ref_log.table_ref(&v2, "orders").unwrap().table_id.clone();

    let config = MigrationConfig::new().with_batch_size(100).with_batch_delay_ms(0);
    let migrator = Migrator::new(backend, config);
    let report = migrator.migrate(&mut state, &v1, &v2).unwrap();
    assert_eq!(report.phase, MigrationPhase::Persisted);

    let mut conn = migrator.backend().connect().unwrap();
    assert_eq!(count(&mut conn, &customers_v2), 250);
    assert_eq!(count(&mut conn, &orders_v2), 500);

    // Writes reach the other version in both directions.
    conn.execute(&format!("INSERT INTO \"{customers}\" VALUES (1000, 'old@example.com');"))
        .unwrap();
    assert_eq!(count(&mut conn, &customers_v2), 251);
    conn.execute(&format!("INSERT INTO \"{customers_v2}\" VALUES (1001, 'new@example.com');"))
        .unwrap();
    assert_eq!(count(&mut conn, &customers), 252);
    conn.execute(&format!("DELETE FROM \"{customers}\" WHERE \"id\" = 1000;"))
        .unwrap();
    assert_eq!(count(&mut conn, &customers_v2), 251);

    assert_eq!(migrator.backend().load_state().unwrap(), Some(state.clone()));

    let dropped = migrator.drop_version(&mut state, &v2).unwrap();
    let expected: Vec<String> = BTreeSet::from([customers_v2.clone(), orders_v2.clone()])
        .into_iter()
        .collect();
    assert_eq!(dropped, expected);
    let remaining = conn
        .query_i64(&format!(
            "SELECT COUNT(*)::bigint AS val FROM pg_tables WHERE tablename IN ('{customers_v2}', '{orders_v2}');"
        ))
        .unwrap();
    assert_eq!(remaining, Some(0));

    // Old tables no longer carry sync triggers.
    conn.execute(&format!("INSERT INTO \"{customers}\" VALUES (2000, 'late@example.com');"))
        .unwrap();
    assert_eq!(count(&mut conn, &customers), 252);

    conn.execute(&format!("DROP TABLE \"{orders}\", \"{customers}\" CASCADE;"))
        .unwrap();
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn test_placeholders_with_deferred_constraints() {
    let state_dir = tempfile::tempdir().unwrap();
    let backend = backend(&state_dir);
    let s = suffix();
    let parents = format!("parents_{s}");
    let children = format!("children_{s}");

    let mut conn = backend.connect().unwrap();
    conn.execute(&format!("CREATE TABLE \"{parents}\" (\"id\" BIGSERIAL PRIMARY KEY);"))
        .unwrap();
    conn.execute(&format!(
        "CREATE TABLE \"{children}\" (\"id\" UUID PRIMARY KEY, \"parent_id\" BIGINT NOT NULL \
         REFERENCES \"{parents}\" (\"id\") DEFERRABLE INITIALLY IMMEDIATE, \"label\" TEXT);"
    ))
    .unwrap();

    let catalog = Catalog::new()
        .with_table(
            Table::new(parents.as_str()).with_column(
                Column::new("id", ColumnType::BigInt)
                    .primary_key()
                    .auto_increment(format!("{parents}_id_seq")),
            ),
        )
        .with_table(
            Table::new(children.as_str())
                .with_column(Column::new("id", ColumnType::Uuid).primary_key())
                .with_column(Column::new("parent_id", ColumnType::BigInt).not_null())
                .with_column(Column::new("label", ColumnType::Text))
                .with_foreign_key(ForeignKey::new(
                    format!("{children}_parent_fk"),
                    &["parent_id"],
                    parents.as_str(),
                    &["id"],
                )),
        );

    let mut records = NullRecords::new();
    let tables = BTreeSet::from([children.clone(), parents.clone()]);
    records.insert(&mut conn, &catalog, &tables).unwrap();
    assert_eq!(count(&mut conn, &parents), 1);
    assert_eq!(count(&mut conn, &children), 1);
    assert_eq!(
        records.value(&children, "parent_id"),
        records.value(&parents, "id")
    );

    records.delete(&mut conn, &catalog, &tables).unwrap();
    assert_eq!(count(&mut conn, &parents), 0);
    assert_eq!(count(&mut conn, &children), 0);

    conn.execute(&format!("DROP TABLE \"{children}\", \"{parents}\" CASCADE;"))
        .unwrap();
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn test_dropped_connection_rolls_back() {
    let state_dir = tempfile::tempdir().unwrap();
    let backend = backend(&state_dir);
    let table = format!("scratch_{}", suffix());

    let mut conn = backend.connect().unwrap();
    conn.execute(&format!("CREATE TABLE \"{table}\" (\"id\" BIGINT PRIMARY KEY);"))
        .unwrap();

    {
        let mut abandoned = backend.connect().unwrap();
        abandoned.begin().unwrap();
        abandoned
            .execute(&format!("INSERT INTO \"{table}\" VALUES (1);"))
            .unwrap();
    }
    assert_eq!(count(&mut conn, &table), 0);

    conn.execute(&format!("DROP TABLE \"{table}\";")).unwrap();
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn test_writes_during_copy_survive_in_ghost() {
    let state_dir = tempfile::tempdir().unwrap();
    let backend = backend(&state_dir);
    let s = suffix();
    let items = format!("items_{s}");
    let items_v2 = format!("items_{s}_v2");

    {
        let mut conn = backend.connect().unwrap();
        create_items(&mut conn, &items, 1000);
    }
    let mut state = items_state(&items, &items_v2);
    let mut plan = Plan::new(VersionId::new("v1"), VersionId::new("v2"))
        .with_ghost_table(items_v2.as_str())
        .with_step(Operation::copy(items_v2.as_str(), ["id", "a"]))
        .with_step(Operation::copy(items_v2.as_str(), ["b"]));

    let config = MigrationConfig::new().with_batch_size(50).with_batch_delay_ms(20);
    let migrator = Migrator::new(backend, config);
    let report = thread::scope(|scope| {
        let writer = scope.spawn(|| {
            let mut conn = migrator.backend().connect().unwrap();
            let deadline = Instant::now() + Duration::from_secs(30);
            let trigger_installed = format!(
                "SELECT COUNT(*)::bigint AS val FROM pg_trigger \
                 WHERE tgrelid = '\"{items}\"'::regclass AND NOT tgisinternal;"
            );
            while conn.query_i64(&trigger_installed).unwrap() == Some(0) {
                assert!(Instant::now() < deadline, "sync trigger never installed");
                thread::sleep(Duration::from_millis(5));
            }
            // Each update holds its row lock while the copy runs past it.
            for id in (100..=1000).step_by(100) {
                conn.begin().unwrap();
                conn.execute(&format!(
                    "UPDATE \"{items}\" SET \"a\" = 'new-{id}', \"b\" = 'new-{id}' WHERE \"id\" = {id};"
                ))
                .unwrap();
                thread::sleep(Duration::from_millis(40));
                conn.commit().unwrap();
            }
        });
        let report = migrator.execute(&mut state, &mut plan);
        writer.join().unwrap();
        report
    })
    .unwrap();
    assert_eq!(report.phase, MigrationPhase::Persisted);

    let mut conn = migrator.backend().connect().unwrap();
    assert_eq!(count(&mut conn, &items_v2), 1000);
    assert_eq!(differing(&mut conn, &items, &items_v2, "\"id\", \"a\", \"b\""), 0);
    let updated = conn
        .query_i64(&format!(
            "SELECT COUNT(*)::bigint AS val FROM \"{items_v2}\" WHERE \"a\" LIKE 'new-%' AND \"b\" = \"a\";"
        ))
        .unwrap();
    assert_eq!(updated, Some(10));

    conn.execute(&format!("DROP TABLE \"{items_v2}\", \"{items}\" CASCADE;"))
        .unwrap();
}

#[test]
#[ignore = "requires DATABASE_URL"]
fn test_writes_from_application_triggers_are_synced() {
    let state_dir = tempfile::tempdir().unwrap();
    let backend = backend(&state_dir);
    let s = suffix();
    let items = format!("items_{s}");
    let items_v2 = format!("items_{s}_v2");
    let audit = format!("audit_{s}");

    {
        let mut conn = backend.connect().unwrap();
        create_items(&mut conn, &items, 1);
        conn.execute(&format!("CREATE TABLE \"{audit}\" (\"id\" BIGINT PRIMARY KEY);"))
            .unwrap();
        conn.execute(&format!(
            "CREATE FUNCTION \"{audit}_fn\"() RETURNS TRIGGER AS $$ BEGIN \
             INSERT INTO \"{items}\" VALUES (NEW.\"id\", 'via-app-trigger', 'via-app-trigger'); \
             RETURN NULL; END; $$ LANGUAGE plpgsql;"
        ))
        .unwrap();
        conn.execute(&format!(
            "CREATE TRIGGER \"{audit}_tr\" AFTER INSERT ON \"{audit}\" \
             FOR EACH ROW EXECUTE PROCEDURE \"{audit}_fn\"();"
        ))
        .unwrap();
    }

    let mut state = items_state(&items, &items_v2);
    let migrator = Migrator::new(backend, MigrationConfig::new().with_batch_delay_ms(0));
    migrator
        .migrate(&mut state, &VersionId::new("v1"), &VersionId::new("v2"))
        .unwrap();

    let mut conn = migrator.backend().connect().unwrap();
    conn.execute(&format!("INSERT INTO \"{items}\" VALUES (2, 'direct', 'direct');"))
        .unwrap();
    conn.execute(&format!("INSERT INTO \"{audit}\" VALUES (3);"))
        .unwrap();
    assert_eq!(count(&mut conn, &items_v2), 3);

    // Writes to the ghost reach the source once, without bouncing back.
    conn.execute(&format!("INSERT INTO \"{items_v2}\" VALUES (4, 'ghost', 'ghost');"))
        .unwrap();
    conn.execute(&format!("UPDATE \"{items_v2}\" SET \"a\" = 'edited' WHERE \"id\" = 3;"))
        .unwrap();
    assert_eq!(count(&mut conn, &items), 4);
    assert_eq!(differing(&mut conn, &items, &items_v2, "\"id\", \"a\", \"b\""), 0);

    conn.execute(&format!(
        "DROP TABLE \"{audit}\", \"{items_v2}\", \"{items}\" CASCADE; DROP FUNCTION \"{audit}_fn\"();"
    ))
    .unwrap();
}
