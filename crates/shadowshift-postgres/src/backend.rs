//! sqlx-backed implementation of the migration engine's database seam.
//!
//! The engine is synchronous, so every call is driven to completion on a
//! tokio runtime owned by the backend. Do not call into this backend from
//! inside an async task.

use crate::config::PgConfig;
use crate::error::PgError;
use shadowshift_core::backend::{Backend, BackendError, Connection};
use shadowshift_core::{State, StateStore, Value};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// PostgreSQL backend: a connection pool plus the sled state store.
pub struct PgBackend {
    pool: PgPool,
    runtime: Arc<Runtime>,
    store: StateStore,
}

impl PgBackend {
    /// Connect the pool and open the state store.
    pub fn open(config: &PgConfig) -> Result<Self, PgError> {
        let runtime = Runtime::new()?;
        let pool = runtime.block_on(
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout)
                .connect(&config.database_url),
        )?;
        let store = StateStore::open_path(&config.state_path)?;

        info!(
            max_connections = config.max_connections,
            state_path = %config.state_path.display(),
            "Connected to PostgreSQL"
        );
        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
            store,
        })
    }

    /// Open a backend configured from the environment.
    pub fn from_env() -> Result<Self, PgError> {
        Self::open(&PgConfig::from_env()?)
    }

    /// The most recently persisted state, if any.
    pub fn load_state(&self) -> Result<Option<State>, PgError> {
        Ok(self.store.load()?)
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Backend for PgBackend {
    type Conn = PgConnection;

    fn connect(&self) -> Result<Self::Conn, BackendError> {
        let conn = self
            .runtime
            .block_on(self.pool.acquire())
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        debug!("Acquired connection");
        Ok(PgConnection {
            conn: Some(conn),
            runtime: Arc::clone(&self.runtime),
            in_transaction: false,
        })
    }

    fn persist_state(&self, state: &State) -> Result<(), BackendError> {
        self.store
            .save(state)
            .map_err(|e| BackendError::Persistence(e.to_string()))?;
        debug!("Persisted migration state");
        Ok(())
    }
}

/// A pooled connection. An open transaction is rolled back on drop.
pub struct PgConnection {
    conn: Option<PoolConnection<Postgres>>,
    runtime: Arc<Runtime>,
    in_transaction: bool,
}

impl PgConnection {
    fn raw(&mut self, sql: &str) -> Result<u64, BackendError> {
        let conn = self.conn.as_mut().ok_or_else(released)?;
        let result = self
            .runtime
            .block_on(sqlx::raw_sql(sql).execute(&mut **conn))
            .map_err(|e| BackendError::query(sql, e))?;
        Ok(result.rows_affected())
    }
}

fn released() -> BackendError {
    BackendError::Connection("connection already released".to_string())
}

impl Connection for PgConnection {
    fn execute(&mut self, sql: &str) -> Result<u64, BackendError> {
        self.raw(sql)
    }

    fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<u64, BackendError> {
        let conn = self.conn.as_mut().ok_or_else(released)?;
        let query = params
            .iter()
            .fold(sqlx::query(sql), |query, value| bind_value(query, value));
        let result = self
            .runtime
            .block_on(query.execute(&mut **conn))
            .map_err(|e| BackendError::query(sql, e))?;
        Ok(result.rows_affected())
    }

    fn query_i64(&mut self, sql: &str) -> Result<Option<i64>, BackendError> {
        let conn = self.conn.as_mut().ok_or_else(released)?;
        let value = self
            .runtime
            .block_on(sqlx::query_scalar::<_, Option<i64>>(sql).fetch_optional(&mut **conn))
            .map_err(|e| BackendError::query(sql, e))?;
        Ok(value.flatten())
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        self.raw("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        let result = self.raw("COMMIT");
        self.in_transaction = false;
        result.map(|_| ())
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        let result = self.raw("ROLLBACK");
        self.in_transaction = false;
        result.map(|_| ())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Err(e) = self.rollback() {
                warn!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
        // Returning the connection to the pool spawns onto the runtime.
        let _guard = self.runtime.enter();
        drop(self.conn.take());
    }
}

/// Bind one value. Statements cast every parameter explicitly, so text
/// stands in for NULL and for numerics.
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int16(v) => query.bind(*v),
        Value::Int32(v) => query.bind(*v),
        Value::Int64(v) => query.bind(*v),
        Value::Float64(v) => query.bind(*v),
        Value::Numeric(v) | Value::Text(v) => query.bind(v.clone()),
        Value::Bytes(v) => query.bind(v.clone()),
        Value::Uuid(v) => query.bind(*v),
        Value::Date(v) => query.bind(*v),
        Value::Timestamp(v) => query.bind(*v),
        Value::TimestampTz(v) => query.bind(*v),
        Value::Json(v) => query.bind(sqlx::types::Json(v.clone())),
    }
}
