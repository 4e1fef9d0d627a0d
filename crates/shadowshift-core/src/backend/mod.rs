//! Database access seam.
//!
//! The migration engine talks to the database only through [`Backend`] and
//! [`Connection`]. Connections are blocking: each call returns once the
//! database has replied.

mod dry_run;

pub use dry_run::{DryRunBackend, DryRunConnection, RecordedStatement};

use crate::catalog::Value;
use crate::versioning::State;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Acquiring a connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A statement was rejected by the database.
    #[error("statement failed: {message} (statement: {statement})")]
    Query {
        /// The offending statement.
        statement: String,
        /// Database error message.
        message: String,
    },

    /// Persisting migration state failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl BackendError {
    /// Build a query error for a statement.
    pub fn query(statement: &str, message: impl std::fmt::Display) -> Self {
        BackendError::Query {
            statement: statement.to_string(),
            message: message.to_string(),
        }
    }
}

/// A live database connection.
pub trait Connection {
    /// Execute a statement without parameters, returning affected rows.
    fn execute(&mut self, sql: &str) -> Result<u64, BackendError>;

    /// Execute a statement binding `params` to `$1..$n`.
    fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<u64, BackendError>;

    /// Run a query returning at most one integer in its first column.
    fn query_i64(&mut self, sql: &str) -> Result<Option<i64>, BackendError>;

    /// Open a transaction.
    fn begin(&mut self) -> Result<(), BackendError>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<(), BackendError>;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> Result<(), BackendError>;
}

/// Source of connections plus the state persistence collaborator.
pub trait Backend {
    /// Connection type handed out by this backend.
    type Conn: Connection;

    /// Acquire a connection. It is released when dropped.
    fn connect(&self) -> Result<Self::Conn, BackendError>;

    /// Atomically persist the migration bookkeeping state.
    fn persist_state(&self, state: &State) -> Result<(), BackendError>;
}

/// Run `f` inside a transaction, committing on success.
///
/// The transaction is rolled back when `f` fails; a rollback failure is
/// logged and the original error returned.
pub fn in_transaction<C, T, E, F>(conn: &mut C, f: F) -> Result<T, E>
where
    C: Connection + ?Sized,
    E: From<BackendError>,
    F: FnOnce(&mut C) -> Result<T, E>,
{
    conn.begin()?;
    match f(conn) {
        Ok(value) => {
            conn.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.rollback() {
                tracing::warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// Connection wrapper that logs every statement.
///
/// Statements go to `debug`, or to `info` when `verbose` is set.
pub struct LoggedConnection<'a, C: ?Sized> {
    inner: &'a mut C,
    verbose: bool,
}

impl<'a, C: Connection + ?Sized> LoggedConnection<'a, C> {
    /// Wrap a connection.
    pub fn new(inner: &'a mut C, verbose: bool) -> Self {
        Self { inner, verbose }
    }

    fn log(&self, sql: &str, params: usize) {
        if self.verbose {
            info!(params, "{sql}");
        } else {
            debug!(params, "{sql}");
        }
    }
}

impl<C: Connection + ?Sized> Connection for LoggedConnection<'_, C> {
    fn execute(&mut self, sql: &str) -> Result<u64, BackendError> {
        self.log(sql, 0);
        self.inner.execute(sql)
    }

    fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<u64, BackendError> {
        self.log(sql, params.len());
        self.inner.execute_with(sql, params)
    }

    fn query_i64(&mut self, sql: &str) -> Result<Option<i64>, BackendError> {
        self.log(sql, 0);
        self.inner.query_i64(sql)
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        self.log("BEGIN", 0);
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.log("COMMIT", 0);
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        self.log("ROLLBACK", 0);
        self.inner.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_transaction_commits() {
        let backend = DryRunBackend::new();
        let mut conn = backend.connect().unwrap();
        let rows = in_transaction(&mut conn, |c| c.execute("DELETE FROM \"t\";")).unwrap();
        assert_eq!(rows, 0);
        assert_eq!(backend.statements(), vec!["BEGIN", "DELETE FROM \"t\";", "COMMIT"]);
    }

    #[test]
    fn test_in_transaction_rolls_back() {
        let backend = DryRunBackend::new();
        backend.fail_on("DELETE");
        let mut conn = backend.connect().unwrap();
        let result = in_transaction(&mut conn, |c| c.execute("DELETE FROM \"t\";"));
        assert!(matches!(result, Err(BackendError::Query { .. })));
        assert_eq!(backend.statements(), vec!["BEGIN", "DELETE FROM \"t\";", "ROLLBACK"]);
    }

    #[test]
    fn test_logged_connection_forwards() {
        let backend = DryRunBackend::new();
        let mut conn = backend.connect().unwrap();
        let mut logged = LoggedConnection::new(&mut conn, true);
        logged.execute_with("DELETE FROM \"t\" WHERE \"id\" = $1::bigint;", &[Value::Int64(7)]).unwrap();

        let recorded = backend.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].params, vec![Value::Int64(7)]);
    }
}
