//! A backend that records statements instead of executing them.
//!
//! Used for dry runs (print what a migration would do) and as the test
//! double for the whole engine.

use super::{Backend, BackendError, Connection};
use crate::catalog::Value;
use crate::versioning::State;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One statement seen by a [`DryRunConnection`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    /// Statement text; transaction boundaries appear as `BEGIN`, `COMMIT`
    /// and `ROLLBACK`.
    pub sql: String,
    /// Bound parameters.
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
struct Journal {
    statements: Vec<RecordedStatement>,
    sequences: HashMap<String, i64>,
    scalars: Vec<(String, Option<i64>)>,
    row_counts: Vec<(String, u64)>,
    failures: Vec<String>,
    persisted: Vec<State>,
    fail_persist: bool,
}

impl Journal {
    fn record(&mut self, sql: &str, params: &[Value]) -> Result<(), BackendError> {
        self.statements.push(RecordedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        match self.failures.iter().find(|p| sql.contains(p.as_str())) {
            Some(pattern) => Err(BackendError::query(
                sql,
                format!("injected failure matching {pattern:?}"),
            )),
            None => Ok(()),
        }
    }

    fn rows(&self, sql: &str) -> u64 {
        self.row_counts
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map_or(0, |(_, rows)| *rows)
    }

    fn scalar(&mut self, sql: &str) -> Option<i64> {
        if let Some((_, value)) = self.scalars.iter().find(|(p, _)| sql.contains(p.as_str())) {
            return *value;
        }
        if sql.contains("NEXTVAL(") {
            let next = self.sequences.entry(sql.to_string()).or_insert(0);
            *next += 1;
            return Some(*next);
        }
        Some(0)
    }
}

/// Recording backend. Clones share one journal.
#[derive(Debug, Clone, Default)]
pub struct DryRunBackend {
    journal: Arc<Mutex<Journal>>,
}

impl DryRunBackend {
    /// Create a backend with an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement containing `pattern`.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.journal.lock().failures.push(pattern.into());
    }

    /// Fail every `persist_state` call.
    pub fn fail_persist(&self) {
        self.journal.lock().fail_persist = true;
    }

    /// Stop injecting statement and persistence failures.
    pub fn recover(&self) {
        let mut journal = self.journal.lock();
        journal.failures.clear();
        journal.fail_persist = false;
    }

    /// Answer scalar queries containing `pattern` with `value`.
    ///
    /// Unscripted `NEXTVAL` queries count up from 1 per sequence; any other
    /// unscripted query returns 0.
    pub fn respond(&self, pattern: impl Into<String>, value: Option<i64>) {
        self.journal.lock().scalars.push((pattern.into(), value));
    }

    /// Report `rows` affected rows for statements containing `pattern`.
    pub fn affect(&self, pattern: impl Into<String>, rows: u64) {
        self.journal.lock().row_counts.push((pattern.into(), rows));
    }

    /// Every recorded statement with its parameters.
    pub fn recorded(&self) -> Vec<RecordedStatement> {
        self.journal.lock().statements.clone()
    }

    /// Every recorded statement text.
    pub fn statements(&self) -> Vec<String> {
        self.journal
            .lock()
            .statements
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Recorded statements containing `pattern`.
    pub fn statements_matching(&self, pattern: &str) -> Vec<RecordedStatement> {
        self.journal
            .lock()
            .statements
            .iter()
            .filter(|s| s.sql.contains(pattern))
            .cloned()
            .collect()
    }

    /// Position of the first recorded statement containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.journal
            .lock()
            .statements
            .iter()
            .position(|s| s.sql.contains(pattern))
    }

    /// Every state passed to `persist_state`, oldest first.
    pub fn persisted(&self) -> Vec<State> {
        self.journal.lock().persisted.clone()
    }

    /// Forget recorded statements, keeping scripted behaviour.
    pub fn clear(&self) {
        self.journal.lock().statements.clear();
    }
}

impl Backend for DryRunBackend {
    type Conn = DryRunConnection;

    fn connect(&self) -> Result<Self::Conn, BackendError> {
        Ok(DryRunConnection {
            journal: Arc::clone(&self.journal),
        })
    }

    fn persist_state(&self, state: &State) -> Result<(), BackendError> {
        let mut journal = self.journal.lock();
        if journal.fail_persist {
            return Err(BackendError::Persistence("injected failure".to_string()));
        }
        journal.persisted.push(state.clone());
        Ok(())
    }
}

/// Connection handed out by [`DryRunBackend`].
#[derive(Debug)]
pub struct DryRunConnection {
    journal: Arc<Mutex<Journal>>,
}

impl Connection for DryRunConnection {
    fn execute(&mut self, sql: &str) -> Result<u64, BackendError> {
        self.execute_with(sql, &[])
    }

    fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<u64, BackendError> {
        let mut journal = self.journal.lock();
        journal.record(sql, params)?;
        Ok(journal.rows(sql))
    }

    fn query_i64(&mut self, sql: &str) -> Result<Option<i64>, BackendError> {
        let mut journal = self.journal.lock();
        journal.record(sql, &[])?;
        Ok(journal.scalar(sql))
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        self.journal.lock().record("BEGIN", &[])
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.journal.lock().record("COMMIT", &[])
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        self.journal.lock().record("ROLLBACK", &[])
    }
}
