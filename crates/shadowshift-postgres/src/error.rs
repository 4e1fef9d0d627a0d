//! Error types for the PostgreSQL backend.

use shadowshift_core::BackendError;
use thiserror::Error;

/// Errors raised while setting up the PostgreSQL backend.
#[derive(Debug, Error)]
pub enum PgError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The async runtime could not be started.
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// Driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The state store could not be opened.
    #[error("state store error: {0}")]
    State(#[from] shadowshift_core::Error),
}

impl From<PgError> for BackendError {
    fn from(e: PgError) -> Self {
        match e {
            PgError::State(e) => BackendError::Persistence(e.to_string()),
            other => BackendError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_errors_become_persistence_errors() {
        let error = PgError::State(shadowshift_core::Error::Serialization("bad".into()));
        assert!(matches!(BackendError::from(error), BackendError::Persistence(_)));

        let error = PgError::Config("DATABASE_URL is not set".into());
        assert_eq!(
            BackendError::from(error),
            BackendError::Connection("configuration error: DATABASE_URL is not set".into())
        );
    }
}
