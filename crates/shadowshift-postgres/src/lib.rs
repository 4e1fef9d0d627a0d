//! PostgreSQL backend for shadowshift.
//!
//! Provides [`PgBackend`], which runs the migration engine's statements
//! over an sqlx connection pool and persists migration state in a local
//! sled store.
//!
//! ```ignore
//! use shadowshift_core::{MigrationConfig, Migrator, VersionId};
//! use shadowshift_postgres::PgBackend;
//!
//! let backend = PgBackend::from_env()?;
//! let mut state = backend.load_state()?.unwrap_or_default();
//! let migrator = Migrator::new(backend, MigrationConfig::default());
//! migrator.migrate(&mut state, &VersionId::new("v1"), &VersionId::new("v2"))?;
//! ```

pub mod backend;
pub mod config;
pub mod error;

pub use backend::{PgBackend, PgConnection};
pub use config::PgConfig;
pub use error::PgError;
