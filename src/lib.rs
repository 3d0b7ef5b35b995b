//! chryso
//!
//! Nested-transaction coordinator with thread-affinity connection pooling.
//! Concurrent threads share one [`Engine`]; each thread transacts over its own
//! lazily created connection, nested units of work map onto SQL savepoints,
//! and driver failures are translated into a small, stable [`DbError`]
//! taxonomy.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use db::{Connection, ConnectionPool, Engine, Transaction};
pub use error::{DbError, DbResult, DriverError, DriverFailure, translate};
pub use models::{RowSet, SqlParam};
