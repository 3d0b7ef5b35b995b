//! The execution collaborator seam.
//!
//! A [`Connection`] is a live handle to the database. The pool hands each
//! thread its own instance, so implementations are only ever driven by one
//! thread at a time; the `Sync` bound exists so the pool's registry can hold
//! them for bulk disposal.

use crate::error::DriverError;
use crate::models::{RowSet, SqlParam};
use std::sync::Arc;

pub trait Connection: Send + Sync {
    /// Run one statement and return whatever rows it produced.
    fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<RowSet, DriverError>;

    /// Close the underlying handle. Further `execute` calls should fail.
    fn close(&self) -> Result<(), DriverError>;
}

/// Zero-argument factory producing a new live connection.
///
/// DSN, credentials and TLS are the factory's concern; the pool only calls it.
pub type ConnectionFactory =
    Arc<dyn Fn() -> Result<Box<dyn Connection>, DriverError> + Send + Sync>;

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Connection")
    }
}
