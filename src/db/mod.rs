//! Database layer.
//!
//! - Connection seam and thread-affinity pooling
//! - Nested transactions over savepoints
//! - The engine façade and its optional process-wide slot
//! - A SQLite execution collaborator

pub mod connection;
pub mod engine;
pub mod params;
pub mod pool;
pub mod registry;
pub mod sqlite;
pub mod transaction;
pub mod types;

pub use connection::{Connection, ConnectionFactory};
pub use engine::Engine;
pub use pool::ConnectionPool;
pub use sqlite::SqliteConnection;
pub use transaction::{Outcome, SAVEPOINT_PREFIX, Transaction, TransactionContext};
