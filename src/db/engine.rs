//! The engine façade.
//!
//! [`Engine`] is the only sanctioned entry point: statements go through
//! [`Engine::execute`], transactions through [`Engine::atomic`] or
//! [`Engine::begin`]. It is `Send + Sync`; share it between threads behind an
//! `Arc` and every thread transparently gets its own connection and its own
//! transaction stack.

use crate::config::DatabaseConfig;
use crate::db::connection::{Connection, ConnectionFactory};
use crate::db::pool::ConnectionPool;
use crate::db::sqlite::SqliteConnection;
use crate::db::transaction::{self, Transaction};
use crate::error::{DbError, DbResult, translate};
use crate::models::{RowSet, SqlParam};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct Engine {
    id: u64,
    pool: ConnectionPool,
}

impl Engine {
    /// Create an engine over an existing pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            pool,
        }
    }

    /// Create an engine whose pool uses `factory`.
    pub fn from_factory(factory: ConnectionFactory) -> Self {
        Self::new(ConnectionPool::new(factory))
    }

    /// Create a SQLite-backed engine from a parsed database configuration.
    ///
    /// Connections are opened lazily, one per calling thread.
    pub fn connect(config: &DatabaseConfig) -> DbResult<Self> {
        let options = SqliteConnection::options(config)?;
        let factory: ConnectionFactory = Arc::new(move || {
            SqliteConnection::open_with(options.clone())
                .map(|conn| Box::new(conn) as Box<dyn Connection>)
        });
        Ok(Self::from_factory(factory))
    }

    /// Process-unique identifier; keys this engine's per-thread stacks.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Execute a statement on the calling thread's connection.
    ///
    /// Driver failures are translated into [`DbError`]; the raw error is only
    /// kept as the error's source.
    ///
    /// Inside a transaction the statement goes to the connection the
    /// transaction began on. If the pool has since dropped that connection
    /// (a `dispose()` or `release()` while the block was open), the statement
    /// is refused with [`DbError::TransactionState`] rather than run on a
    /// fresh connection outside the transaction.
    pub fn execute(&self, sql: &str, params: &[SqlParam]) -> DbResult<RowSet> {
        let conn = match transaction::pinned_connection(self.id) {
            Some((transaction_id, conn)) => {
                if !self.pool.is_current(&conn) {
                    warn!(
                        engine_id = self.id,
                        transaction_id = %transaction_id,
                        sql = %sql,
                        "Connection left the pool while its transaction was open"
                    );
                    return Err(DbError::transaction_state(
                        "Connection was released or disposed while the transaction was open",
                        transaction_id,
                    ));
                }
                conn
            }
            None => self.pool.acquire()?,
        };

        debug!(
            engine_id = self.id,
            depth = ?self.depth(),
            thread = ?std::thread::current().id(),
            sql = %sql,
            params = params.len(),
            "Executing statement"
        );

        conn.execute(sql, params).map_err(|e| {
            let err = translate(e);
            debug!(engine_id = self.id, sql = %sql, error = %err, "Statement failed");
            err
        })
    }

    /// Open a transaction, or a savepoint if one is already open on this thread.
    ///
    /// The returned guard rolls back on drop unless committed or rolled back
    /// explicitly. Prefer [`Engine::atomic`], which commits on success.
    pub fn begin(&self) -> DbResult<Transaction<'_>> {
        Transaction::begin(self)
    }

    /// Run `f` inside a (possibly nested) transaction.
    ///
    /// `Ok` commits (or releases the savepoint) unless `f` already resolved
    /// the transaction itself. `Err` rolls back (or back to the savepoint) and
    /// returns the error unchanged. A panic rolls back while unwinding. In
    /// every case the transaction is popped before this returns. Enclosing
    /// transactions are left untouched.
    pub fn atomic<'e, T, E, F>(&'e self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'e>) -> Result<T, E>,
        E: From<DbError>,
    {
        let tx = self.begin()?;

        match f(&tx) {
            Ok(value) => {
                if tx.is_active() {
                    tx.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                if tx.is_active() {
                    if let Err(e) = tx.rollback() {
                        warn!(
                            transaction_id = %tx.id(),
                            error = %e,
                            "Rollback after failed block did not complete"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Depth of the innermost open transaction on this thread.
    pub fn depth(&self) -> Option<usize> {
        transaction::current_depth(self.id)
    }

    pub fn in_transaction(&self) -> bool {
        self.depth().is_some()
    }

    /// Close every pooled connection. See [`ConnectionPool::dispose`].
    pub fn dispose(&self) {
        self.pool.dispose();
    }
}
