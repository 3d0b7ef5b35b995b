//! Thread-affinity connection pool.
//!
//! Every calling thread gets exactly one connection, created lazily on its
//! first `acquire()` and reused until the pool is disposed or the thread
//! releases it. The registry below is the only state in the crate shared
//! across threads; connections themselves are never locked by the pool.

use crate::db::connection::{Connection, ConnectionFactory};
use crate::error::{DbError, DbResult, DriverError, translate};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct PoolRegistry {
    /// Affinity map used for reuse.
    by_thread: HashMap<ThreadId, Arc<dyn Connection>>,
    /// Every connection handed out since the last dispose, for bulk close.
    all: Vec<Arc<dyn Connection>>,
}

pub struct ConnectionPool {
    id: u64,
    factory: ConnectionFactory,
    registry: Mutex<PoolRegistry>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("ConnectionPool")
            .field("id", &self.id)
            .field("threads", &registry.by_thread.len())
            .field("connections", &registry.all.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool around a connection factory.
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            factory,
            registry: Mutex::new(PoolRegistry::default()),
        }
    }

    /// Create a pool from a plain closure.
    pub fn from_fn<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Connection>, DriverError> + Send + Sync + 'static,
    {
        Self::new(Arc::new(factory))
    }

    /// Process-unique identifier, used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the calling thread's connection, creating it on first use.
    ///
    /// # Thread exit
    ///
    /// The pool cannot observe a thread ending, so a connection stays open
    /// until [`release`](Self::release) or [`dispose`](Self::dispose). Worker
    /// threads that come and go should call `release()` before they exit.
    pub fn acquire(&self) -> DbResult<Arc<dyn Connection>> {
        let thread_id = thread::current().id();

        if let Some(conn) = self.registry.lock().by_thread.get(&thread_id) {
            return Ok(Arc::clone(conn));
        }

        // Only this thread ever inserts under its own key, so creating the
        // connection outside the lock cannot race with another insert.
        let conn: Arc<dyn Connection> = (self.factory)()
            .map(Arc::from)
            .map_err(|e| {
                DbError::connection_with_source(e, "Check the connection factory configuration")
            })?;

        {
            let mut registry = self.registry.lock();
            registry.by_thread.insert(thread_id, Arc::clone(&conn));
            registry.all.push(Arc::clone(&conn));
        }

        info!(
            pool_id = self.id,
            thread = ?thread_id,
            "Opened connection for thread"
        );

        Ok(conn)
    }

    /// Detach and close the calling thread's connection.
    ///
    /// Returns `false` if the thread had none. A transaction still open on
    /// the released connection can no longer execute; see
    /// [`Engine::execute`](crate::db::Engine::execute).
    ///
    /// # Thread exit
    ///
    /// Call this as the last pool operation of a short-lived thread, or its
    /// connection stays open until the pool is disposed.
    pub fn release(&self) -> DbResult<bool> {
        let thread_id = thread::current().id();

        let conn = {
            let mut registry = self.registry.lock();
            let Some(conn) = registry.by_thread.remove(&thread_id) else {
                return Ok(false);
            };
            registry.all.retain(|c| !Arc::ptr_eq(c, &conn));
            conn
        };

        debug!(pool_id = self.id, thread = ?thread_id, "Releasing thread connection");
        conn.close().map_err(translate)?;
        Ok(true)
    }

    /// Close every connection this pool created, then forget them.
    ///
    /// Best effort: a failure closing one connection is logged and the rest
    /// still get their close attempt. Never fails.
    pub fn dispose(&self) {
        let connections = {
            let mut registry = self.registry.lock();
            registry.by_thread.clear();
            std::mem::take(&mut registry.all)
        };

        let total = connections.len();
        let mut failed = 0usize;
        for conn in connections {
            if let Err(e) = conn.close() {
                failed += 1;
                warn!(pool_id = self.id, error = %e, "Failed to close connection during dispose");
            }
        }

        info!(
            pool_id = self.id,
            closed = total - failed,
            failed = failed,
            "Connection pool disposed"
        );
    }

    /// Build a fresh pool sharing this pool's factory.
    ///
    /// Existing connections are neither migrated nor closed; dispose the old
    /// pool separately.
    pub fn recreate(&self) -> Self {
        let pool = Self::new(Arc::clone(&self.factory));
        debug!(old_pool_id = self.id, new_pool_id = pool.id, "Recreated connection pool");
        pool
    }

    /// Check whether `conn` is still the calling thread's pooled connection.
    pub fn is_current(&self, conn: &Arc<dyn Connection>) -> bool {
        self.registry
            .lock()
            .by_thread
            .get(&thread::current().id())
            .is_some_and(|current| Arc::ptr_eq(current, conn))
    }

    /// Check whether the calling thread currently holds a connection.
    pub fn has_connection(&self) -> bool {
        self.registry
            .lock()
            .by_thread
            .contains_key(&thread::current().id())
    }

    /// Get the number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.lock().all.len()
    }
}
