//! SQLite execution collaborator backed by sqlx.
//!
//! sqlx is async-only, so each [`SqliteConnection`] owns a small
//! current-thread tokio runtime and blocks on it per statement. Do not call
//! into it from inside another async runtime's worker thread.

use crate::config::DatabaseConfig;
use crate::db::connection::Connection;
use crate::db::params::bind_sqlite_param;
use crate::db::types::{column_names, row_to_json};
use crate::error::{DbError, DbResult, DriverError};
use crate::models::{RowSet, SqlParam};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{ConnectOptions, Connection as _};
use std::str::FromStr;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

pub struct SqliteConnection {
    runtime: Runtime,
    /// `None` once closed.
    conn: Mutex<Option<sqlx::SqliteConnection>>,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("closed", &self.conn.lock().is_none())
            .finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Build connect options from a parsed configuration.
    pub fn options(config: &DatabaseConfig) -> DbResult<SqliteConnectOptions> {
        let options = SqliteConnectOptions::from_str(&config.connection_string).map_err(|e| {
            DbError::connection(
                format!("Invalid SQLite connection string: {}", e),
                "Check the connection URL format: sqlite:path/to/db.sqlite",
            )
        })?;
        Ok(options.create_if_missing(config.create_if_missing))
    }

    /// Open a connection from a URL such as `sqlite::memory:` or `sqlite:data.db`.
    pub fn open(url: &str) -> Result<Self, DriverError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        Self::open_with(options)
    }

    pub fn open_with(options: SqliteConnectOptions) -> Result<Self, DriverError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let conn = runtime.block_on(options.connect())?;

        debug!("Opened SQLite connection");

        Ok(Self {
            runtime,
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }
}

fn closed_error() -> DriverError {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "SQLite connection is closed",
    ))
}

impl Connection for SqliteConnection {
    fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<RowSet, DriverError> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or_else(closed_error)?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }

        let rows: Vec<SqliteRow> = self.runtime.block_on(query.fetch_all(&mut *conn))?;

        let columns = rows.first().map(column_names).unwrap_or_default();
        let rows = rows.iter().map(row_to_json).collect();
        Ok(RowSet::new(columns, rows))
    }

    fn close(&self) -> Result<(), DriverError> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        self.runtime.block_on(conn.close())?;
        Ok(())
    }
}
